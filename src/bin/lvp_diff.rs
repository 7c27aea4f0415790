// 该文件是 Qiushui （秋水） 项目的一部分。
// src/bin/lvp_diff.rs - 双路视频差异采样
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use anyhow::Result;
use clap::Parser;
use url::Url;

use qiushui::{
  FromUrl,
  diff::{DiffOptions, LvpDiffFilter, PsnrEngine},
  input::InputWrapper,
  output::OutputWrapper,
  task::DiffTask,
};
use tracing::info;

/// 秋水差异采样参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 滤镜选项，例如 lvpdiff://?stats_file=-
  #[arg(long, value_name = "OPTIONS", default_value = "lvpdiff://")]
  pub options: Url,
  /// 主流输入来源
  #[arg(long, value_name = "SOURCE")]
  pub main: Url,
  /// 参考流输入来源
  #[arg(long, value_name = "SOURCE")]
  pub reference: Url,
  /// 主流帧的输出
  #[arg(long, value_name = "OUTPUT", default_value = "null://")]
  pub output: Url,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("滤镜选项: {}", args.options);
  info!("主流来源: {}", args.main);
  info!("参考流来源: {}", args.reference);
  info!("输出路径: {}", args.output);

  let options = DiffOptions::from_url(&args.options)?;
  let main = InputWrapper::from_url(&args.main)?;
  let reference = InputWrapper::from_url(&args.reference)?;
  let output = OutputWrapper::from_url(&args.output)?;
  let filter = LvpDiffFilter::new(&options, Box::new(PsnrEngine))?;

  let scores = DiffTask::default()
    .with_frame_number(args.frame_number)
    .with_interrupt(true)
    .run(filter, main, reference, output)?;

  match scores {
    Some(scores) => info!("最终得分: {:?}", scores),
    None => info!("没有采样到帧对"),
  }

  Ok(())
}
