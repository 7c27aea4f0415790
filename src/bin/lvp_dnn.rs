// 该文件是 Qiushui （秋水） 项目的一部分。
// src/bin/lvp_dnn.rs - 抽帧推理
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
  dnn::{DnnOptions, LvpDnnFilter},
  input::InputWrapper,
  model::{DeviceModelCache, create_backend},
  output::OutputWrapper,
  task::DnnTask,
};
use tracing::info;

/// 秋水抽帧推理参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 滤镜选项，例如 lvpdnn://classify?model=m.json&input=data&output=prob
  #[arg(long, value_name = "OPTIONS")]
  pub options: Url,
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT", default_value = "null://")]
  pub output: Url,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("滤镜选项: {}", args.options);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let options = DnnOptions::from_url(&args.options)?;
  let backend = create_backend(options.backend)?;

  let mut cache = DeviceModelCache::new();
  cache.register_devices(backend.as_ref(), &options.params(), &options.device_list())?;
  let filter = LvpDnnFilter::bind(&options, &cache)?;

  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;

  let executed = DnnTask::default()
    .with_frame_number(args.frame_number)
    .with_interrupt(true)
    .run(filter, input, output)?;
  info!("共推理 {} 帧", executed);

  cache.unregister_all();
  Ok(())
}
