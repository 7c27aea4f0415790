// 该文件是 Qiushui （秋水） 项目的一部分。
// src/output/metadata_record.rs - 帧元数据目录记录输出
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{Datelike, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{FrameMetadata, VideoFrame},
  output::FrameSink,
};

#[derive(Error, Debug)]
pub enum MetadataRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct FrameRecord<'a> {
  index: u64,
  pts: i64,
  width: usize,
  height: usize,
  metadata: &'a FrameMetadata,
}

/// 以 JSON 行的形式把帧元数据记录到 `目录/年/月/日/` 下
///
/// 默认只记录带元数据的帧，`always` 参数记录全部帧。
pub struct MetadataRecordOutput {
  directory: PathBuf,
  always: bool,
  writer: Option<BufWriter<File>>,
  index: u64,
  records: u64,
}

impl FromUrlWithScheme for MetadataRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for MetadataRecordOutput {
  type Error = MetadataRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(MetadataRecordOutputError::SchemeMismatch);
    }

    let always = uri.query_pairs().any(|(k, _)| k == "always");
    Ok(Self::new(uri.path(), always))
  }
}

impl MetadataRecordOutput {
  pub fn new(directory: impl AsRef<Path>, always: bool) -> Self {
    Self {
      directory: directory.as_ref().to_path_buf(),
      always,
      writer: None,
      index: 0,
      records: 0,
    }
  }

  /// 已记录的帧数
  pub fn records(&self) -> u64 {
    self.records
  }

  fn record_path(&self) -> Result<PathBuf, MetadataRecordOutputError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }

    Ok(directory.join(format!("{}.jsonl", now.format("%H-%M-%S"))))
  }

  fn open(&self) -> Result<BufWriter<File>, MetadataRecordOutputError> {
    let path = self.record_path()?;
    info!("记录帧元数据到 {}", path.display());
    Ok(BufWriter::new(File::create(path)?))
  }
}

impl FrameSink for MetadataRecordOutput {
  type Error = MetadataRecordOutputError;

  fn write_frame(&mut self, frame: &VideoFrame) -> Result<(), Self::Error> {
    let index = self.index;
    self.index += 1;
    if !self.always && frame.metadata().is_empty() {
      return Ok(());
    }

    let record = FrameRecord {
      index,
      pts: frame.pts(),
      width: frame.width(),
      height: frame.height(),
      metadata: frame.metadata(),
    };
    let line = serde_json::to_string(&record)?;
    if self.writer.is_none() {
      self.writer = Some(self.open()?);
    }
    if let Some(writer) = self.writer.as_mut() {
      writeln!(writer, "{}", line)?;
      self.records += 1;
    }
    Ok(())
  }

  fn finish(&mut self) -> Result<(), Self::Error> {
    if let Some(writer) = self.writer.as_mut() {
      writer.flush()?;
    }
    info!("共记录 {} 帧元数据", self.records);
    Ok(())
  }
}
