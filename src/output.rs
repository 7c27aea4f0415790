// 该文件是 Qiushui （秋水） 项目的一部分。
// src/output.rs - 输出定义
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

use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::frame::VideoFrame;
use crate::{FromUrl, FromUrlWithScheme};

/// 滤镜下游的帧接收端
pub trait FrameSink {
  type Error;
  fn write_frame(&mut self, frame: &VideoFrame) -> Result<(), Self::Error>;

  fn finish(&mut self) -> Result<(), Self::Error> {
    Ok(())
  }
}

#[cfg(feature = "metadata_record")]
mod metadata_record;
#[cfg(feature = "metadata_record")]
pub use self::metadata_record::{MetadataRecordOutput, MetadataRecordOutputError};

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "metadata_record")]
  #[error("元数据记录输出错误: {0}")]
  MetadataRecordOutputError(#[from] MetadataRecordOutputError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 丢弃所有帧
#[derive(Debug, Default)]
pub struct NullOutput {
  frames: u64,
}

impl NullOutput {
  pub fn frames(&self) -> u64 {
    self.frames
  }
}

impl FromUrlWithScheme for NullOutput {
  const SCHEME: &'static str = "null";
}

impl FromUrl for NullOutput {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch(url.scheme().to_string()));
    }
    Ok(NullOutput::default())
  }
}

impl FrameSink for NullOutput {
  type Error = OutputError;

  fn write_frame(&mut self, frame: &VideoFrame) -> Result<(), Self::Error> {
    self.frames += 1;
    debug!("丢弃第 {} 帧 (pts {})", self.frames, frame.pts());
    Ok(())
  }
}

pub enum OutputWrapper {
  #[cfg(feature = "metadata_record")]
  MetadataRecordOutput(MetadataRecordOutput),
  NullOutput(NullOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      #[cfg(feature = "metadata_record")]
      MetadataRecordOutput::SCHEME => {
        let output = MetadataRecordOutput::from_url(url)?;
        Ok(OutputWrapper::MetadataRecordOutput(output))
      }
      NullOutput::SCHEME => Ok(OutputWrapper::NullOutput(NullOutput::from_url(url)?)),
      other => Err(OutputError::SchemeMismatch(other.to_string())),
    }
  }
}

impl FrameSink for OutputWrapper {
  type Error = OutputError;

  fn write_frame(&mut self, frame: &VideoFrame) -> Result<(), Self::Error> {
    match self {
      #[cfg(feature = "metadata_record")]
      OutputWrapper::MetadataRecordOutput(output) => {
        output.write_frame(frame).map_err(OutputError::from)
      }
      OutputWrapper::NullOutput(output) => output.write_frame(frame),
    }
  }

  fn finish(&mut self) -> Result<(), Self::Error> {
    match self {
      #[cfg(feature = "metadata_record")]
      OutputWrapper::MetadataRecordOutput(output) => output.finish().map_err(OutputError::from),
      OutputWrapper::NullOutput(output) => output.finish(),
    }
  }
}
