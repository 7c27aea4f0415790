// 该文件是 Qiushui （秋水） 项目的一部分。
// src/error.rs - 滤镜错误分类
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

use crate::diff::BatchError;
use crate::frame::FrameError;
use crate::model::{CacheError, ModelError};
use crate::normalize::NormalizeError;

/// 错误类别
///
/// - 配置错误在绑定阶段致命
/// - 资源耗尽在调用处致命
/// - I/O 错误只影响当前帧
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  Configuration,
  ResourceExhausted,
  Io,
}

#[derive(Error, Debug)]
pub enum FilterError {
  #[error("配置错误: {0}")]
  Config(String),
  #[error("模型缓存错误: {0}")]
  Cache(#[from] CacheError),
  #[error("资源耗尽: {0}")]
  ResourceExhausted(String),
  #[error("帧累积错误: {0}")]
  Batch(#[from] BatchError),
  #[error("归一化错误: {0}")]
  Normalize(#[from] NormalizeError),
  #[error("硬件帧下载失败: {0}")]
  Download(#[from] FrameError),
  #[error("模型执行失败: {0}")]
  Execute(#[from] ModelError),
  #[error("文件错误 {path}: {source}")]
  File {
    path: String,
    source: std::io::Error,
  },
}

impl FilterError {
  pub fn config(msg: impl Into<String>) -> Self {
    FilterError::Config(msg.into())
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      FilterError::Config(_) | FilterError::Cache(_) | FilterError::File { .. } => {
        ErrorKind::Configuration
      }
      FilterError::ResourceExhausted(_) | FilterError::Batch(_) => ErrorKind::ResourceExhausted,
      FilterError::Normalize(_) | FilterError::Download(_) | FilterError::Execute(_) => {
        ErrorKind::Io
      }
    }
  }

  /// 是否仅影响当前帧
  pub fn is_frame_local(&self) -> bool {
    self.kind() == ErrorKind::Io
  }
}
