// 该文件是 Qiushui （秋水） 项目的一部分。
// src/model.rs - 推理后端与模型
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

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod cache;
mod native;
#[cfg(feature = "rknpu_backend")]
mod rknn;

pub use self::cache::{CacheError, DeviceModelCache, DeviceModelEntry, MAX_DEVICE_SIZE};
pub use self::native::{
  NativeBackend, NativeInputSpec, NativeModel, NativeModelFile, NativeOutputSpec,
};
#[cfg(feature = "rknpu_backend")]
pub use self::rknn::RknpuBackend;

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型加载错误 {path}: {source}")]
  Load {
    path: String,
    source: std::io::Error,
  },
  #[error("模型文件无效: {0}")]
  Invalid(String),
  #[error("找不到输入张量: {0}")]
  InputNotFound(String),
  #[error("找不到输出张量: {0}")]
  OutputNotFound(String),
  #[error("输入长度不匹配: 期望 {expected}, 实际 {actual}")]
  InputSizeMismatch { expected: usize, actual: usize },
  #[error("输入类型不匹配: 期望 {expected}, 实际 {actual}")]
  InputTypeMismatch {
    expected: ElementType,
    actual: ElementType,
  },
  #[error("无法选择设备 {0}")]
  Device(u32),
  #[error("推理后端不可用: {0}")]
  BackendUnavailable(BackendKind),
  #[cfg(feature = "rknpu_backend")]
  #[error("RKNN 错误: {0}")]
  Rknpu(#[from] rknpu::Error),
}

/// 张量元素类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
  Float32,
  UInt8,
}

impl fmt::Display for ElementType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ElementType::Float32 => write!(f, "float32"),
      ElementType::UInt8 => write!(f, "uint8"),
    }
  }
}

/// 模型输入/输出张量描述（NHWC）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDescriptor {
  pub width: usize,
  pub height: usize,
  pub channels: usize,
  pub element_type: ElementType,
}

impl TensorDescriptor {
  pub fn element_count(&self) -> usize {
    self.width * self.height * self.channels
  }
}

/// 送入模型的张量数据
#[derive(Debug, Clone, PartialEq)]
pub enum TensorBuffer {
  Float32(Box<[f32]>),
  UInt8(Box<[u8]>),
}

impl TensorBuffer {
  pub fn zeroed(descriptor: &TensorDescriptor) -> Self {
    let len = descriptor.element_count();
    match descriptor.element_type {
      ElementType::Float32 => TensorBuffer::Float32(vec![0.0; len].into_boxed_slice()),
      ElementType::UInt8 => TensorBuffer::UInt8(vec![0; len].into_boxed_slice()),
    }
  }

  /// 由打包的 RGB 字节构造张量
  ///
  /// 浮点张量按 `byte / 255.0` 缩放，整型张量直接复制。
  pub fn from_packed(element_type: ElementType, data: &[u8]) -> Self {
    match element_type {
      ElementType::Float32 => {
        TensorBuffer::Float32(data.iter().map(|&v| v as f32 / 255.0).collect())
      }
      ElementType::UInt8 => TensorBuffer::UInt8(data.into()),
    }
  }

  pub fn element_type(&self) -> ElementType {
    match self {
      TensorBuffer::Float32(_) => ElementType::Float32,
      TensorBuffer::UInt8(_) => ElementType::UInt8,
    }
  }

  pub fn len(&self) -> usize {
    match self {
      TensorBuffer::Float32(data) => data.len(),
      TensorBuffer::UInt8(data) => data.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// 模型输出：展平后的浮点数组
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelOutput {
  values: Vec<f32>,
}

impl ModelOutput {
  pub fn new(values: Vec<f32>) -> Self {
    Self { values }
  }

  pub fn values(&self) -> &[f32] {
    &self.values
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  pub fn first(&self) -> Option<f32> {
    self.values.first().copied()
  }
}

/// 推理后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
  #[default]
  Native,
  Rknpu,
}

impl fmt::Display for BackendKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BackendKind::Native => write!(f, "native"),
      BackendKind::Rknpu => write!(f, "rknpu"),
    }
  }
}

impl FromStr for BackendKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "native" => Ok(BackendKind::Native),
      "rknpu" => Ok(BackendKind::Rknpu),
      other => Err(format!("未知的推理后端: {}", other)),
    }
  }
}

/// 注册与绑定时使用的模型参数
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModelParams {
  pub model_path: String,
  pub input_name: String,
  pub output_name: String,
}

impl ModelParams {
  pub fn new(
    model_path: impl Into<String>,
    input_name: impl Into<String>,
    output_name: impl Into<String>,
  ) -> Self {
    Self {
      model_path: model_path.into(),
      input_name: input_name.into(),
      output_name: output_name.into(),
    }
  }

  pub fn is_blank(&self) -> bool {
    self.model_path.trim().is_empty()
      || self.input_name.trim().is_empty()
      || self.output_name.trim().is_empty()
  }
}

/// 推理后端：负责选择设备并加载模型
pub trait InferenceBackend {
  fn kind(&self) -> BackendKind;
  fn set_device(&self, device_id: u32) -> Result<(), ModelError>;
  fn load_model(&self, path: &str, device_id: u32) -> Result<Box<dyn LoadedModel>, ModelError>;
}

/// 已加载的模型
pub trait LoadedModel {
  fn get_input(&self, name: &str) -> Result<TensorDescriptor, ModelError>;

  fn set_input_output(
    &mut self,
    input: &TensorDescriptor,
    input_name: &str,
    output_names: &[&str],
  ) -> Result<(), ModelError>;

  fn execute(&self, input: &TensorBuffer, batch_size: usize) -> Result<ModelOutput, ModelError>;
}

/// 按类型创建默认配置的推理后端
pub fn create_backend(kind: BackendKind) -> Result<Box<dyn InferenceBackend>, ModelError> {
  match kind {
    BackendKind::Native => Ok(Box::new(NativeBackend)),
    #[cfg(feature = "rknpu_backend")]
    BackendKind::Rknpu => Ok(Box::new(RknpuBackend::default())),
    #[cfg(not(feature = "rknpu_backend"))]
    BackendKind::Rknpu => Err(ModelError::BackendUnavailable(kind)),
  }
}
