// 该文件是 Qiushui （秋水） 项目的一部分。
// src/model/native.rs - 纯 Rust 推理后端
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

//! 基于 JSON 描述文件的轻量模型。
//!
//! 每个输出是对各通道均值的逻辑回归：
//! `sigmoid(bias + Σ weights[c] * mean[c])`，均值按 `[0, 1]` 计算。
//!
//! ```json
//! {
//!   "input": { "name": "data", "width": 64, "height": 64, "channels": 3, "element_type": "float32" },
//!   "outputs": [ { "name": "prob", "weights": [2.0, 2.0, 2.0], "bias": -3.0 } ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::{
  BackendKind, InferenceBackend, LoadedModel, MAX_DEVICE_SIZE, ModelError, ModelOutput,
  TensorBuffer, TensorDescriptor,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeInputSpec {
  pub name: String,
  #[serde(flatten)]
  pub descriptor: TensorDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeOutputSpec {
  pub name: String,
  pub weights: Vec<f32>,
  #[serde(default)]
  pub bias: f32,
}

/// 模型描述文件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeModelFile {
  pub input: NativeInputSpec,
  pub outputs: Vec<NativeOutputSpec>,
}

impl NativeModelFile {
  pub fn parse(text: &str) -> Result<Self, ModelError> {
    let file: NativeModelFile =
      serde_json::from_str(text).map_err(|e| ModelError::Invalid(e.to_string()))?;
    if file.input.descriptor.element_count() == 0 {
      return Err(ModelError::Invalid("输入张量大小为 0".to_string()));
    }
    if let Some(output) = file
      .outputs
      .iter()
      .find(|o| o.weights.len() != file.input.descriptor.channels)
    {
      return Err(ModelError::Invalid(format!(
        "输出 {} 的权重数量 {} 与通道数 {} 不一致",
        output.name,
        output.weights.len(),
        file.input.descriptor.channels
      )));
    }
    Ok(file)
  }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBackend;

impl InferenceBackend for NativeBackend {
  fn kind(&self) -> BackendKind {
    BackendKind::Native
  }

  fn set_device(&self, device_id: u32) -> Result<(), ModelError> {
    if device_id as usize >= MAX_DEVICE_SIZE {
      return Err(ModelError::Device(device_id));
    }
    debug!("使用 CPU 设备 {}", device_id);
    Ok(())
  }

  fn load_model(&self, path: &str, device_id: u32) -> Result<Box<dyn LoadedModel>, ModelError> {
    let text = std::fs::read_to_string(path).map_err(|source| ModelError::Load {
      path: path.to_string(),
      source,
    })?;
    let file = NativeModelFile::parse(&text)?;
    info!(
      "设备 {} 加载模型 {}: 输入 {}, 输出 {} 个",
      device_id,
      path,
      file.input.name,
      file.outputs.len()
    );
    Ok(Box::new(NativeModel::new(file)))
  }
}

pub struct NativeModel {
  file: NativeModelFile,
  selected: Vec<usize>,
}

impl NativeModel {
  pub fn new(file: NativeModelFile) -> Self {
    let selected = (0..file.outputs.len()).collect();
    Self { file, selected }
  }

  fn channel_means(&self, sample: Sample<'_>) -> Vec<f32> {
    let channels = self.file.input.descriptor.channels;
    let mut sums = vec![0.0f64; channels];
    match sample {
      Sample::Float32(data) => {
        for (i, &v) in data.iter().enumerate() {
          sums[i % channels] += v as f64;
        }
      }
      Sample::UInt8(data) => {
        for (i, &v) in data.iter().enumerate() {
          sums[i % channels] += v as f64 / 255.0;
        }
      }
    }
    let per_channel = (sample.len() / channels).max(1) as f64;
    sums.into_iter().map(|s| (s / per_channel) as f32).collect()
  }
}

#[derive(Clone, Copy)]
enum Sample<'a> {
  Float32(&'a [f32]),
  UInt8(&'a [u8]),
}

impl Sample<'_> {
  fn len(&self) -> usize {
    match self {
      Sample::Float32(d) => d.len(),
      Sample::UInt8(d) => d.len(),
    }
  }
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

impl LoadedModel for NativeModel {
  fn get_input(&self, name: &str) -> Result<TensorDescriptor, ModelError> {
    if self.file.input.name != name {
      return Err(ModelError::InputNotFound(name.to_string()));
    }
    Ok(self.file.input.descriptor)
  }

  fn set_input_output(
    &mut self,
    input: &TensorDescriptor,
    input_name: &str,
    output_names: &[&str],
  ) -> Result<(), ModelError> {
    if *input != self.get_input(input_name)? {
      return Err(ModelError::Invalid(format!(
        "输入 {} 的描述与模型不一致",
        input_name
      )));
    }

    self.selected = output_names
      .iter()
      .map(|name| {
        self
          .file
          .outputs
          .iter()
          .position(|o| o.name == *name)
          .ok_or_else(|| ModelError::OutputNotFound(name.to_string()))
      })
      .collect::<Result<_, _>>()?;
    Ok(())
  }

  fn execute(&self, input: &TensorBuffer, batch_size: usize) -> Result<ModelOutput, ModelError> {
    let descriptor = &self.file.input.descriptor;
    if input.element_type() != descriptor.element_type {
      return Err(ModelError::InputTypeMismatch {
        expected: descriptor.element_type,
        actual: input.element_type(),
      });
    }
    let per_sample = descriptor.element_count();
    let expected = per_sample * batch_size;
    if input.len() != expected || batch_size == 0 {
      return Err(ModelError::InputSizeMismatch {
        expected,
        actual: input.len(),
      });
    }

    let mut values = Vec::with_capacity(batch_size * self.selected.len());
    for b in 0..batch_size {
      let range = b * per_sample..(b + 1) * per_sample;
      let sample = match input {
        TensorBuffer::Float32(data) => Sample::Float32(&data[range]),
        TensorBuffer::UInt8(data) => Sample::UInt8(&data[range]),
      };
      let means = self.channel_means(sample);
      for &idx in &self.selected {
        let output = &self.file.outputs[idx];
        let logit = output.bias
          + output
            .weights
            .iter()
            .zip(&means)
            .map(|(w, m)| w * m)
            .sum::<f32>();
        values.push(sigmoid(logit));
      }
    }
    Ok(ModelOutput::new(values))
  }
}
