// 该文件是 Qiushui （秋水） 项目的一部分。
// src/model/rknn.rs - RKNPU 推理后端
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

use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use tracing::{debug, error, info};

use crate::model::{
  BackendKind, ElementType, InferenceBackend, LoadedModel, ModelError, ModelOutput, TensorBuffer,
  TensorDescriptor,
};

const RKNN_NUM_INPUTS: u32 = 1;

/// RKNPU 后端
///
/// RKNN 模型只接受 NHWC 排列的 UInt8 输入，输入尺寸由调用者给出；
/// 输出名称为输出张量的序号。
pub struct RknpuBackend {
  input: TensorDescriptor,
}

impl Default for RknpuBackend {
  fn default() -> Self {
    Self::new(TensorDescriptor {
      width: 640,
      height: 640,
      channels: 3,
      element_type: ElementType::UInt8,
    })
  }
}

impl RknpuBackend {
  pub fn new(input: TensorDescriptor) -> Self {
    Self { input }
  }
}

impl InferenceBackend for RknpuBackend {
  fn kind(&self) -> BackendKind {
    BackendKind::Rknpu
  }

  fn set_device(&self, device_id: u32) -> Result<(), ModelError> {
    debug!("RKNPU 设备 {}", device_id);
    Ok(())
  }

  fn load_model(&self, path: &str, device_id: u32) -> Result<Box<dyn LoadedModel>, ModelError> {
    info!("设备 {} 加载模型文件: {}", device_id, path);
    let data = std::fs::read(path).map_err(|source| ModelError::Load {
      path: path.to_string(),
      source,
    })?;
    debug!(
      "模型文件大小: {:.2} MB",
      data.len() as f64 / (1024.0 * 1024.0)
    );

    let context = Context::new(&data, InitFlags::default())?;
    let num_inputs = context.num_inputs()?;
    let num_outputs = context.num_outputs()?;
    if num_inputs != RKNN_NUM_INPUTS {
      error!(
        "预期模型输入数量为 {}, 实际为 {}",
        RKNN_NUM_INPUTS, num_inputs
      );
      return Err(ModelError::Invalid(format!(
        "预期模型输入数量为 {}, 实际为 {}",
        RKNN_NUM_INPUTS, num_inputs
      )));
    }
    debug!("模型输出数量: {}", num_outputs);

    Ok(Box::new(RknpuModel {
      context,
      input: self.input,
      num_outputs: num_outputs as usize,
      selected: (0..num_outputs as usize).collect(),
    }))
  }
}

pub struct RknpuModel {
  context: Context,
  input: TensorDescriptor,
  num_outputs: usize,
  selected: Vec<usize>,
}

impl LoadedModel for RknpuModel {
  fn get_input(&self, _name: &str) -> Result<TensorDescriptor, ModelError> {
    Ok(self.input)
  }

  fn set_input_output(
    &mut self,
    input: &TensorDescriptor,
    _input_name: &str,
    output_names: &[&str],
  ) -> Result<(), ModelError> {
    if input.element_type != ElementType::UInt8 {
      return Err(ModelError::InputTypeMismatch {
        expected: ElementType::UInt8,
        actual: input.element_type,
      });
    }
    self.input = *input;
    self.selected = output_names
      .iter()
      .map(|name| match name.parse::<usize>() {
        Ok(idx) if idx < self.num_outputs => Ok(idx),
        _ => Err(ModelError::OutputNotFound(name.to_string())),
      })
      .collect::<Result<_, _>>()?;
    Ok(())
  }

  fn execute(&self, input: &TensorBuffer, batch_size: usize) -> Result<ModelOutput, ModelError> {
    let TensorBuffer::UInt8(data) = input else {
      return Err(ModelError::InputTypeMismatch {
        expected: ElementType::UInt8,
        actual: input.element_type(),
      });
    };
    let expected = self.input.element_count() * batch_size;
    if data.len() != expected {
      return Err(ModelError::InputSizeMismatch {
        expected,
        actual: data.len(),
      });
    }

    debug!("设置模型输入");
    self
      .context
      .set_input(0, &data[..], TensorFormat::NHWC, TensorType::UInt8)?;
    debug!("执行模型推理");
    self.context.run()?;

    let output = self.context.get_outputs()?;
    let mut values = Vec::new();
    for &idx in &self.selected {
      values.extend(output.get_f32(idx)?.iter().copied());
    }
    Ok(ModelOutput::new(values))
  }
}
