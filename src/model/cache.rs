// 该文件是 Qiushui （秋水） 项目的一部分。
// src/model/cache.rs - 按设备缓存的模型表
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
use tracing::{debug, error, info, warn};

use crate::model::{
  BackendKind, InferenceBackend, LoadedModel, ModelError, ModelParams, TensorBuffer,
  TensorDescriptor,
};

/// 设备表容量
pub const MAX_DEVICE_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum CacheError {
  #[error("参数无效: {0}")]
  InvalidParameter(String),
  #[error("设备编号无效: {0}")]
  InvalidDeviceId(String),
  #[error("设备 {0} 尚未注册模型")]
  NotRegistered(u32),
  #[error("设备 {device} 上的模型参数不一致: {field}")]
  Mismatch { device: u32, field: &'static str },
  #[error("设备 {device} 上的推理后端不一致: 已注册 {registered}, 请求 {requested}")]
  BackendMismatch {
    device: u32,
    registered: BackendKind,
    requested: BackendKind,
  },
  #[error("设备 {device} 加载模型失败: {source}")]
  Model { device: u32, source: ModelError },
}

/// 一个设备上已加载并完成预热的模型
pub struct DeviceModelEntry {
  backend_kind: BackendKind,
  model: Box<dyn LoadedModel>,
  input_descriptor: TensorDescriptor,
  output_len: usize,
  params: ModelParams,
}

impl DeviceModelEntry {
  pub fn backend_kind(&self) -> BackendKind {
    self.backend_kind
  }

  pub fn model(&self) -> &dyn LoadedModel {
    self.model.as_ref()
  }

  pub fn input_descriptor(&self) -> &TensorDescriptor {
    &self.input_descriptor
  }

  /// 预热推理得到的输出长度
  pub fn output_len(&self) -> usize {
    self.output_len
  }

  pub fn params(&self) -> &ModelParams {
    &self.params
  }
}

impl std::fmt::Debug for DeviceModelEntry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DeviceModelEntry")
      .field("backend_kind", &self.backend_kind)
      .field("input_descriptor", &self.input_descriptor)
      .field("output_len", &self.output_len)
      .field("params", &self.params)
      .finish_non_exhaustive()
  }
}

/// 空白片段被忽略，例如 `"0,,1,"` 等价于 `"0,1"`
fn parse_device_ids(device_ids: &str) -> Result<Vec<u32>, CacheError> {
  let tokens: Vec<&str> = device_ids
    .split(',')
    .map(str::trim)
    .filter(|token| !token.is_empty())
    .collect();
  if tokens.is_empty() {
    return Err(CacheError::InvalidDeviceId(device_ids.to_string()));
  }
  if tokens.len() > MAX_DEVICE_SIZE {
    return Err(CacheError::InvalidDeviceId(format!(
      "设备数量 {} 超过上限 {}",
      tokens.len(),
      MAX_DEVICE_SIZE
    )));
  }

  tokens
    .into_iter()
    .map(|token| match token.parse::<u32>() {
      Ok(id) if (id as usize) < MAX_DEVICE_SIZE => Ok(id),
      _ => Err(CacheError::InvalidDeviceId(token.to_string())),
    })
    .collect()
}

/// 设备到模型的缓存表
///
/// 注册需要独占访问，绑定后的滤镜只读借用条目，
/// 只有 [`DeviceModelCache::unregister_all`] 会释放条目。
pub struct DeviceModelCache {
  entries: [Option<DeviceModelEntry>; MAX_DEVICE_SIZE],
}

impl Default for DeviceModelCache {
  fn default() -> Self {
    Self::new()
  }
}

impl DeviceModelCache {
  pub fn new() -> Self {
    Self {
      entries: Default::default(),
    }
  }

  /// 已注册的设备数
  pub fn len(&self) -> usize {
    self.entries.iter().filter(|e| e.is_some()).count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn get(&self, device_id: u32) -> Option<&DeviceModelEntry> {
    self.entries.get(device_id as usize)?.as_ref()
  }

  /// 在逗号分隔的设备列表上加载模型
  ///
  /// 已有条目的设备会被跳过；任何一步失败都会清空整张表。
  pub fn register_devices(
    &mut self,
    backend: &dyn InferenceBackend,
    params: &ModelParams,
    device_ids: &str,
  ) -> Result<(), CacheError> {
    if params.is_blank() || device_ids.trim().is_empty() {
      error!("模型路径、输入输出名称与设备列表均不能为空");
      return Err(CacheError::InvalidParameter(format!("{:?}", params)));
    }

    let ids = match parse_device_ids(device_ids) {
      Ok(ids) => ids,
      Err(e) => {
        error!("解析设备列表失败: {}", e);
        self.unregister_all();
        return Err(e);
      }
    };

    for id in ids {
      if self.entries[id as usize].is_some() {
        warn!("设备 {} 已注册模型，跳过", id);
        continue;
      }

      match Self::load(backend, params, id) {
        Ok(entry) => {
          info!(
            "设备 {} 注册模型 {} 完成, 输出长度 {}",
            id, params.model_path, entry.output_len
          );
          self.entries[id as usize] = Some(entry);
        }
        Err(source) => {
          error!("设备 {} 注册模型失败: {}", id, source);
          self.unregister_all();
          return Err(CacheError::Model { device: id, source });
        }
      }
    }

    Ok(())
  }

  fn load(
    backend: &dyn InferenceBackend,
    params: &ModelParams,
    device_id: u32,
  ) -> Result<DeviceModelEntry, ModelError> {
    backend.set_device(device_id)?;
    info!("设备 {} 加载模型文件: {}", device_id, params.model_path);
    let mut model = backend.load_model(&params.model_path, device_id)?;

    let input_descriptor = model.get_input(&params.input_name)?;
    debug!("模型输入 {}: {:?}", params.input_name, input_descriptor);
    model.set_input_output(
      &input_descriptor,
      &params.input_name,
      &[params.output_name.as_str()],
    )?;

    // 预热
    let warmup = model.execute(&TensorBuffer::zeroed(&input_descriptor), 1)?;
    debug!("设备 {} 预热完成", device_id);

    Ok(DeviceModelEntry {
      backend_kind: backend.kind(),
      model,
      input_descriptor,
      output_len: warmup.len(),
      params: params.clone(),
    })
  }

  /// 释放全部条目
  pub fn unregister_all(&mut self) {
    let mut released = 0;
    for entry in self.entries.iter_mut() {
      if entry.take().is_some() {
        released += 1;
      }
    }
    if released > 0 {
      info!("释放 {} 个设备上的模型", released);
    }
  }

  /// 获取设备上与参数一致的模型条目
  pub fn bind(
    &self,
    device_id: u32,
    params: &ModelParams,
    backend_kind: BackendKind,
  ) -> Result<&DeviceModelEntry, CacheError> {
    if device_id as usize >= MAX_DEVICE_SIZE {
      return Err(CacheError::InvalidDeviceId(device_id.to_string()));
    }
    let entry = self
      .get(device_id)
      .ok_or(CacheError::NotRegistered(device_id))?;

    let registered = &entry.params;
    let field = if registered.model_path != params.model_path {
      Some("model")
    } else if registered.input_name != params.input_name {
      Some("input")
    } else if registered.output_name != params.output_name {
      Some("output")
    } else {
      None
    };
    if let Some(field) = field {
      error!("设备 {} 上的模型参数 {} 与请求不一致", device_id, field);
      return Err(CacheError::Mismatch {
        device: device_id,
        field,
      });
    }

    if entry.backend_kind != backend_kind {
      return Err(CacheError::BackendMismatch {
        device: device_id,
        registered: entry.backend_kind,
        requested: backend_kind,
      });
    }

    Ok(entry)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{ElementType, ModelOutput};
  use std::cell::{Cell, RefCell};

  #[derive(Default)]
  struct FakeBackend {
    loads: Cell<usize>,
    devices: RefCell<Vec<u32>>,
    fail_on: Option<u32>,
  }

  struct FakeModel;

  impl LoadedModel for FakeModel {
    fn get_input(&self, name: &str) -> Result<TensorDescriptor, ModelError> {
      if name != "data" {
        return Err(ModelError::InputNotFound(name.to_string()));
      }
      Ok(TensorDescriptor {
        width: 4,
        height: 4,
        channels: 3,
        element_type: ElementType::Float32,
      })
    }

    fn set_input_output(
      &mut self,
      _input: &TensorDescriptor,
      _input_name: &str,
      _output_names: &[&str],
    ) -> Result<(), ModelError> {
      Ok(())
    }

    fn execute(&self, input: &TensorBuffer, _batch_size: usize) -> Result<ModelOutput, ModelError> {
      assert_eq!(input.len(), 48);
      Ok(ModelOutput::new(vec![0.0, 1.0]))
    }
  }

  impl InferenceBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
      BackendKind::Native
    }

    fn set_device(&self, device_id: u32) -> Result<(), ModelError> {
      if Some(device_id) == self.fail_on {
        return Err(ModelError::Device(device_id));
      }
      self.devices.borrow_mut().push(device_id);
      Ok(())
    }

    fn load_model(&self, _path: &str, _device_id: u32) -> Result<Box<dyn LoadedModel>, ModelError> {
      self.loads.set(self.loads.get() + 1);
      Ok(Box::new(FakeModel))
    }
  }

  fn params() -> ModelParams {
    ModelParams::new("model.json", "data", "prob")
  }

  #[test]
  fn registers_each_device_once() {
    let backend = FakeBackend::default();
    let mut cache = DeviceModelCache::new();
    cache.register_devices(&backend, &params(), "0, 3").unwrap();
    cache.register_devices(&backend, &params(), "3").unwrap();

    assert_eq!(backend.loads.get(), 2);
    assert_eq!(*backend.devices.borrow(), vec![0, 3]);
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.get(3).unwrap().output_len(), 2);
  }

  #[test]
  fn rejects_invalid_parameters() {
    let backend = FakeBackend::default();
    let mut cache = DeviceModelCache::new();
    assert!(matches!(
      cache.register_devices(&backend, &ModelParams::new("", "data", "prob"), "0"),
      Err(CacheError::InvalidParameter(_))
    ));
    assert!(matches!(
      cache.register_devices(&backend, &params(), "16"),
      Err(CacheError::InvalidDeviceId(_))
    ));
    assert!(matches!(
      cache.register_devices(&backend, &params(), "1,x"),
      Err(CacheError::InvalidDeviceId(_))
    ));
    let many = (0..17).map(|_| "0").collect::<Vec<_>>().join(",");
    assert!(cache.register_devices(&backend, &params(), &many).is_err());
    assert_eq!(backend.loads.get(), 0);
  }

  #[test]
  fn failure_unregisters_everything() {
    let backend = FakeBackend {
      fail_on: Some(2),
      ..Default::default()
    };
    let mut cache = DeviceModelCache::new();
    cache.register_devices(&backend, &params(), "0").unwrap();
    assert!(matches!(
      cache.register_devices(&backend, &params(), "1,2"),
      Err(CacheError::Model { device: 2, .. })
    ));
    assert!(cache.is_empty());
  }

  #[test]
  fn bind_checks_params() {
    let backend = FakeBackend::default();
    let mut cache = DeviceModelCache::new();
    cache.register_devices(&backend, &params(), "1").unwrap();

    let entry = cache.bind(1, &params(), BackendKind::Native).unwrap();
    assert_eq!(entry.input_descriptor().width, 4);

    assert!(matches!(
      cache.bind(0, &params(), BackendKind::Native),
      Err(CacheError::NotRegistered(0))
    ));
    assert!(matches!(
      cache.bind(1, &ModelParams::new("model.json", "data", "other"), BackendKind::Native),
      Err(CacheError::Mismatch { field: "output", .. })
    ));
    assert!(matches!(
      cache.bind(1, &params(), BackendKind::Rknpu),
      Err(CacheError::BackendMismatch { .. })
    ));
    assert!(matches!(
      cache.bind(99, &params(), BackendKind::Native),
      Err(CacheError::InvalidDeviceId(_))
    ));

    cache.unregister_all();
    assert!(cache.is_empty());
  }

  #[test]
  fn skips_empty_device_tokens() {
    let backend = FakeBackend::default();
    let mut cache = DeviceModelCache::new();
    cache.register_devices(&backend, &params(), "0,, 2,").unwrap();
    assert_eq!(*backend.devices.borrow(), vec![0, 2]);
    assert_eq!(cache.len(), 2);

    assert!(matches!(
      cache.register_devices(&backend, &params(), " , "),
      Err(CacheError::InvalidDeviceId(_))
    ));
    assert!(cache.is_empty());
  }
}
