// 该文件是 Qiushui （秋水） 项目的一部分。
// src/dnn.rs - 抽帧推理滤镜
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

use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  error::FilterError,
  frame::{PixelFormat, VideoFrame},
  model::{BackendKind, DeviceModelCache, DeviceModelEntry, ModelParams, TensorBuffer},
  normalize::FrameNormalizer,
};

/// 推理结果元数据键
pub const DNN_ANNOTATION_KEY: &str = "lavfi.lvpdnn.text";

/// 日志文件每写入这么多行刷新一次
pub const LOG_FLUSH_INTERVAL: usize = 30;

/// `sample` 选项上限，0 表示不推理
pub const MAX_SAMPLE_INTERVAL: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterType {
  #[default]
  Classify,
  ODetect,
}

/// 推理结果转化为标注文本的方式
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AnnotationPolicy {
  /// 输出全部数值
  EmitAll,
  /// 仅当第一个输出超过阈值时输出
  Threshold(f32),
}

impl AnnotationPolicy {
  pub fn annotate(&self, values: &[f32]) -> Option<String> {
    let first = *values.first()?;
    match *self {
      AnnotationPolicy::EmitAll => Some(values.iter().map(|v| format!("{:.2},", v)).collect()),
      AnnotationPolicy::Threshold(t) if first > t => Some(format!("probability {:.2}", first)),
      AnnotationPolicy::Threshold(_) => None,
    }
  }
}

/// 推理滤镜选项
///
/// `lvpdnn://classify?model=m.json&input=data&output=prob&backend=native&device=0&sample=1`
#[derive(Debug, Clone, PartialEq)]
pub struct DnnOptions {
  pub filter_type: FilterType,
  pub model: String,
  pub input: String,
  pub output: String,
  pub backend: BackendKind,
  pub device: u32,
  /// 注册时使用的设备列表，缺省为 `device`
  pub devices: Option<String>,
  pub sample: u32,
  pub threshold: Option<f32>,
  pub log: Option<String>,
}

impl Default for DnnOptions {
  fn default() -> Self {
    Self {
      filter_type: FilterType::Classify,
      model: String::new(),
      input: String::new(),
      output: String::new(),
      backend: BackendKind::Native,
      device: 0,
      devices: None,
      sample: 1,
      threshold: None,
      log: None,
    }
  }
}

impl DnnOptions {
  pub fn params(&self) -> ModelParams {
    ModelParams::new(&self.model, &self.input, &self.output)
  }

  pub fn device_list(&self) -> String {
    self
      .devices
      .clone()
      .unwrap_or_else(|| self.device.to_string())
  }

  pub fn policy(&self) -> AnnotationPolicy {
    match self.threshold {
      Some(t) => AnnotationPolicy::Threshold(t),
      None => AnnotationPolicy::EmitAll,
    }
  }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, FilterError> {
  value
    .parse()
    .map_err(|_| FilterError::config(format!("选项 {} 的值无效: {}", key, value)))
}

impl FromUrlWithScheme for DnnOptions {
  const SCHEME: &'static str = "lvpdnn";
}

impl FromUrl for DnnOptions {
  type Error = FilterError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(FilterError::config(format!(
        "选项必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let filter_type = match url.host_str().unwrap_or("classify") {
      "classify" | "" => FilterType::Classify,
      "odetect" => FilterType::ODetect,
      other => return Err(FilterError::config(format!("未知的过滤类型: {}", other))),
    };
    let mut options = DnnOptions {
      filter_type,
      ..Default::default()
    };

    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "model" => options.model = v.to_string(),
        "input" => options.input = v.to_string(),
        "output" => options.output = v.to_string(),
        "backend" | "backend_type" => {
          options.backend = v.parse().map_err(FilterError::Config)?;
        }
        "device" => options.device = parse_value(&k, &v)?,
        "devices" => options.devices = Some(v.to_string()),
        "sample" => {
          options.sample = parse_value(&k, &v)?;
          if options.sample > MAX_SAMPLE_INTERVAL {
            return Err(FilterError::config(format!(
              "抽帧间隔 {} 超出范围 [0, {}]",
              options.sample, MAX_SAMPLE_INTERVAL
            )));
          }
        }
        "threshold" => options.threshold = Some(parse_value(&k, &v)?),
        "log" => options.log = Some(v.to_string()),
        other => warn!("忽略未知选项: {}", other),
      }
    }

    Ok(options)
  }
}

/// 标注日志文件
pub struct AnnotationLog {
  path: String,
  writer: BufWriter<File>,
  pending: usize,
}

impl AnnotationLog {
  pub fn open(path: &str) -> Result<Self, FilterError> {
    let file = File::create(path).map_err(|source| FilterError::File {
      path: path.to_string(),
      source,
    })?;
    info!("打开推理日志文件: {}", path);
    Ok(Self {
      path: path.to_string(),
      writer: BufWriter::new(file),
      pending: 0,
    })
  }

  pub fn append(&mut self, line: &str) -> std::io::Result<()> {
    writeln!(self.writer, "{}", line)?;
    self.pending += 1;
    if self.pending >= LOG_FLUSH_INTERVAL {
      self.flush()?;
    }
    Ok(())
  }

  pub fn flush(&mut self) -> std::io::Result<()> {
    self.pending = 0;
    self.writer.flush()
  }
}

/// 抽帧推理滤镜
///
/// 滤镜借用缓存中的条目，存活期间缓存不能被清空。
pub struct LvpDnnFilter<'a> {
  entry: &'a DeviceModelEntry,
  normalizer: FrameNormalizer,
  policy: AnnotationPolicy,
  sample: u32,
  counter: u64,
  executed: u64,
  log: Option<AnnotationLog>,
}

impl<'a> LvpDnnFilter<'a> {
  /// 从缓存中绑定设备上已注册的模型
  pub fn bind(options: &DnnOptions, cache: &'a DeviceModelCache) -> Result<Self, FilterError> {
    if options.filter_type == FilterType::ODetect {
      return Err(FilterError::config("暂不支持 odetect 过滤类型"));
    }

    let entry = cache.bind(options.device, &options.params(), options.backend)?;
    let input = *entry.input_descriptor();
    let format = match input.channels {
      3 => PixelFormat::Rgb24,
      1 => PixelFormat::Gray8,
      n => {
        return Err(FilterError::config(format!(
          "不支持的模型输入通道数: {}",
          n
        )));
      }
    };

    let log = options.log.as_deref().map(AnnotationLog::open).transpose()?;

    info!(
      "绑定设备 {} 上的模型 {}, 输入 {}x{} {}",
      options.device, options.model, input.width, input.height, input.element_type
    );

    Ok(Self {
      entry,
      normalizer: FrameNormalizer::new(format, (input.width, input.height)),
      policy: options.policy(),
      sample: options.sample,
      counter: 0,
      executed: 0,
      log,
    })
  }

  /// 已执行推理的帧数
  pub fn executed(&self) -> u64 {
    self.executed
  }

  fn is_sampled(&self) -> bool {
    self.sample > 0 && self.counter % self.sample as u64 == 0
  }

  /// 处理一帧，返回需要向下游转发的帧
  ///
  /// 下载或推理失败时该帧被丢弃，错误返回给调用者。
  pub fn filter_frame(&mut self, mut frame: VideoFrame) -> Result<VideoFrame, FilterError> {
    self.counter += 1;
    if !self.is_sampled() {
      return Ok(frame);
    }

    let packed = if frame.is_hardware() {
      let host = frame.download()?;
      self
        .normalizer
        .normalize(&host.data, host.format, (frame.width(), frame.height()))?
    } else {
      self.normalizer.normalize_frame(&frame)?
    };

    let input = self.entry.input_descriptor();
    let tensor = TensorBuffer::from_packed(input.element_type, packed.as_ref());
    let output = self.entry.model().execute(&tensor, 1)?;
    self.executed += 1;
    debug!("第 {} 帧推理输出: {:?}", self.counter, output.values());

    if let Some(text) = self.policy.annotate(output.values()) {
      if let Some(log) = self.log.as_mut() {
        if let Err(e) = log.append(&text) {
          warn!("写入推理日志 {} 失败: {}", log.path, e);
        }
      }
      frame.set_metadata(DNN_ANNOTATION_KEY, text);
    }

    Ok(frame)
  }

  /// 结束流，刷新日志文件
  pub fn finish(&mut self) -> Result<(), FilterError> {
    if let Some(log) = self.log.as_mut() {
      log.flush().map_err(|source| FilterError::File {
        path: log.path.clone(),
        source,
      })?;
    }
    info!("推理滤镜结束, 共推理 {} 帧", self.executed);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_options() {
    let url = Url::parse(
      "lvpdnn://classify?model=/tmp/m.json&input=data&output=prob&device=2&sample=5&threshold=0.5&log=/tmp/a.log",
    )
    .unwrap();
    let options = DnnOptions::from_url(&url).unwrap();
    assert_eq!(options.filter_type, FilterType::Classify);
    assert_eq!(options.params(), ModelParams::new("/tmp/m.json", "data", "prob"));
    assert_eq!(options.device, 2);
    assert_eq!(options.device_list(), "2");
    assert_eq!(options.sample, 5);
    assert_eq!(options.policy(), AnnotationPolicy::Threshold(0.5));
    assert_eq!(options.log.as_deref(), Some("/tmp/a.log"));
  }

  #[test]
  fn rejects_bad_options() {
    for url in [
      "lvpdnn://classify?backend=cuda",
      "lvpdnn://classify?device=x",
      "lvpdnn://classify?sample=201",
      "lvpdnn://classify?sample=-1",
      "lvpdnn://segment?model=m",
      "lvpdiff://classify?model=m",
    ] {
      assert!(DnnOptions::from_url(&Url::parse(url).unwrap()).is_err(), "{}", url);
    }
  }

  #[test]
  fn odetect_is_rejected_at_bind() {
    let url = Url::parse("lvpdnn://odetect?model=m&input=i&output=o").unwrap();
    let options = DnnOptions::from_url(&url).unwrap();
    assert_eq!(options.filter_type, FilterType::ODetect);
    let err = LvpDnnFilter::bind(&options, &DeviceModelCache::new()).err().unwrap();
    assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
  }

  #[test]
  fn annotation_policies() {
    assert_eq!(
      AnnotationPolicy::EmitAll.annotate(&[0.1234, 0.5]),
      Some("0.12,0.50,".to_string())
    );
    assert_eq!(AnnotationPolicy::EmitAll.annotate(&[]), None);
    assert_eq!(
      AnnotationPolicy::Threshold(0.5).annotate(&[0.9, 0.0]),
      Some("probability 0.90".to_string())
    );
    assert_eq!(AnnotationPolicy::Threshold(0.5).annotate(&[0.5]), None);
    assert_eq!(AnnotationPolicy::Threshold(0.5).annotate(&[]), None);
  }

  #[test]
  fn log_flushes_periodically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dnn.log");
    let path_str = path.to_str().unwrap();
    let mut log = AnnotationLog::open(path_str).unwrap();

    for _ in 0..LOG_FLUSH_INTERVAL - 1 {
      log.append("x").unwrap();
    }
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    log.append("x").unwrap();
    assert_eq!(
      std::fs::read_to_string(&path).unwrap().lines().count(),
      LOG_FLUSH_INTERVAL
    );
  }
}
