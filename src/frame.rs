// 该文件是 Qiushui （秋水） 项目的一部分。
// src/frame.rs - 视频帧与打包帧定义
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

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// 像素格式
///
/// 所有主机内存中的缓冲区均为紧密排列（行间无填充）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
  Rgb24,
  Bgr24,
  Rgba,
  Bgra,
  Gray8,
  Yuv420p,
  Nv12,
}

impl PixelFormat {
  /// 给定尺寸下缓冲区的字节数
  pub fn buffer_size(&self, width: usize, height: usize) -> usize {
    let chroma = width.div_ceil(2) * height.div_ceil(2);
    match self {
      PixelFormat::Rgb24 | PixelFormat::Bgr24 => width * height * 3,
      PixelFormat::Rgba | PixelFormat::Bgra => width * height * 4,
      PixelFormat::Gray8 => width * height,
      PixelFormat::Yuv420p | PixelFormat::Nv12 => width * height + 2 * chroma,
    }
  }

  /// 是否为每像素 3 字节的打包格式
  pub fn is_packed_rgb(&self) -> bool {
    matches!(self, PixelFormat::Rgb24 | PixelFormat::Bgr24)
  }

  pub fn channels(&self) -> usize {
    match self {
      PixelFormat::Gray8 => 1,
      PixelFormat::Rgba | PixelFormat::Bgra => 4,
      _ => 3,
    }
  }
}

impl fmt::Display for PixelFormat {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      PixelFormat::Rgb24 => "rgb24",
      PixelFormat::Bgr24 => "bgr24",
      PixelFormat::Rgba => "rgba",
      PixelFormat::Bgra => "bgra",
      PixelFormat::Gray8 => "gray",
      PixelFormat::Yuv420p => "yuv420p",
      PixelFormat::Nv12 => "nv12",
    };
    f.write_str(name)
  }
}

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("硬件帧下载失败: {0}")]
  DownloadFailed(String),
  #[error("硬件表面没有可用的下载格式")]
  NoTransferFormat,
}

/// 驻留在设备上的帧表面
///
/// 归一化之前必须先下载到主机内存。
pub trait HardwareSurface {
  /// 可下载到主机的像素格式，按优先级排列
  fn transfer_formats(&self) -> Vec<PixelFormat>;

  /// 以指定格式将表面内容复制到主机内存
  fn download(&self, format: PixelFormat) -> Result<Box<[u8]>, FrameError>;
}

pub enum FrameData {
  Host(Box<[u8]>),
  Hardware(Box<dyn HardwareSurface>),
}

impl fmt::Debug for FrameData {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      FrameData::Host(data) => write!(f, "Host({} bytes)", data.len()),
      FrameData::Hardware(_) => f.write_str("Hardware"),
    }
  }
}

/// 帧元数据（键值字符串）
pub type FrameMetadata = BTreeMap<String, String>;

/// 已下载到主机内存的帧数据
#[derive(Debug, Clone)]
pub struct HostImage {
  pub format: PixelFormat,
  pub data: Box<[u8]>,
}

#[derive(Debug)]
pub struct VideoFrame {
  width: usize,
  height: usize,
  format: PixelFormat,
  pts: i64,
  data: FrameData,
  metadata: FrameMetadata,
}

impl VideoFrame {
  pub fn from_host(
    width: usize,
    height: usize,
    format: PixelFormat,
    pts: i64,
    data: Vec<u8>,
  ) -> Result<Self, FrameError> {
    let expected = format.buffer_size(width, height);
    if data.len() != expected {
      return Err(FrameError::BufferSizeMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      width,
      height,
      format,
      pts,
      data: FrameData::Host(data.into_boxed_slice()),
      metadata: FrameMetadata::new(),
    })
  }

  /// 构造硬件帧，`format` 为设备侧格式
  pub fn from_hardware(
    width: usize,
    height: usize,
    format: PixelFormat,
    pts: i64,
    surface: Box<dyn HardwareSurface>,
  ) -> Self {
    Self {
      width,
      height,
      format,
      pts,
      data: FrameData::Hardware(surface),
      metadata: FrameMetadata::new(),
    }
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn format(&self) -> PixelFormat {
    self.format
  }

  pub fn pts(&self) -> i64 {
    self.pts
  }

  pub fn is_hardware(&self) -> bool {
    matches!(self.data, FrameData::Hardware(_))
  }

  /// 主机内存中的数据，硬件帧返回 `None`
  pub fn host_data(&self) -> Option<&[u8]> {
    match &self.data {
      FrameData::Host(data) => Some(data),
      FrameData::Hardware(_) => None,
    }
  }

  /// 下载硬件帧到主机内存，使用表面提供的第一个格式
  ///
  /// 主机帧直接复制一份返回。
  pub fn download(&self) -> Result<HostImage, FrameError> {
    match &self.data {
      FrameData::Host(data) => Ok(HostImage {
        format: self.format,
        data: data.clone(),
      }),
      FrameData::Hardware(surface) => {
        let format = surface
          .transfer_formats()
          .first()
          .copied()
          .ok_or(FrameError::NoTransferFormat)?;
        let data = surface.download(format)?;
        let expected = format.buffer_size(self.width, self.height);
        if data.len() != expected {
          return Err(FrameError::BufferSizeMismatch {
            expected,
            actual: data.len(),
          });
        }
        Ok(HostImage { format, data })
      }
    }
  }

  pub fn metadata(&self) -> &FrameMetadata {
    &self.metadata
  }

  pub fn set_metadata(&mut self, key: &str, value: impl Into<String>) {
    self.metadata.insert(key.to_string(), value.into());
  }
}

/// 归一化后的紧密打包帧
#[derive(Debug, Clone, PartialEq)]
pub struct PackedFrame {
  width: usize,
  height: usize,
  format: PixelFormat,
  data: Box<[u8]>,
}

impl PackedFrame {
  pub fn new(
    width: usize,
    height: usize,
    format: PixelFormat,
    data: Box<[u8]>,
  ) -> Result<Self, FrameError> {
    let expected = format.buffer_size(width, height);
    if data.len() != expected {
      return Err(FrameError::BufferSizeMismatch {
        expected,
        actual: data.len(),
      });
    }
    Ok(Self {
      width,
      height,
      format,
      data,
    })
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn format(&self) -> PixelFormat {
    self.format
  }

  pub fn channels(&self) -> usize {
    self.format.channels()
  }

  pub fn into_inner(self) -> Box<[u8]> {
    self.data
  }
}

impl AsRef<[u8]> for PackedFrame {
  fn as_ref(&self) -> &[u8] {
    &self.data
  }
}

impl AsMut<[u8]> for PackedFrame {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

/// 有理数（帧率、时间基）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
  pub num: i64,
  pub den: i64,
}

impl Rational {
  pub const fn new(num: i64, den: i64) -> Self {
    Self { num, den }
  }

  pub fn is_known(&self) -> bool {
    self.num > 0 && self.den > 0
  }

  pub fn as_f64(&self) -> f64 {
    self.num as f64 / self.den as f64
  }
}

/// 流几何信息，配置完成后只读
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamGeometry {
  pub width: usize,
  pub height: usize,
  pub normalized_width: usize,
  pub normalized_height: usize,
  pub frame_rate: Rational,
  pub time_base: Rational,
}

impl StreamGeometry {
  /// 取整后的帧率；帧率未知时由时间基推导
  pub fn effective_fps(&self) -> u32 {
    if self.frame_rate.is_known() {
      (self.frame_rate.as_f64() + 0.5) as u32
    } else if self.time_base.is_known() {
      (1.0 / self.time_base.as_f64() + 0.5) as u32
    } else {
      0
    }
  }
}
