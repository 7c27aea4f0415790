// 该文件是 Qiushui （秋水） 项目的一部分。
// src/normalize.rs - 帧归一化（重采样与颜色空间转换）
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

use std::rc::Rc;

use image::{RgbImage, imageops::FilterType};
use thiserror::Error;
use tracing::debug;

use crate::frame::{FrameError, PackedFrame, PixelFormat, VideoFrame};

#[derive(Error, Debug)]
pub enum NormalizeError {
  #[error("不支持的像素格式: {0}")]
  UnsupportedFormat(PixelFormat),
  #[error("缓冲区大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("无效的尺寸: {0}x{1}")]
  InvalidSize(usize, usize),
  #[error("硬件帧必须先下载到主机内存")]
  HardwareFrame,
  #[error("帧错误: {0}")]
  Frame(#[from] FrameError),
}

/// 图像重采样器
///
/// 将任意格式、任意尺寸的源缓冲区转换为目标格式与尺寸的新缓冲区。
pub trait Resampler {
  fn resample(
    &self,
    src: &[u8],
    src_format: PixelFormat,
    src_size: (usize, usize),
    dst_format: PixelFormat,
    dst_size: (usize, usize),
  ) -> Result<Box<[u8]>, NormalizeError>;
}

impl<R: Resampler + ?Sized> Resampler for Rc<R> {
  fn resample(
    &self,
    src: &[u8],
    src_format: PixelFormat,
    src_size: (usize, usize),
    dst_format: PixelFormat,
    dst_size: (usize, usize),
  ) -> Result<Box<[u8]>, NormalizeError> {
    (**self).resample(src, src_format, src_size, dst_format, dst_size)
  }
}

/// 基于 `image` 的双线性重采样器
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageResampler;

impl Resampler for ImageResampler {
  fn resample(
    &self,
    src: &[u8],
    src_format: PixelFormat,
    src_size: (usize, usize),
    dst_format: PixelFormat,
    dst_size: (usize, usize),
  ) -> Result<Box<[u8]>, NormalizeError> {
    let (sw, sh) = src_size;
    let (dw, dh) = dst_size;
    if sw == 0 || sh == 0 {
      return Err(NormalizeError::InvalidSize(sw, sh));
    }
    if dw == 0 || dh == 0 {
      return Err(NormalizeError::InvalidSize(dw, dh));
    }

    let expected = src_format.buffer_size(sw, sh);
    if src.len() < expected {
      return Err(NormalizeError::BufferSizeMismatch {
        expected,
        actual: src.len(),
      });
    }

    let rgb = to_rgb_image(&src[..expected], src_format, sw, sh)?;
    let rgb = if (sw, sh) == (dw, dh) {
      rgb
    } else {
      image::imageops::resize(&rgb, dw as u32, dh as u32, FilterType::Triangle)
    };

    Ok(pack_rgb_image(&rgb, dst_format).into_boxed_slice())
  }
}

fn new_rgb_image(width: usize, height: usize, data: Vec<u8>) -> Result<RgbImage, NormalizeError> {
  let actual = data.len();
  RgbImage::from_raw(width as u32, height as u32, data).ok_or(NormalizeError::BufferSizeMismatch {
    expected: width * height * 3,
    actual,
  })
}

fn clamp_u8(v: f32) -> u8 {
  v.round().clamp(0.0, 255.0) as u8
}

// BT.601 有限范围
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
  let c = 1.164 * (y as f32 - 16.0);
  let d = u as f32 - 128.0;
  let e = v as f32 - 128.0;
  [
    clamp_u8(c + 1.596 * e),
    clamp_u8(c - 0.392 * d - 0.813 * e),
    clamp_u8(c + 2.017 * d),
  ]
}

fn rgb_to_yuv(p: [u8; 3]) -> (f32, f32, f32) {
  let (r, g, b) = (p[0] as f32, p[1] as f32, p[2] as f32);
  (
    16.0 + 0.257 * r + 0.504 * g + 0.098 * b,
    128.0 - 0.148 * r - 0.291 * g + 0.439 * b,
    128.0 + 0.439 * r - 0.368 * g - 0.071 * b,
  )
}

fn to_rgb_image(
  src: &[u8],
  format: PixelFormat,
  width: usize,
  height: usize,
) -> Result<RgbImage, NormalizeError> {
  let pixels = width * height;
  let mut out = Vec::with_capacity(pixels * 3);

  match format {
    PixelFormat::Rgb24 => out.extend_from_slice(src),
    PixelFormat::Bgr24 => {
      for px in src.chunks_exact(3) {
        out.extend_from_slice(&[px[2], px[1], px[0]]);
      }
    }
    PixelFormat::Rgba => {
      for px in src.chunks_exact(4) {
        out.extend_from_slice(&px[..3]);
      }
    }
    PixelFormat::Bgra => {
      for px in src.chunks_exact(4) {
        out.extend_from_slice(&[px[2], px[1], px[0]]);
      }
    }
    PixelFormat::Gray8 => {
      for &g in src {
        out.extend_from_slice(&[g, g, g]);
      }
    }
    PixelFormat::Yuv420p | PixelFormat::Nv12 => {
      let cw = width.div_ceil(2);
      let (luma, chroma) = src.split_at(pixels);
      for h in 0..height {
        for w in 0..width {
          let ci = (h / 2) * cw + w / 2;
          let (u, v) = if format == PixelFormat::Yuv420p {
            let plane = chroma.len() / 2;
            (chroma[ci], chroma[plane + ci])
          } else {
            (chroma[ci * 2], chroma[ci * 2 + 1])
          };
          out.extend_from_slice(&yuv_to_rgb(luma[h * width + w], u, v));
        }
      }
    }
  }

  new_rgb_image(width, height, out)
}

fn pack_rgb_image(image: &RgbImage, format: PixelFormat) -> Vec<u8> {
  let (width, height) = (image.width() as usize, image.height() as usize);
  let raw = image.as_raw();

  match format {
    PixelFormat::Rgb24 => raw.clone(),
    PixelFormat::Bgr24 => raw
      .chunks_exact(3)
      .flat_map(|px| [px[2], px[1], px[0]])
      .collect(),
    PixelFormat::Rgba => raw
      .chunks_exact(3)
      .flat_map(|px| [px[0], px[1], px[2], 255])
      .collect(),
    PixelFormat::Bgra => raw
      .chunks_exact(3)
      .flat_map(|px| [px[2], px[1], px[0], 255])
      .collect(),
    PixelFormat::Gray8 => raw
      .chunks_exact(3)
      .map(|px| clamp_u8(0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32))
      .collect(),
    PixelFormat::Yuv420p | PixelFormat::Nv12 => {
      let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
      let mut luma = Vec::with_capacity(width * height);
      let mut u_sum = vec![0.0f32; cw * ch];
      let mut v_sum = vec![0.0f32; cw * ch];
      let mut hits = vec![0u32; cw * ch];

      for (i, px) in raw.chunks_exact(3).enumerate() {
        let (h, w) = (i / width, i % width);
        let (y, u, v) = rgb_to_yuv([px[0], px[1], px[2]]);
        luma.push(clamp_u8(y));
        let ci = (h / 2) * cw + w / 2;
        u_sum[ci] += u;
        v_sum[ci] += v;
        hits[ci] += 1;
      }

      let u: Vec<u8> = u_sum
        .iter()
        .zip(&hits)
        .map(|(s, &n)| clamp_u8(s / n as f32))
        .collect();
      let v: Vec<u8> = v_sum
        .iter()
        .zip(&hits)
        .map(|(s, &n)| clamp_u8(s / n as f32))
        .collect();

      let mut out = luma;
      if format == PixelFormat::Yuv420p {
        out.extend_from_slice(&u);
        out.extend_from_slice(&v);
      } else {
        out.extend(u.iter().zip(&v).flat_map(|(&u, &v)| [u, v]));
      }
      out
    }
  }
}

/// 帧归一化器
///
/// 持有目标格式与目标尺寸，每次调用都返回新分配的固定大小缓冲区。
pub struct FrameNormalizer {
  target_format: PixelFormat,
  target_size: (usize, usize),
  resampler: Box<dyn Resampler>,
}

impl FrameNormalizer {
  pub fn new(target_format: PixelFormat, target_size: (usize, usize)) -> Self {
    Self::with_resampler(target_format, target_size, Box::new(ImageResampler))
  }

  pub fn with_resampler(
    target_format: PixelFormat,
    target_size: (usize, usize),
    resampler: Box<dyn Resampler>,
  ) -> Self {
    debug!(
      "创建归一化器: 目标 {} {}x{}",
      target_format, target_size.0, target_size.1
    );
    Self {
      target_format,
      target_size,
      resampler,
    }
  }

  pub fn target_format(&self) -> PixelFormat {
    self.target_format
  }

  pub fn target_size(&self) -> (usize, usize) {
    self.target_size
  }

  pub fn normalize(
    &self,
    src: &[u8],
    src_format: PixelFormat,
    src_size: (usize, usize),
  ) -> Result<PackedFrame, NormalizeError> {
    let data = self.resampler.resample(
      src,
      src_format,
      src_size,
      self.target_format,
      self.target_size,
    )?;
    let (width, height) = self.target_size;
    Ok(PackedFrame::new(width, height, self.target_format, data)?)
  }

  /// 归一化主机内存中的帧
  pub fn normalize_frame(&self, frame: &VideoFrame) -> Result<PackedFrame, NormalizeError> {
    let data = frame.host_data().ok_or(NormalizeError::HardwareFrame)?;
    self.normalize(data, frame.format(), (frame.width(), frame.height()))
  }

  /// 归一化任意帧，硬件帧先下载到主机内存
  pub fn download_and_normalize(&self, frame: &VideoFrame) -> Result<PackedFrame, NormalizeError> {
    if !frame.is_hardware() {
      return self.normalize_frame(frame);
    }
    let host = frame.download()?;
    self.normalize(&host.data, host.format, (frame.width(), frame.height()))
  }
}
