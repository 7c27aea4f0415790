// 该文件是 Qiushui （秋水） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

//! 将一张静态图像重复为固定帧率的视频流。
//!
//! `image:///path/to/a.png?frames=180&fps=30`

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{PixelFormat, Rational, StreamGeometry, VideoFrame},
  input::FrameSource,
};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配")]
  SchemaMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("参数 {0} 无效: {1}")]
  InvalidParameter(&'static str, String),
}

const DEFAULT_FRAMES: u64 = 1;
const DEFAULT_FPS: u32 = 25;

pub struct ImageFileInput {
  image: RgbImage,
  frames: u64,
  fps: u32,
  emitted: u64,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

fn query_value<T: std::str::FromStr>(
  url: &Url,
  key: &'static str,
) -> Result<Option<T>, ImageFileInputError> {
  url
    .query_pairs()
    .find(|(k, _)| k == key)
    .map(|(_, v)| {
      v.parse()
        .map_err(|_| ImageFileInputError::InvalidParameter(key, v.to_string()))
    })
    .transpose()
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    let frames = query_value(url, "frames")?.unwrap_or(DEFAULT_FRAMES);
    let fps = query_value(url, "fps")?.unwrap_or(DEFAULT_FPS);
    if fps == 0 {
      return Err(ImageFileInputError::InvalidParameter("fps", "0".to_string()));
    }

    let path = url.path();
    let image = ImageReader::open(path)?.decode()?;
    info!(
      "读取图像 {}: {}x{}, 重复 {} 帧, {} fps",
      path,
      image.width(),
      image.height(),
      frames,
      fps
    );

    Ok(Self::from_image(image.into(), frames, fps))
  }
}

impl ImageFileInput {
  pub fn from_image(image: RgbImage, frames: u64, fps: u32) -> Self {
    Self {
      image,
      frames,
      fps,
      emitted: 0,
    }
  }
}

impl Iterator for ImageFileInput {
  type Item = VideoFrame;

  fn next(&mut self) -> Option<Self::Item> {
    if self.emitted >= self.frames {
      return None;
    }
    let (width, height) = self.image.dimensions();
    let frame = VideoFrame::from_host(
      width as usize,
      height as usize,
      PixelFormat::Rgb24,
      self.emitted as i64,
      self.image.as_raw().clone(),
    )
    .map_err(|e| error!("构造视频帧失败: {}", e))
    .ok()?;
    self.emitted += 1;
    Some(frame)
  }
}

impl FrameSource for ImageFileInput {
  fn geometry(&self) -> StreamGeometry {
    let (width, height) = self.image.dimensions();
    StreamGeometry {
      width: width as usize,
      height: height as usize,
      normalized_width: width as usize,
      normalized_height: height as usize,
      frame_rate: Rational::new(self.fps as i64, 1),
      time_base: Rational::new(1, self.fps as i64),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn repeats_image_as_stream() {
    let image = RgbImage::from_pixel(4, 2, image::Rgb([1, 2, 3]));
    let input = ImageFileInput::from_image(image, 3, 30);
    let geometry = input.geometry();
    assert_eq!(geometry.effective_fps(), 30);
    assert_eq!((geometry.width, geometry.height), (4, 2));

    let frames: Vec<_> = input.collect();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[2].pts(), 2);
    assert_eq!(&frames[0].host_data().unwrap()[..3], &[1, 2, 3]);
  }

  #[test]
  fn loads_from_url() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("still.png");
    RgbImage::from_pixel(8, 8, image::Rgb([9, 9, 9]))
      .save(&path)
      .unwrap();

    let url = Url::parse(&format!("image://{}?frames=5&fps=10", path.display())).unwrap();
    let input = ImageFileInput::from_url(&url).unwrap();
    assert_eq!(input.geometry().time_base, Rational::new(1, 10));
    assert_eq!(input.count(), 5);

    let bad = Url::parse(&format!("image://{}?fps=0", path.display())).unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&bad),
      Err(ImageFileInputError::InvalidParameter("fps", _))
    ));
  }
}
