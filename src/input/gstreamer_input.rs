// 该文件是 Qiushui （秋水） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 输入
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

//! # GStreamer 视频输入模块
//!
//! 支持视频文件与 V4L2 摄像头，输出统一转换为 RGB24。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```
//!
//! ## 用法
//!
//! ```no_run
//! use qiushui::{FromUrl, input::GStreamerInputPipelineBuilder};
//! use url::Url;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let url = Url::parse("gst://file/data/main.mp4")?;
//! let input = GStreamerInputPipelineBuilder::from_url(&url)?.build()?;
//! for frame in input {
//!     println!("帧 {}: {}x{}", frame.pts(), frame.width(), frame.height());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! 摄像头：`gst://camera/dev/video0?width=1280&height=720&fps=30&format=YUY2`

use std::collections::HashMap;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{FrameError, PixelFormat, Rational, StreamGeometry, VideoFrame},
  input::FrameSource,
};

#[derive(Error, Debug)]
pub enum GStreamerInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("GStreamer 错误: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer 操作错误: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("无法获取 appsink 元素")]
  AppSinkNotFound,
  #[error("无法转换元素为 appsink")]
  AppSinkConversionFailed,
  #[error("无法从 caps 获取视频信息")]
  VideoInfoError,
  #[error("不支持的视频格式")]
  UnsupportedFormat,
  #[error("管道错误: {0}")]
  PipelineError(String),
  #[error("缓冲区大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("状态改变错误: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  #[error("帧构造错误: {0}")]
  Frame(#[from] FrameError),
}

/// 纳秒时间基
const GST_TIME_BASE: Rational = Rational::new(1, 1_000_000_000);

pub enum GStreamerInputBuilderItem {
  FileSource(String),
  CameraSource {
    camera: String,
    io_mode: Option<u32>,
    format: String,
    width: u32,
    height: u32,
    fps: u32,
  },
  TargetFormat {
    format: String,
  },
  VideoFlip {
    method: u32,
    direction: u32,
  },
}

impl GStreamerInputBuilderItem {
  fn to_pipeline(&self) -> String {
    match self {
      GStreamerInputBuilderItem::FileSource(path) => {
        format!("filesrc location={} ! decodebin", path)
      }
      GStreamerInputBuilderItem::CameraSource {
        camera,
        io_mode,
        format,
        width,
        height,
        fps,
      } => {
        let io_mode_str = io_mode
          .map(|mode| format!(" io-mode={}", mode))
          .unwrap_or_default();
        format!(
          "v4l2src device={}{} ! video/x-raw,format={},width={},height={},framerate={}/1",
          camera, io_mode_str, format, width, height, fps
        )
      }
      GStreamerInputBuilderItem::TargetFormat { format } => {
        format!("videoconvert ! video/x-raw,format={}", format)
      }
      GStreamerInputBuilderItem::VideoFlip { method, direction } => {
        format!("videoflip method={} video-direction={}", method, direction)
      }
    }
  }
}

/// GStreamer 输入管道构建器
pub struct GStreamerInputPipelineBuilder {
  items: Vec<GStreamerInputBuilderItem>,
}

impl GStreamerInputPipelineBuilder {
  fn build_camera_pipeline(path: &str, query: &HashMap<String, String>) -> Self {
    let parse = |key: &str, default: u32| {
      query
        .get(key)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
    };

    let mut items = vec![GStreamerInputBuilderItem::CameraSource {
      camera: path.to_string(),
      io_mode: query.get("io-mode").and_then(|v| v.parse::<u32>().ok()),
      format: query
        .get("format")
        .cloned()
        .unwrap_or_else(|| String::from("RGB")),
      width: parse("width", 640),
      height: parse("height", 480),
      fps: parse("fps", 15),
    }];
    items.extend(Self::video_flip(query.get("rotate").map(String::as_str)));
    GStreamerInputPipelineBuilder { items }
  }

  fn build_file_pipeline(path: &str, query: &HashMap<String, String>) -> Self {
    let mut items = vec![GStreamerInputBuilderItem::FileSource(path.to_string())];
    items.extend(Self::video_flip(query.get("rotate").map(String::as_str)));
    GStreamerInputPipelineBuilder { items }
  }

  fn video_flip(rotate: Option<&str>) -> Option<GStreamerInputBuilderItem> {
    let (method, direction) = match rotate? {
      "90" => (1, 1),
      "180" => (2, 2),
      "270" => (3, 3),
      _ => (0, 0),
    };
    Some(GStreamerInputBuilderItem::VideoFlip { method, direction })
  }

  pub fn pipeline_description(&self) -> String {
    let basic_pipeline = self
      .items
      .iter()
      .map(GStreamerInputBuilderItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ");
    format!("{} ! appsink sync=false name=sink", basic_pipeline)
  }

  /// 启动管道并拉取第一帧以确定流的几何信息
  pub fn build(self) -> Result<GStreamerInput, GStreamerInputError> {
    gst::init()?;

    let full_pipeline = self.pipeline_description();
    info!("GStreamer 管道描述: {}", full_pipeline);

    let pipeline = gst::parse::launch(&full_pipeline)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("无法创建管道".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    pipeline.set_state(gst::State::Playing)?;

    let sample = appsink
      .pull_sample()
      .map_err(|e| GStreamerInputError::PipelineError(format!("无法拉取第一帧: {}", e)))?;
    let caps = sample
      .caps()
      .ok_or_else(|| GStreamerInputError::PipelineError("样本中没有 caps".to_string()))?;
    let video_info =
      gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;
    let fps = video_info.fps();
    let geometry = StreamGeometry {
      width: video_info.width() as usize,
      height: video_info.height() as usize,
      normalized_width: video_info.width() as usize,
      normalized_height: video_info.height() as usize,
      frame_rate: Rational::new(fps.numer() as i64, fps.denom() as i64),
      time_base: GST_TIME_BASE,
    };
    info!(
      "GStreamer 输入: {}x{}, 帧率 {}/{}",
      geometry.width, geometry.height, geometry.frame_rate.num, geometry.frame_rate.den
    );

    Ok(GStreamerInput {
      pipeline,
      appsink,
      geometry,
      pending: Some(sample),
      index: 0,
    })
  }
}

impl FromUrlWithScheme for GStreamerInputPipelineBuilder {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerInputPipelineBuilder {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(GStreamerInputError::SchemeMismatch);
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();

    let mut builder = match url.host_str() {
      Some("camera") => Self::build_camera_pipeline(url.path(), &query),
      Some("file") => Self::build_file_pipeline(url.path(), &query),
      _ => {
        return Err(GStreamerInputError::SchemeMismatch);
      }
    };

    builder.items.push(GStreamerInputBuilderItem::TargetFormat {
      format: "RGB".to_string(),
    });

    Ok(builder)
  }
}

/// GStreamer 视频输入
///
/// 管理 GStreamer 管道和 appsink，逐帧产出 RGB24 [`VideoFrame`]。
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  geometry: StreamGeometry,
  pending: Option<gst::Sample>,
  index: i64,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("停止 GStreamer 管道失败: {}", e);
    }
  }
}

impl GStreamerInput {
  fn pull_sample(&mut self) -> Option<gst::Sample> {
    if let Some(sample) = self.pending.take() {
      return Some(sample);
    }
    self
      .appsink
      .pull_sample()
      .map_err(|e| debug!("拉取样本结束: {}", e))
      .ok()
  }

  fn convert_sample(&self, sample: gst::Sample) -> Result<VideoFrame, GStreamerInputError> {
    let buffer = sample
      .buffer()
      .ok_or_else(|| GStreamerInputError::PipelineError("样本中没有缓冲区".to_string()))?;
    let caps = sample
      .caps()
      .ok_or_else(|| GStreamerInputError::PipelineError("样本中没有 caps".to_string()))?;
    let video_info =
      gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;
    if video_info.format() != gst_video::VideoFormat::Rgb {
      return Err(GStreamerInputError::UnsupportedFormat);
    }

    let width = video_info.width() as usize;
    let height = video_info.height() as usize;
    let stride = video_info.stride()[0] as usize;
    let row = width * 3;

    let map = buffer
      .map_readable()
      .map_err(|e| GStreamerInputError::PipelineError(format!("无法映射缓冲区: {}", e)))?;
    let data = map.as_slice();

    let expected = stride * (height.max(1) - 1) + row;
    if data.len() < expected {
      return Err(GStreamerInputError::BufferSizeMismatch {
        expected,
        actual: data.len(),
      });
    }

    // 去掉行尾填充
    let mut packed = Vec::with_capacity(row * height);
    for h in 0..height {
      packed.extend_from_slice(&data[h * stride..h * stride + row]);
    }

    let pts = buffer
      .pts()
      .map(|t| t.nseconds() as i64)
      .unwrap_or(self.index);

    Ok(VideoFrame::from_host(
      width,
      height,
      PixelFormat::Rgb24,
      pts,
      packed,
    )?)
  }
}

impl Iterator for GStreamerInput {
  type Item = VideoFrame;

  fn next(&mut self) -> Option<Self::Item> {
    let sample = self.pull_sample()?;
    let frame = self
      .convert_sample(sample)
      .map_err(|e| error!("转换样本失败: {}", e))
      .ok()?;
    self.index += 1;
    Some(frame)
  }
}

impl FrameSource for GStreamerInput {
  fn geometry(&self) -> StreamGeometry {
    self.geometry
  }
}
