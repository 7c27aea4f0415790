// 该文件是 Qiushui （秋水） 项目的一部分。
// src/diff.rs - 双路视频差异采样滤镜
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

//! # 差异采样滤镜
//!
//! 同步主流与参考流，在固定分段内按确定性索引采样帧对，
//! 归一化为 480x270 BGR24 后累积，流结束时一次性交给打分引擎。
//!
//! ```no_run
//! use qiushui::{FromUrl, diff::{DiffOptions, LvpDiffFilter, PsnrEngine}};
//! use url::Url;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let options = DiffOptions::from_url(&Url::parse("lvpdiff://?stats_file=-")?)?;
//! let filter = LvpDiffFilter::new(&options, Box::new(PsnrEngine))?;
//! # Ok(())
//! # }
//! ```

mod batch;
mod engine;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::rc::Rc;

use tracing::{debug, error, info, warn};
use url::Url;

pub use self::batch::{BatchError, FramePairBatch, MAX_FEATURE_NUM, NORMAL_HEIGHT, NORMAL_WIDTH};
pub use self::engine::{PsnrEngine, SCORE_SUCCESS, ScoringEngine, invoke_scoring};

use crate::{
  FromUrl, FromUrlWithScheme,
  error::FilterError,
  frame::{PixelFormat, StreamGeometry, VideoFrame},
  normalize::{FrameNormalizer, Resampler},
  sampler::{SAMPLES_PER_SECOND, SEGMENT_SECONDS, SampleIndexSet, compute_sample_indices},
  sync::SyncTick,
};

/// 同步序号元数据键
pub const SYNC_ANNOTATION_KEY: &str = "lavfi.lvpdiff";

const SUPPORTED_STATS_VERSION: u32 = 1;

/// 差异滤镜选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffOptions {
  /// 统计文件路径，`-` 表示标准输出
  pub stats_file: Option<String>,
  pub stats_version: u32,
}

impl Default for DiffOptions {
  fn default() -> Self {
    Self {
      stats_file: None,
      stats_version: SUPPORTED_STATS_VERSION,
    }
  }
}

impl FromUrlWithScheme for DiffOptions {
  const SCHEME: &'static str = "lvpdiff";
}

impl FromUrl for DiffOptions {
  type Error = FilterError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(FilterError::config(format!(
        "选项必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let mut options = DiffOptions::default();
    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "stats_file" | "f" => options.stats_file = Some(v.to_string()),
        "stats_version" => {
          options.stats_version = v
            .parse()
            .map_err(|_| FilterError::config(format!("无效的 stats_version: {}", v)))?;
        }
        other => warn!("忽略未知选项: {}", other),
      }
    }

    if options.stats_version != SUPPORTED_STATS_VERSION {
      return Err(FilterError::config(format!(
        "不支持的统计文件格式版本 {}, 仅支持 {}",
        options.stats_version, SUPPORTED_STATS_VERSION
      )));
    }

    Ok(options)
  }
}

enum StatsSink {
  Stdout(io::Stdout),
  File(BufWriter<File>),
}

impl StatsSink {
  fn open(path: &str) -> Result<Self, FilterError> {
    if path == "-" {
      return Ok(StatsSink::Stdout(io::stdout()));
    }
    let file = File::create(path).map_err(|source| {
      error!("无法打开统计文件 {}: {}", path, source);
      FilterError::File {
        path: path.to_string(),
        source,
      }
    })?;
    Ok(StatsSink::File(BufWriter::new(file)))
  }

  fn writer(&mut self) -> &mut dyn Write {
    match self {
      StatsSink::Stdout(out) => out,
      StatsSink::File(file) => file,
    }
  }
}

/// 一行统计记录：每个特征一个 `feature(NN):score ` 片段
pub fn format_stats_line(scores: &[f64]) -> String {
  let mut line: String = scores
    .iter()
    .enumerate()
    .map(|(i, score)| format!("feature({:02}):{:.0} ", i, score))
    .collect();
  line.push('\n');
  line
}

struct Configured {
  main_normalizer: FrameNormalizer,
  ref_normalizer: FrameNormalizer,
  indices: SampleIndexSet,
  batch: FramePairBatch,
}

impl Configured {
  /// 归一化一对帧并追加到批次
  fn sample(&mut self, main: &VideoFrame, reference: &VideoFrame) -> Result<(), FilterError> {
    let main = self.main_normalizer.download_and_normalize(main)?;
    let reference = self.ref_normalizer.download_and_normalize(reference)?;
    self.batch.accumulate(&main, &reference)?;
    Ok(())
  }
}

/// 差异采样滤镜
///
/// 拆除（`finish` 或析构）时若批次非空，调用一次打分引擎并释放全部缓冲区。
pub struct LvpDiffFilter {
  stats_path: Option<String>,
  stats: Option<StatsSink>,
  engine: Box<dyn ScoringEngine>,
  resampler: Option<Rc<dyn Resampler>>,
  configured: Option<Configured>,
  nb_frames: u64,
  forwarded: u64,
  finished: bool,
}

impl LvpDiffFilter {
  pub fn new(options: &DiffOptions, engine: Box<dyn ScoringEngine>) -> Result<Self, FilterError> {
    if options.stats_version != SUPPORTED_STATS_VERSION {
      return Err(FilterError::config(format!(
        "不支持的统计文件格式版本 {}",
        options.stats_version
      )));
    }

    let stats = options.stats_file.as_deref().map(StatsSink::open).transpose()?;

    Ok(Self {
      stats_path: options.stats_file.clone(),
      stats,
      engine,
      resampler: None,
      configured: None,
      nb_frames: 0,
      forwarded: 0,
      finished: false,
    })
  }

  /// 替换两路归一化使用的重采样器，需在 `configure` 之前调用
  pub fn with_resampler(mut self, resampler: Rc<dyn Resampler>) -> Self {
    self.resampler = Some(resampler);
    self
  }

  fn normalizer(&self) -> FrameNormalizer {
    let target = (NORMAL_WIDTH, NORMAL_HEIGHT);
    match &self.resampler {
      Some(resampler) => {
        FrameNormalizer::with_resampler(PixelFormat::Bgr24, target, Box::new(Rc::clone(resampler)))
      }
      None => FrameNormalizer::new(PixelFormat::Bgr24, target),
    }
  }

  /// 根据两路输入的几何信息完成配置
  ///
  /// 采样索引由主流帧率计算，批次记录参考流的原始尺寸。
  pub fn configure(
    &mut self,
    main: &StreamGeometry,
    reference: &StreamGeometry,
  ) -> Result<(), FilterError> {
    if self.configured.is_some() {
      return Err(FilterError::config("滤镜已配置"));
    }

    let fps = main.effective_fps();
    if fps == 0 {
      return Err(FilterError::config("无法确定主流帧率"));
    }

    if main.time_base != reference.time_base {
      warn!(
        "两路输入时间基不一致: {}/{} 与 {}/{}, 结果可能不准确",
        main.time_base.num, main.time_base.den, reference.time_base.num, reference.time_base.den
      );
    }

    let indices = compute_sample_indices(fps, SEGMENT_SECONDS, SAMPLES_PER_SECOND);
    let batch = FramePairBatch::new(
      reference.width,
      reference.height,
      NORMAL_WIDTH,
      NORMAL_HEIGHT,
      MAX_FEATURE_NUM,
    )
    .map_err(|e| FilterError::ResourceExhausted(e.to_string()))?;

    debug!(
      "主流 fps = {} w = {} h = {}",
      fps, reference.width, reference.height
    );

    self.configured = Some(Configured {
      main_normalizer: self.normalizer(),
      ref_normalizer: self.normalizer(),
      indices,
      batch,
    });
    Ok(())
  }

  /// 处理一次同步节拍，返回需要向下游转发的主帧
  ///
  /// 有参考帧的节拍总会推进序号并转发主帧；采样时的下载或归一化失败只丢弃该样本，
  /// 批次错误在推进序号后返回。
  pub fn process_tick(&mut self, tick: SyncTick) -> Result<VideoFrame, FilterError> {
    let SyncTick {
      mut primary,
      reference,
    } = tick;

    let Some(reference) = reference else {
      self.forwarded += 1;
      return Ok(primary);
    };

    let configured = self
      .configured
      .as_mut()
      .ok_or_else(|| FilterError::config("滤镜尚未配置"))?;

    let outcome = if configured.indices.contains(self.forwarded) {
      configured.sample(&primary, &reference)
    } else {
      Ok(())
    };

    self.nb_frames += 1;
    primary.set_metadata(SYNC_ANNOTATION_KEY, format!("{:04}", self.nb_frames));
    self.forwarded += 1;

    match outcome {
      Err(e) if e.is_frame_local() => {
        warn!("第 {} 对帧采样失败, 跳过该样本: {}", self.nb_frames, e);
        Ok(primary)
      }
      Err(e) => Err(e),
      Ok(()) => Ok(primary),
    }
  }

  /// 已同步的帧对数
  pub fn nb_frames(&self) -> u64 {
    self.nb_frames
  }

  pub fn sample_count(&self) -> usize {
    self
      .configured
      .as_ref()
      .map(|c| c.batch.sample_count())
      .unwrap_or(0)
  }

  pub fn sample_indices(&self) -> Option<&SampleIndexSet> {
    self.configured.as_ref().map(|c| &c.indices)
  }

  /// 结束流并返回最终得分；批次为空时返回 `None`
  pub fn finish(mut self) -> Result<Option<Vec<f64>>, FilterError> {
    self.teardown()
  }

  fn teardown(&mut self) -> Result<Option<Vec<f64>>, FilterError> {
    if self.finished {
      return Ok(None);
    }
    self.finished = true;

    let Some(configured) = self.configured.as_mut() else {
      return Ok(None);
    };
    let batch = &mut configured.batch;

    let result = match invoke_scoring(batch, self.engine.as_ref()) {
      Ok(Some(_)) => {
        info!("比较帧数 {}", batch.sample_count());
        let scores = batch.final_scores().map(<[f64]>::to_vec).unwrap_or_default();
        for (i, score) in scores.iter().enumerate() {
          info!("feature({}) = {}", i, score);
        }
        Ok(Some(scores))
      }
      Ok(None) => Ok(None),
      Err(e) => Err(FilterError::ResourceExhausted(e.to_string())),
    };
    batch.release();

    let scores = result?;
    if let (Some(scores), Some(stats)) = (&scores, self.stats.as_mut()) {
      let path = self.stats_path.clone().unwrap_or_default();
      let writer = stats.writer();
      writer
        .write_all(format_stats_line(scores).as_bytes())
        .and_then(|_| writer.flush())
        .map_err(|source| FilterError::File { path, source })?;
    }

    Ok(scores)
  }
}

impl Drop for LvpDiffFilter {
  fn drop(&mut self) {
    if let Err(e) = self.teardown() {
      error!("差异滤镜拆除失败: {}", e);
    }
  }
}
