// 该文件是 Qiushui （秋水） 项目的一部分。
// src/diff/engine.rs - 批量打分引擎
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

use tracing::{debug, info, warn};

use crate::diff::batch::{BatchError, FramePairBatch};

/// 引擎成功返回值
pub const SCORE_SUCCESS: i32 = 0;

/// 外部相似度打分引擎
///
/// 同步阻塞调用，结果原地写入批次的 `score_matrix` 与 `final_scores`。
pub trait ScoringEngine {
  fn score(&self, batch: &mut FramePairBatch) -> i32;
}

/// 对整个批次调用一次打分引擎
///
/// 空批次不调用引擎，也不分配得分缓冲区，返回 `None`。
pub fn invoke_scoring(
  batch: &mut FramePairBatch,
  engine: &dyn ScoringEngine,
) -> Result<Option<i32>, BatchError> {
  if batch.is_empty() {
    debug!("批次为空，跳过打分");
    return Ok(None);
  }

  batch.allocate_scores()?;
  info!("调用打分引擎, 样本数: {}", batch.sample_count());
  let status = engine.score(batch);
  if status != SCORE_SUCCESS {
    warn!("打分引擎返回非零状态: {}", status);
  }
  Ok(Some(status))
}

const PSNR_MAX: f64 = 100.0;

/// 基于逐像素误差的参考打分引擎
///
/// 每个样本的特征依次为 `[psnr, mse, mad_b, mad_g, mad_r]`，最终得分为各样本均值。
#[derive(Debug, Default, Clone, Copy)]
pub struct PsnrEngine;

impl PsnrEngine {
  fn features(main: &[u8], reference: &[u8]) -> [f64; 5] {
    let mut sq = 0.0f64;
    let mut abs = [0.0f64; 3];
    for (i, (&a, &b)) in main.iter().zip(reference).enumerate() {
      let d = a as f64 - b as f64;
      sq += d * d;
      abs[i % 3] += d.abs();
    }
    let n = main.len().max(1) as f64;
    let mse = sq / n;
    let psnr = if mse == 0.0 {
      PSNR_MAX
    } else {
      (10.0 * (255.0 * 255.0 / mse).log10()).min(PSNR_MAX)
    };
    let per_channel = n / 3.0;
    [
      psnr,
      mse,
      abs[0] / per_channel,
      abs[1] / per_channel,
      abs[2] / per_channel,
    ]
  }
}

impl ScoringEngine for PsnrEngine {
  fn score(&self, batch: &mut FramePairBatch) -> i32 {
    let samples = batch.sample_count();
    let features = batch.feature_count();
    let Some((mains, refs, matrix, finals)) = batch.scores_mut() else {
      return -1;
    };

    for (i, (main, reference)) in mains.iter().zip(refs).enumerate() {
      let values = Self::features(main, reference);
      for (f, value) in values.iter().take(features).enumerate() {
        matrix[f * samples + i] = *value;
      }
    }

    for (f, score) in finals.iter_mut().enumerate() {
      let row = &matrix[f * samples..(f + 1) * samples];
      *score = row.iter().sum::<f64>() / samples as f64;
    }

    SCORE_SUCCESS
  }
}
