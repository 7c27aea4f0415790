// 该文件是 Qiushui （秋水） 项目的一部分。
// src/diff/batch.rs - 帧对累积批次
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

use std::collections::TryReserveError;

use thiserror::Error;
use tracing::debug;

use crate::frame::PackedFrame;
use crate::sampler::MAX_SAMPLE_NUM;

/// 归一化宽度
pub const NORMAL_WIDTH: usize = 480;
/// 归一化高度
pub const NORMAL_HEIGHT: usize = 270;
/// 最终得分数组长度
pub const MAX_FEATURE_NUM: usize = 5;

const PACKED_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum BatchError {
  #[error("批次已满: 容量 {0}")]
  Full(usize),
  #[error("帧大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  SizeMismatch { expected: usize, actual: usize },
  #[error("内存分配失败: {0}")]
  Allocation(#[from] TryReserveError),
}

/// 帧对批次
///
/// `main_buffers[i]` 与 `ref_buffers[i]` 总是成对存在；
/// 得分缓冲区仅在打分调用前分配。
#[derive(Debug)]
pub struct FramePairBatch {
  width: usize,
  height: usize,
  normalized_width: usize,
  normalized_height: usize,
  feature_count: usize,
  main_buffers: Vec<Box<[u8]>>,
  ref_buffers: Vec<Box<[u8]>>,
  score_matrix: Option<Box<[f64]>>,
  final_scores: Option<Box<[f64]>>,
}

fn copy_buffer(src: &[u8]) -> Result<Box<[u8]>, TryReserveError> {
  let mut buf = Vec::new();
  buf.try_reserve_exact(src.len())?;
  buf.extend_from_slice(src);
  Ok(buf.into_boxed_slice())
}

fn zeroed(len: usize) -> Result<Box<[f64]>, TryReserveError> {
  let mut buf = Vec::new();
  buf.try_reserve_exact(len)?;
  buf.resize(len, 0.0);
  Ok(buf.into_boxed_slice())
}

impl FramePairBatch {
  pub fn new(
    width: usize,
    height: usize,
    normalized_width: usize,
    normalized_height: usize,
    feature_count: usize,
  ) -> Result<Self, BatchError> {
    let mut main_buffers = Vec::new();
    main_buffers.try_reserve_exact(MAX_SAMPLE_NUM)?;
    let mut ref_buffers = Vec::new();
    ref_buffers.try_reserve_exact(MAX_SAMPLE_NUM)?;

    Ok(Self {
      width,
      height,
      normalized_width,
      normalized_height,
      feature_count,
      main_buffers,
      ref_buffers,
      score_matrix: None,
      final_scores: None,
    })
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn normalized_width(&self) -> usize {
    self.normalized_width
  }

  pub fn normalized_height(&self) -> usize {
    self.normalized_height
  }

  pub fn feature_count(&self) -> usize {
    self.feature_count
  }

  pub fn sample_count(&self) -> usize {
    self.main_buffers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.main_buffers.is_empty()
  }

  /// 单个归一化帧的字节数
  pub fn frame_size(&self) -> usize {
    self.normalized_width * self.normalized_height * PACKED_CHANNELS
  }

  pub fn main_buffers(&self) -> &[Box<[u8]>] {
    &self.main_buffers
  }

  pub fn ref_buffers(&self) -> &[Box<[u8]>] {
    &self.ref_buffers
  }

  pub fn score_matrix(&self) -> Option<&[f64]> {
    self.score_matrix.as_deref()
  }

  pub fn final_scores(&self) -> Option<&[f64]> {
    self.final_scores.as_deref()
  }

  /// 供打分引擎写入结果
  pub fn scores_mut(&mut self) -> Option<(&[Box<[u8]>], &[Box<[u8]>], &mut [f64], &mut [f64])> {
    match (&mut self.score_matrix, &mut self.final_scores) {
      (Some(matrix), Some(finals)) => Some((
        &self.main_buffers[..],
        &self.ref_buffers[..],
        &mut matrix[..],
        &mut finals[..],
      )),
      _ => None,
    }
  }

  /// 复制一对归一化帧并追加到批次
  ///
  /// 两份拷贝都成功后才会追加，失败时已有条目保持不变。
  pub fn accumulate(&mut self, main: &PackedFrame, reference: &PackedFrame) -> Result<(), BatchError> {
    if self.main_buffers.len() >= MAX_SAMPLE_NUM {
      return Err(BatchError::Full(MAX_SAMPLE_NUM));
    }

    let expected = self.frame_size();
    for frame in [main, reference] {
      let actual = frame.as_ref().len();
      if actual != expected {
        return Err(BatchError::SizeMismatch { expected, actual });
      }
    }

    let main = copy_buffer(main.as_ref())?;
    let reference = copy_buffer(reference.as_ref())?;
    self.main_buffers.push(main);
    self.ref_buffers.push(reference);

    debug!("累积帧对 {}", self.main_buffers.len());
    Ok(())
  }

  /// 分配得分矩阵（特征数 × 样本数，置零）与最终得分
  pub fn allocate_scores(&mut self) -> Result<(), BatchError> {
    self.score_matrix = Some(zeroed(self.feature_count * self.sample_count())?);
    self.final_scores = Some(zeroed(self.feature_count)?);
    Ok(())
  }

  /// 释放批次持有的全部缓冲区
  pub fn release(&mut self) {
    self.main_buffers.clear();
    self.ref_buffers.clear();
    self.score_matrix = None;
    self.final_scores = None;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::PixelFormat;

  fn packed(fill: u8) -> PackedFrame {
    PackedFrame::new(
      NORMAL_WIDTH,
      NORMAL_HEIGHT,
      PixelFormat::Bgr24,
      vec![fill; NORMAL_WIDTH * NORMAL_HEIGHT * 3].into_boxed_slice(),
    )
    .unwrap()
  }

  fn batch() -> FramePairBatch {
    FramePairBatch::new(1920, 1080, NORMAL_WIDTH, NORMAL_HEIGHT, MAX_FEATURE_NUM).unwrap()
  }

  #[test]
  fn accumulates_pairs() {
    let mut batch = batch();
    for k in 0..4u8 {
      batch.accumulate(&packed(k), &packed(k + 100)).unwrap();
    }

    assert_eq!(batch.sample_count(), 4);
    for i in 0..4 {
      assert_eq!(batch.main_buffers()[i].len(), NORMAL_WIDTH * NORMAL_HEIGHT * 3);
      assert_eq!(batch.ref_buffers()[i].len(), NORMAL_WIDTH * NORMAL_HEIGHT * 3);
    }
    assert_eq!(batch.ref_buffers()[2][0], 102);
    assert!(batch.score_matrix().is_none());
  }

  #[test]
  fn refuses_beyond_capacity() {
    let mut batch = batch();
    let frame = packed(1);
    for _ in 0..MAX_SAMPLE_NUM {
      batch.accumulate(&frame, &frame).unwrap();
    }
    assert!(matches!(
      batch.accumulate(&frame, &frame),
      Err(BatchError::Full(MAX_SAMPLE_NUM))
    ));
    assert_eq!(batch.sample_count(), MAX_SAMPLE_NUM);
  }

  #[test]
  fn size_mismatch_keeps_previous_entries() {
    let mut batch = batch();
    batch.accumulate(&packed(9), &packed(9)).unwrap();

    let small = PackedFrame::new(2, 2, PixelFormat::Bgr24, vec![0; 12].into_boxed_slice()).unwrap();
    assert!(matches!(
      batch.accumulate(&packed(1), &small),
      Err(BatchError::SizeMismatch { .. })
    ));
    assert_eq!(batch.sample_count(), 1);
    assert_eq!(batch.main_buffers()[0][0], 9);
  }

  #[test]
  fn release_frees_everything() {
    let mut batch = batch();
    batch.accumulate(&packed(1), &packed(2)).unwrap();
    batch.allocate_scores().unwrap();
    assert_eq!(batch.score_matrix().map(|m| m.len()), Some(MAX_FEATURE_NUM));
    assert!(batch.score_matrix().unwrap().iter().all(|&v| v == 0.0));

    batch.release();
    assert!(batch.is_empty());
    assert!(batch.score_matrix().is_none());
    assert!(batch.final_scores().is_none());
  }
}
