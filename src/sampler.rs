// 该文件是 Qiushui （秋水） 项目的一部分。
// src/sampler.rs - 分段采样索引
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

use tracing::debug;

/// 每个分段的时长（秒）
pub const SEGMENT_SECONDS: u32 = 6;
/// 每秒采样帧数
pub const SAMPLES_PER_SECOND: u32 = 3;
/// 采样索引上限
pub const MAX_SAMPLE_NUM: usize = 18;

/// 有序且无重复的采样帧索引，容量固定为 [`MAX_SAMPLE_NUM`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleIndexSet {
  indices: [u64; MAX_SAMPLE_NUM],
  len: usize,
}

impl Default for SampleIndexSet {
  fn default() -> Self {
    Self {
      indices: [0; MAX_SAMPLE_NUM],
      len: 0,
    }
  }
}

impl SampleIndexSet {
  // 调用方保证 index 单调不减
  fn push(&mut self, index: u64) -> bool {
    if self.len >= MAX_SAMPLE_NUM {
      return false;
    }
    if self.len > 0 && self.indices[self.len - 1] >= index {
      return true;
    }
    self.indices[self.len] = index;
    self.len += 1;
    true
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  pub fn capacity(&self) -> usize {
    MAX_SAMPLE_NUM
  }

  pub fn as_slice(&self) -> &[u64] {
    &self.indices[..self.len]
  }

  pub fn contains(&self, index: u64) -> bool {
    self.as_slice().binary_search(&index).is_ok()
  }
}

/// 计算采样帧索引
///
/// 每个一秒窗口内的偏移均匀分布：`window_start + j * frame_rate / samples_per_second`。
/// 帧率低于每秒采样数时重复的偏移会被合并。
pub fn compute_sample_indices(
  frame_rate: u32,
  segment_seconds: u32,
  samples_per_second: u32,
) -> SampleIndexSet {
  let mut set = SampleIndexSet::default();
  let fps = frame_rate as u64;
  let per_second = samples_per_second as u64;

  'windows: for i in 0..segment_seconds as u64 {
    let window_start = fps * i;
    for j in 0..per_second {
      if !set.push(window_start + j * fps / per_second) {
        break 'windows;
      }
    }
  }

  debug!(
    "采样索引 (fps = {}): {:?}",
    frame_rate,
    set.as_slice()
  );
  set
}
