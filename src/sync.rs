// 该文件是 Qiushui （秋水） 项目的一部分。
// src/sync.rs - 双路视频流帧同步
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

use std::iter::Peekable;
use std::rc::Rc;

use tracing::info;

use crate::frame::VideoFrame;

/// 一次同步节拍：主帧以及（可选的）参考帧
///
/// 参考帧可能被多个节拍共享。
#[derive(Debug)]
pub struct SyncTick {
  pub primary: VideoFrame,
  pub reference: Option<Rc<VideoFrame>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
  /// 尚未收到参考帧，主帧直接透传
  AwaitingPair,
  /// 主帧与参考帧均可用
  PairReady,
  /// 参考流已结束，剩余主帧直接透传
  Drained,
}

/// 按时间戳顺序从两路输入拉取帧对
///
/// 对时间戳为 `t` 的主帧，参考流前进到最后一个时间戳不大于 `t` 的帧；
/// 该参考帧在更新的参考帧到来之前会被后续主帧重复使用。
pub struct FrameSync<P, R>
where
  P: Iterator<Item = VideoFrame>,
  R: Iterator<Item = VideoFrame>,
{
  primary: P,
  reference: Peekable<R>,
  current: Option<Rc<VideoFrame>>,
  state: SyncState,
}

impl<P, R> FrameSync<P, R>
where
  P: Iterator<Item = VideoFrame>,
  R: Iterator<Item = VideoFrame>,
{
  pub fn new(primary: P, reference: R) -> Self {
    Self {
      primary,
      reference: reference.peekable(),
      current: None,
      state: SyncState::AwaitingPair,
    }
  }

  pub fn state(&self) -> SyncState {
    self.state
  }

  fn advance_reference(&mut self, pts: i64) {
    while let Some(next) = self.reference.peek() {
      if next.pts() > pts {
        break;
      }
      self.current = self.reference.next().map(Rc::new);
    }
  }

  fn reference_for(&mut self, pts: i64) -> Option<Rc<VideoFrame>> {
    if self.state == SyncState::Drained {
      return None;
    }

    self.advance_reference(pts);

    let ended = self.reference.peek().is_none();
    match &self.current {
      None if ended => {
        info!("参考流为空，主帧全部透传");
        self.state = SyncState::Drained;
        None
      }
      None => None,
      Some(current) if ended && current.pts() < pts => {
        info!("参考流已结束 (最后时间戳 {}), 主帧透传", current.pts());
        self.current = None;
        self.state = SyncState::Drained;
        None
      }
      Some(current) => {
        self.state = SyncState::PairReady;
        Some(Rc::clone(current))
      }
    }
  }
}

impl<P, R> Iterator for FrameSync<P, R>
where
  P: Iterator<Item = VideoFrame>,
  R: Iterator<Item = VideoFrame>,
{
  type Item = SyncTick;

  fn next(&mut self) -> Option<Self::Item> {
    let primary = self.primary.next()?;
    let reference = self.reference_for(primary.pts());
    Some(SyncTick { primary, reference })
  }
}
