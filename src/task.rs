// 该文件是 Qiushui （秋水） 项目的一部分。
// src/task.rs - 任务执行
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

use std::sync::mpsc::{self, Receiver};
use std::{thread, time::Duration};

use tracing::{info, warn};

use crate::{
  diff::LvpDiffFilter, dnn::LvpDnnFilter, error::FilterError, frame::VideoFrame,
  input::FrameSource, output::FrameSink, sync::FrameSync,
};

/// 安装 Ctrl-C 处理器，返回中断信号接收端
///
/// 收到信号 30 秒后仍未退出则强制结束进程。
fn interrupt_channel() -> anyhow::Result<Receiver<()>> {
  let (tx, rx) = mpsc::channel();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.send(());
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })?;
  Ok(rx)
}

/// 仅影响当前帧的错误记录后继续，其余错误终止任务
fn check_frame_error(frame_index: usize, err: FilterError) -> anyhow::Result<()> {
  if err.is_frame_local() {
    warn!("第 {} 帧处理失败, 丢弃该帧: {}", frame_index, err);
    Ok(())
  } else {
    Err(err.into())
  }
}

fn reached_limit(limit: Option<usize>, frame_index: usize) -> bool {
  limit.map(|n| frame_index >= n).unwrap_or(false)
}

/// 双路差异任务
#[derive(Default, Debug)]
pub struct DiffTask {
  frame_number: Option<usize>,
  handle_interrupt: bool,
}

impl DiffTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_interrupt(mut self, handle_interrupt: bool) -> Self {
    self.handle_interrupt = handle_interrupt;
    self
  }

  /// 运行到任一结束条件，然后拆除滤镜并返回最终得分
  pub fn run<P, R, O>(
    self,
    mut filter: LvpDiffFilter,
    primary: P,
    reference: R,
    mut output: O,
  ) -> anyhow::Result<Option<Vec<f64>>>
  where
    P: FrameSource,
    R: FrameSource,
    O: FrameSink,
    O::Error: std::error::Error + Send + Sync + 'static,
  {
    info!("开始差异任务...");
    let rx = if self.handle_interrupt {
      Some(interrupt_channel()?)
    } else {
      None
    };

    filter.configure(&primary.geometry(), &reference.geometry())?;

    let mut frame_index = 0;
    for tick in FrameSync::new(primary, reference) {
      frame_index += 1;
      match filter.process_tick(tick) {
        Ok(frame) => output.write_frame(&frame)?,
        Err(e) => check_frame_error(frame_index, e)?,
      }
      if reached_limit(self.frame_number, frame_index) {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        break;
      }
      if rx.as_ref().is_some_and(|rx| rx.try_recv().is_ok()) {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }

    info!(
      "同步帧对 {}, 采样 {} 对",
      filter.nb_frames(),
      filter.sample_count()
    );
    let scores = filter.finish()?;
    output.finish()?;
    info!("任务完成，退出");
    Ok(scores)
  }
}

/// 抽帧推理任务
#[derive(Default, Debug)]
pub struct DnnTask {
  frame_number: Option<usize>,
  handle_interrupt: bool,
}

impl DnnTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_interrupt(mut self, handle_interrupt: bool) -> Self {
    self.handle_interrupt = handle_interrupt;
    self
  }

  /// 返回执行推理的帧数
  pub fn run<I, O>(
    self,
    mut filter: LvpDnnFilter<'_>,
    input: I,
    mut output: O,
  ) -> anyhow::Result<u64>
  where
    I: Iterator<Item = VideoFrame>,
    O: FrameSink,
    O::Error: std::error::Error + Send + Sync + 'static,
  {
    info!("开始推理任务...");
    let rx = if self.handle_interrupt {
      Some(interrupt_channel()?)
    } else {
      None
    };

    let mut frame_index = 0;
    let mut now = std::time::Instant::now();
    for frame in input {
      frame_index += 1;
      match filter.filter_frame(frame) {
        Ok(frame) => output.write_frame(&frame)?,
        Err(e) => check_frame_error(frame_index, e)?,
      }
      info!("处理第 {} 帧, 耗时: {:.2?}", frame_index, now.elapsed());
      now = std::time::Instant::now();

      if reached_limit(self.frame_number, frame_index) {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        break;
      }
      if rx.as_ref().is_some_and(|rx| rx.try_recv().is_ok()) {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }

    filter.finish()?;
    output.finish()?;
    info!("任务完成，退出");
    Ok(filter.executed())
  }
}
