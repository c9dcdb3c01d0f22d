// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 推理任务编排
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

use std::{
  sync::mpsc,
  thread,
  time::{Duration, Instant},
};

use image::RgbImage;
use tracing::{info, warn};

use crate::{
  model::DetectionResult,
  output::Render,
  pool::{Completed, Coordinator},
};

const DRAIN_POLL: Duration = Duration::from_millis(50);

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error>;
}

fn render<O, RE>(output: &O, done: &Completed) -> anyhow::Result<()>
where
  O: Render<RgbImage, DetectionResult, Error = RE>,
  RE: std::error::Error + Sync + Send + 'static,
{
  info!(
    "任务 {} 由工作线程 {} 完成, 耗时 {:.2?}, 目标 {} 个",
    done.id,
    done.worker,
    done.elapsed,
    done.result.len()
  );
  output.render_result(&done.image, &done.result)?;
  Ok(())
}

/// 停止提交后等待所有在途任务完成，并渲染剩余结果
fn drain<O, RE>(pool: &Coordinator, output: &O) -> anyhow::Result<usize>
where
  O: Render<RgbImage, DetectionResult, Error = RE>,
  RE: std::error::Error + Sync + Send + 'static,
{
  let mut rendered = 0;
  while pool.pending_count() > 0 {
    if let Some(done) = pool.receive_timeout(DRAIN_POLL) {
      render(output, &done)?;
      rendered += 1;
    }
  }
  while let Some(done) = pool.try_receive() {
    render(output, &done)?;
    rendered += 1;
  }
  Ok(rendered)
}

/// 同一帧重复提交，统计延迟与吞吐
pub struct RepeatShotTask {
  repeat: usize,
}

impl Default for RepeatShotTask {
  fn default() -> Self {
    RepeatShotTask { repeat: 1000 }
  }
}

impl RepeatShotTask {
  pub fn with_repeat(mut self, repeat: usize) -> Self {
    self.repeat = repeat;
    self
  }
}

impl<I, O, RE> Task<I, Coordinator, O> for RepeatShotTask
where
  I: Iterator<Item = RgbImage>,
  O: Render<RgbImage, DetectionResult, Error = RE>,
  RE: std::error::Error + Sync + Send + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, pool: Coordinator, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
    info!(
      "输入帧获取成功, 重复提交 {} 次到 {} 个工作线程",
      self.repeat,
      pool.worker_count()
    );

    let start = Instant::now();
    let mut latencies = Vec::with_capacity(self.repeat);
    for _ in 0..self.repeat {
      pool.submit(frame.clone())?;
      while let Some(done) = pool.try_receive() {
        latencies.push(done.elapsed);
        render(&output, &done)?;
      }
    }
    while pool.pending_count() > 0 {
      if let Some(done) = pool.receive_timeout(DRAIN_POLL) {
        latencies.push(done.elapsed);
        render(&output, &done)?;
      }
    }
    while let Some(done) = pool.try_receive() {
      latencies.push(done.elapsed);
      render(&output, &done)?;
    }
    let wall = start.elapsed();

    if latencies.is_empty() {
      warn!("没有任务完成, 丢弃 {} 个", pool.dropped_count());
    } else {
      let mean = latencies.iter().sum::<Duration>() / latencies.len() as u32;
      warn!(
        "完成 {} 个, 丢弃 {} 个, 平均延迟 {:.2?}, 吞吐 {:.2} 帧/秒",
        latencies.len(),
        pool.dropped_count(),
        mean,
        latencies.len() as f64 / wall.as_secs_f64()
      );
    }

    pool.shutdown();
    Ok(())
  }
}

/// 持续读取输入并提交，结果到达即渲染；Ctrl-C 或达到帧数后停止提交并排空
#[derive(Default, Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
  interruptible: bool,
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  /// 安装 Ctrl-C 处理函数
  pub fn interruptible(mut self) -> Self {
    self.interruptible = true;
    self
  }
}

impl<I, O, RE> Task<I, Coordinator, O> for ContinuousTask
where
  I: Iterator<Item = RgbImage>,
  O: Render<RgbImage, DetectionResult, Error = RE>,
  RE: std::error::Error + Sync + Send + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, pool: Coordinator, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let (tx, rx) = mpsc::channel();

    if self.interruptible {
      ctrlc::set_handler(move || {
        info!("收到中断信号，准备退出...");
        let _ = tx.send(());
        thread::spawn(|| {
          thread::sleep(Duration::from_secs(30));
          warn!("强制退出程序");
          std::process::exit(1);
        });
      })?;
    }

    let mut frame_index = 0;
    let mut rendered = 0;
    for frame in input {
      frame_index += 1;
      let id = pool.submit(frame)?;
      info!("提交第 {} 帧图像, 任务 {}", frame_index, id);

      while let Some(done) = pool.try_receive() {
        render(&output, &done)?;
        rendered += 1;
      }

      if self.frame_number.is_some_and(|n| frame_index >= n) {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        break;
      }
      if rx.try_recv().is_ok() {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }

    info!("停止提交, 等待 {} 个在途任务", pool.pending_count());
    rendered += drain(&pool, &output)?;
    info!(
      "任务完成，共提交 {} 帧, 渲染 {} 帧, 丢弃 {} 帧",
      frame_index,
      rendered,
      pool.dropped_count()
    );
    pool.shutdown();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    model::{Labels, SyntheticBuilder},
    pool::PoolConfig,
  };
  use std::{
    iter,
    sync::{Arc, Mutex},
  };

  /// 记录每次渲染的帧尺寸
  #[derive(Clone, Default)]
  struct Recorder(Arc<Mutex<Vec<(u32, u32)>>>);

  impl Render<RgbImage, DetectionResult> for Recorder {
    type Error = std::convert::Infallible;

    fn render_result(&self, frame: &RgbImage, _result: &DetectionResult) -> Result<(), Self::Error> {
      if let Ok(mut seen) = self.0.lock() {
        seen.push(frame.dimensions());
      }
      Ok(())
    }
  }

  impl Recorder {
    fn count(&self) -> usize {
      self.0.lock().map(|v| v.len()).unwrap_or(0)
    }
  }

  fn pool(workers: usize) -> Coordinator {
    let handles = (0..workers)
      .map(|_| {
        SyntheticBuilder::default()
          .input_size(32)
          .strides(&[8, 16])
          .latency(Duration::from_millis(5))
          .build()
          .unwrap()
      })
      .collect();
    Coordinator::new(handles, Labels::default(), PoolConfig::default()).unwrap()
  }

  #[test]
  fn continuous_task_drains_every_submitted_frame() {
    let recorder = Recorder::default();
    let input = iter::repeat_n(RgbImage::new(40, 30), 12);
    ContinuousTask::default()
      .run_task(input, pool(3), recorder.clone())
      .unwrap();
    assert_eq!(recorder.count(), 12);
    assert!(recorder.0.lock().unwrap().iter().all(|&d| d == (40, 30)));
  }

  #[test]
  fn continuous_task_stops_at_frame_number() {
    let recorder = Recorder::default();
    let input = iter::repeat_n(RgbImage::new(40, 30), 100);
    ContinuousTask::default()
      .with_frame_number(Some(5))
      .run_task(input, pool(2), recorder.clone())
      .unwrap();
    assert_eq!(recorder.count(), 5);
  }

  #[test]
  fn repeat_shot_requires_a_frame() {
    let input = iter::empty::<RgbImage>();
    let err = RepeatShotTask::default()
      .run_task(input, pool(1), Recorder::default())
      .unwrap_err();
    assert!(err.to_string().contains("没有输入帧"));
  }

  #[test]
  fn repeat_shot_renders_every_repeat() {
    let recorder = Recorder::default();
    let input = iter::once(RgbImage::new(8, 8));
    RepeatShotTask::default()
      .with_repeat(9)
      .run_task(input, pool(3), recorder.clone())
      .unwrap();
    assert_eq!(recorder.count(), 9);
  }
}
