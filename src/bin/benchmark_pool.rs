// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/benchmark_pool.rs - 推理池基准测试
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use image::{Rgb, RgbImage};
use url::Url;

use shanan_pool::{
  FromUrl,
  input::ImageFileInput,
  model::{DetectionResult, Labels, SyntheticBuilder},
  output::{LogOutput, Render, SaveImageFileOutput},
  pool::{Coordinator, PoolConfig},
  task::{ContinuousTask, RepeatShotTask, Task},
};
use tracing::info;

/// 推理池基准测试参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模拟加速器配置，如 synthetic://?latency_ms=20&classes=80
  #[arg(long, value_name = "MODEL", default_value = "synthetic://")]
  pub model: Url,
  /// 推理池配置，如 pool://?depth=4&policy=drop-oldest
  #[arg(long, value_name = "POOL", default_value = "pool://")]
  pub pool: Url,
  /// 输入图像，缺省时使用灰色空白帧
  #[arg(long, value_name = "SOURCE")]
  pub input: Option<Url>,
  /// 输出图像路径，缺省时只打印结果
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<Url>,
  /// 标签文件，每行一个类别名称
  #[arg(long, value_name = "LABELS")]
  pub labels: Option<PathBuf>,
  /// 工作线程数量
  #[arg(long, value_name = "WORKERS", default_value_t = 3)]
  pub workers: usize,
  /// 连续模式下提交的帧数，0 表示直到输入耗尽或 Ctrl-C
  #[arg(long, value_name = "FRAME_NUMBER", default_value_t = 0)]
  pub frame_number: usize,
  /// 重复模式下同一帧的提交次数，给出时进入重复模式
  #[arg(long, value_name = "REPEAT")]
  pub repeat: Option<usize>,
}

fn run<O, RE>(args: &Args, input: ImageFileInput, pool: Coordinator, output: O) -> Result<()>
where
  O: Render<RgbImage, DetectionResult, Error = RE>,
  RE: std::error::Error + Sync + Send + 'static,
{
  match args.repeat {
    Some(repeat) => RepeatShotTask::default()
      .with_repeat(repeat)
      .run_task(input, pool, output),
    None => ContinuousTask::default()
      .with_frame_number((args.frame_number > 0).then_some(args.frame_number))
      .interruptible()
      .run_task(input, pool, output),
  }
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型配置: {}", args.model);
  info!("推理池配置: {}", args.pool);
  info!("工作线程数量: {}", args.workers);

  let labels = match &args.labels {
    Some(path) => Labels::from_file(path)?,
    None => Labels::default(),
  };

  let builder = SyntheticBuilder::from_url(&args.model)?;
  let handles = (0..args.workers)
    .map(|_| builder.build())
    .collect::<Result<Vec<_>, _>>()?;
  let config = PoolConfig::from_url(&args.pool)?;
  let pool = Coordinator::new(handles, labels.clone(), config)?;

  let input = match &args.input {
    Some(url) => {
      info!("输入来源: {}", url);
      ImageFileInput::from_url(url)?
    }
    None => {
      let frames = match (args.repeat, args.frame_number) {
        (Some(_), _) => 1,
        (None, 0) => 100,
        (None, n) => n,
      };
      info!("使用 {} 帧 1280x720 空白图像", frames);
      ImageFileInput::new(RgbImage::from_pixel(1280, 720, Rgb([114, 114, 114])), frames)
    }
  };

  match &args.output {
    Some(url) => {
      info!("输出路径: {}", url);
      let output = SaveImageFileOutput::from_url(url)?.with_labels(labels);
      run(&args, input, pool, output)
    }
    None => run(&args, input, pool, LogOutput::with_labels(labels)),
  }
}
