// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pool.rs - 多核 NPU 推理协调器
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{
  any::Any,
  fmt,
  panic::{self, AssertUnwindSafe},
  str::FromStr,
  sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
  },
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  letterbox::LetterboxParams,
  model::{
    Accelerator, DetectionResult, Labels, ModelVariant,
    layout::{LayoutError, OutputLayout},
  },
  postprocess::{DecodeError, PostProcessor, Thresholds},
};

pub const DEFAULT_QUEUE_DEPTH: usize = 4;
/// RK3588 的 NPU 核心数
pub const DEFAULT_NPU_CORES: usize = 3;

#[derive(Error, Debug)]
pub enum PoolError {
  #[error("没有可用的模型句柄")]
  NoHandles,
  #[error("工作线程 {worker} 绑定 NPU 核心 {core} 失败: {reason}")]
  CoreBinding {
    worker: usize,
    core: usize,
    reason: String,
  },
  #[error("工作线程 {0} 查询模型信息失败: {1}")]
  Metadata(usize, String),
  #[error("工作线程 {0} 的输出布局无效: {1}")]
  Layout(usize, LayoutError),
  #[error("工作线程 {worker} 的模型种类 {actual} 与 {expected} 不一致")]
  VariantMismatch {
    worker: usize,
    expected: ModelVariant,
    actual: ModelVariant,
  },
  #[error("工作线程 {worker} 的模型输入尺寸 {actual} 与 {expected} 不一致")]
  InputSizeMismatch {
    worker: usize,
    expected: u32,
    actual: u32,
  },
  #[error("创建工作线程失败: {0}")]
  Spawn(std::io::Error),
  #[error("输入图像为空")]
  EmptyImage,
  #[error("任务队列已关闭")]
  Disconnected,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("参数错误: {0}")]
  ParameterError(String),
  #[error("未知参数: {0}")]
  UnknownParameter(String),
}

/// 队列满时的提交策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
  /// 阻塞直到队列有空位
  #[default]
  Block,
  /// 丢弃该工作线程队列中最旧的任务
  DropOldest,
}

impl FromStr for BackpressurePolicy {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "block" => Ok(BackpressurePolicy::Block),
      "drop-oldest" | "drop_oldest" => Ok(BackpressurePolicy::DropOldest),
      other => Err(ConfigError::ParameterError(format!("未知的背压策略 '{}'", other))),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
  queue_depth: usize,
  policy: BackpressurePolicy,
  thresholds: Thresholds,
  cores: usize,
  variant: Option<ModelVariant>,
}

impl Default for PoolConfig {
  fn default() -> Self {
    PoolConfig {
      queue_depth: DEFAULT_QUEUE_DEPTH,
      policy: BackpressurePolicy::default(),
      thresholds: Thresholds::default(),
      cores: DEFAULT_NPU_CORES,
      variant: None,
    }
  }
}

impl FromUrlWithScheme for PoolConfig {
  const SCHEME: &'static str = "pool";
}

impl FromUrl for PoolConfig {
  type Error = ConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ConfigError::SchemeMismatch(format!(
        "期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let mut config = PoolConfig::default();
    for (key, value) in url.query_pairs() {
      let invalid = || ConfigError::ParameterError(format!("{}={}", key, value));
      match key.as_ref() {
        "depth" => config.queue_depth = value.parse().map_err(|_| invalid())?,
        "policy" => config.policy = value.parse()?,
        "conf" => config.thresholds.box_threshold = value.parse().map_err(|_| invalid())?,
        "nms" => config.thresholds.nms_threshold = value.parse().map_err(|_| invalid())?,
        "max" => config.thresholds.max_detections = value.parse().map_err(|_| invalid())?,
        "cores" => config.cores = value.parse().map_err(|_| invalid())?,
        "variant" => config.variant = Some(value.parse().map_err(|_| invalid())?),
        _ => return Err(ConfigError::UnknownParameter(key.to_string())),
      }
    }
    config.validate()?;
    Ok(config)
  }
}

impl PoolConfig {
  pub fn queue_depth(mut self, depth: usize) -> Self {
    self.queue_depth = depth;
    self
  }

  pub fn policy(mut self, policy: BackpressurePolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn thresholds(mut self, thresholds: Thresholds) -> Self {
    self.thresholds = thresholds;
    self
  }

  pub fn box_threshold(mut self, threshold: f32) -> Self {
    self.thresholds.box_threshold = threshold;
    self
  }

  pub fn nms_threshold(mut self, threshold: f32) -> Self {
    self.thresholds.nms_threshold = threshold;
    self
  }

  pub fn max_detections(mut self, max: usize) -> Self {
    self.thresholds.max_detections = max;
    self
  }

  pub fn cores(mut self, cores: usize) -> Self {
    self.cores = cores;
    self
  }

  /// 跳过按张量名称的协商，直接指定模型种类
  pub fn variant(mut self, variant: Option<ModelVariant>) -> Self {
    self.variant = variant;
    self
  }

  pub fn get_queue_depth(&self) -> usize {
    self.queue_depth
  }

  pub fn get_policy(&self) -> BackpressurePolicy {
    self.policy
  }

  pub fn get_thresholds(&self) -> &Thresholds {
    &self.thresholds
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.queue_depth == 0 {
      return Err(ConfigError::ParameterError("队列深度必须大于 0".to_string()));
    }
    if self.cores == 0 {
      return Err(ConfigError::ParameterError("NPU 核心数必须大于 0".to_string()));
    }
    let t = &self.thresholds;
    if !(0.0..=1.0).contains(&t.box_threshold) || !(0.0..=1.0).contains(&t.nms_threshold) {
      return Err(ConfigError::ParameterError(format!(
        "阈值必须位于 [0, 1]: conf={}, nms={}",
        t.box_threshold, t.nms_threshold
      )));
    }
    Ok(())
  }
}

/// 任务在工作线程中经历的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStage {
  Submitted,
  Converting,
  Accelerating,
  Decoding,
  PostProcessing,
  Completed,
}

impl fmt::Display for TaskStage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      TaskStage::Submitted => "提交",
      TaskStage::Converting => "预处理",
      TaskStage::Accelerating => "推理",
      TaskStage::Decoding => "解码",
      TaskStage::PostProcessing => "后处理",
      TaskStage::Completed => "完成",
    };
    f.write_str(name)
  }
}

/// 一个已完成的任务，图像原样归还给调用方
#[derive(Debug)]
pub struct Completed {
  pub id: u64,
  pub worker: usize,
  pub image: RgbImage,
  pub result: DetectionResult,
  /// 从提交到完成的耗时
  pub elapsed: Duration,
}

struct Job {
  id: u64,
  image: RgbImage,
  submitted: Instant,
}

#[derive(Default)]
struct Counters {
  pending: AtomicUsize,
  dropped: AtomicUsize,
}

impl Counters {
  fn drop_one(&self) {
    self.dropped.fetch_add(1, Ordering::SeqCst);
    self.pending.fetch_sub(1, Ordering::SeqCst);
  }
}

#[derive(Error, Debug)]
enum TaskFailure {
  #[error("{0}")]
  Convert(String),
  #[error("{0}")]
  Accelerator(String),
  #[error("{0}")]
  Decode(#[from] DecodeError),
}

/// 固定数量的工作线程，每个独占一个模型句柄
///
/// 提交按轮询分配到各工作线程的有界队列；结果按完成顺序发布，
/// 与提交顺序无关。
pub struct Coordinator {
  senders: Vec<Sender<Job>>,
  evictors: Vec<Receiver<Job>>,
  workers: Vec<JoinHandle<()>>,
  results: Receiver<Completed>,
  cursor: AtomicUsize,
  next_id: AtomicU64,
  counters: Arc<Counters>,
  policy: BackpressurePolicy,
  layout: OutputLayout,
  labels: Labels,
}

impl Coordinator {
  pub fn new<A>(handles: Vec<A>, labels: Labels, config: PoolConfig) -> Result<Self, PoolError>
  where
    A: Accelerator + 'static,
  {
    if handles.is_empty() {
      return Err(PoolError::NoHandles);
    }
    let cores = config.cores.max(1);
    let depth = config.queue_depth.max(1);
    info!(
      "初始化推理协调器: {} 个工作线程, 队列深度 {}, 策略 {:?}",
      handles.len(),
      depth,
      config.policy
    );

    let mut prepared = Vec::with_capacity(handles.len());
    let mut first: Option<OutputLayout> = None;
    for (worker, mut accel) in handles.into_iter().enumerate() {
      let core = worker % cores;
      accel
        .bind_core(core)
        .map_err(|e| PoolError::CoreBinding {
          worker,
          core,
          reason: e.to_string(),
        })?;
      debug!("工作线程 {} 绑定到 NPU 核心 {}", worker, core);

      let metadata = accel
        .metadata()
        .map_err(|e| PoolError::Metadata(worker, e.to_string()))?;
      let layout = match config.variant {
        Some(variant) => OutputLayout::for_variant(variant, &metadata),
        None => OutputLayout::negotiate(&metadata),
      }
      .map_err(|e| PoolError::Layout(worker, e))?;

      if let Some(expected) = &first {
        if expected.variant != layout.variant {
          return Err(PoolError::VariantMismatch {
            worker,
            expected: expected.variant,
            actual: layout.variant,
          });
        }
        if expected.input_size != layout.input_size {
          return Err(PoolError::InputSizeMismatch {
            worker,
            expected: expected.input_size,
            actual: layout.input_size,
          });
        }
      } else {
        first = Some(layout.clone());
      }
      prepared.push((accel, layout));
    }
    let Some(layout) = first else {
      return Err(PoolError::NoHandles);
    };

    if !labels.is_empty() && labels.len() != layout.num_classes {
      warn!(
        "标签数量 {} 与模型类别数 {} 不一致",
        labels.len(),
        layout.num_classes
      );
    }

    let counters = Arc::new(Counters::default());
    let (result_tx, results) = crossbeam_channel::unbounded();
    let mut senders = Vec::with_capacity(prepared.len());
    let mut evictors = Vec::with_capacity(prepared.len());
    let mut workers = Vec::with_capacity(prepared.len());

    for (index, (accel, worker_layout)) in prepared.into_iter().enumerate() {
      let (tx, rx) = crossbeam_channel::bounded(depth);
      let worker = Worker {
        index,
        accel,
        processor: PostProcessor::new(worker_layout, config.thresholds),
        letterbox: None,
        stage: TaskStage::Submitted,
        jobs: rx.clone(),
        results: result_tx.clone(),
        counters: counters.clone(),
      };
      let handle = thread::Builder::new()
        .name(format!("npu-worker-{}", index))
        .spawn(move || worker.run())
        .map_err(PoolError::Spawn)?;
      senders.push(tx);
      evictors.push(rx);
      workers.push(handle);
    }

    info!("推理协调器就绪, 模型种类: {}", layout.variant);
    Ok(Coordinator {
      senders,
      evictors,
      workers,
      results,
      cursor: AtomicUsize::new(0),
      next_id: AtomicU64::new(0),
      counters,
      policy: config.policy,
      layout,
      labels,
    })
  }

  /// 提交一帧图像，返回任务编号
  ///
  /// `Block` 策略下队列满时等待；`DropOldest` 策略下挤掉该队列最旧的任务。
  pub fn submit(&self, image: RgbImage) -> Result<u64, PoolError> {
    if image.width() == 0 || image.height() == 0 {
      return Err(PoolError::EmptyImage);
    }
    if self.senders.is_empty() {
      return Err(PoolError::Disconnected);
    }

    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let worker = self.cursor.fetch_add(1, Ordering::Relaxed) % self.senders.len();
    self.counters.pending.fetch_add(1, Ordering::SeqCst);
    debug!("任务 {} 分配到工作线程 {}: {}", id, worker, TaskStage::Submitted);

    let mut job = Job {
      id,
      image,
      submitted: Instant::now(),
    };
    let sender = &self.senders[worker];
    match self.policy {
      BackpressurePolicy::Block => {
        if sender.send(job).is_err() {
          self.counters.pending.fetch_sub(1, Ordering::SeqCst);
          return Err(PoolError::Disconnected);
        }
      }
      BackpressurePolicy::DropOldest => loop {
        match sender.try_send(job) {
          Ok(()) => break,
          Err(TrySendError::Full(back)) => {
            job = back;
            if let Ok(old) = self.evictors[worker].try_recv() {
              self.counters.drop_one();
              warn!("工作线程 {} 队列已满, 丢弃最旧的任务 {}", worker, old.id);
            }
          }
          Err(TrySendError::Disconnected(_)) => {
            self.counters.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(PoolError::Disconnected);
          }
        }
      },
    }
    Ok(id)
  }

  /// 非阻塞地取出一个已完成的结果
  pub fn try_receive(&self) -> Option<Completed> {
    self.results.try_recv().ok()
  }

  /// 最多等待 `timeout` 取出一个结果
  pub fn receive_timeout(&self, timeout: Duration) -> Option<Completed> {
    match self.results.recv_timeout(timeout) {
      Ok(completed) => Some(completed),
      Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
    }
  }

  /// 排队中与执行中的任务数
  pub fn pending_count(&self) -> usize {
    self.counters.pending.load(Ordering::SeqCst)
  }

  /// 被挤掉或执行失败的任务数
  pub fn dropped_count(&self) -> usize {
    self.counters.dropped.load(Ordering::SeqCst)
  }

  pub fn worker_count(&self) -> usize {
    self.workers.len()
  }

  pub fn labels(&self) -> &Labels {
    &self.labels
  }

  pub fn layout(&self) -> &OutputLayout {
    &self.layout
  }

  /// 停止接收新任务，等待队列中的任务执行完毕
  pub fn shutdown(mut self) {
    self.stop();
  }

  fn stop(&mut self) {
    if self.workers.is_empty() {
      return;
    }
    info!("关闭推理协调器, 剩余任务 {}", self.pending_count());
    self.senders.clear();
    self.evictors.clear();
    for handle in self.workers.drain(..) {
      let name = handle.thread().name().unwrap_or("npu-worker").to_string();
      if handle.join().is_err() {
        error!("{} 异常退出", name);
      }
    }
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
  if let Some(msg) = payload.downcast_ref::<&str>() {
    msg
  } else if let Some(msg) = payload.downcast_ref::<String>() {
    msg.as_str()
  } else {
    "未知错误"
  }
}

impl Drop for Coordinator {
  fn drop(&mut self) {
    self.stop();
  }
}

struct Worker<A: Accelerator> {
  index: usize,
  accel: A,
  processor: PostProcessor,
  letterbox: Option<LetterboxParams>,
  stage: TaskStage,
  jobs: Receiver<Job>,
  results: Sender<Completed>,
  counters: Arc<Counters>,
}

impl<A: Accelerator> Worker<A> {
  fn run(mut self) {
    info!("工作线程 {} 启动", self.index);
    while let Ok(job) = self.jobs.recv() {
      let id = job.id;
      self.stage = TaskStage::Submitted;
      let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.process(job)));
      match outcome {
        Ok(Ok(completed)) => {
          debug!("任务 {} 在工作线程 {}: {}", id, self.index, TaskStage::Completed);
          if self.results.send(completed).is_err() {
            self.counters.dropped.fetch_add(1, Ordering::SeqCst);
          }
          self.counters.pending.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(Err((stage, e))) => {
          error!(
            "任务 {} 在工作线程 {} 的{}阶段失败, 已丢弃: {}",
            id, self.index, stage, e
          );
          self.counters.drop_one();
        }
        Err(payload) => {
          error!(
            "任务 {} 在工作线程 {} 的{}阶段崩溃, 已丢弃: {}",
            id,
            self.index,
            self.stage,
            panic_message(payload.as_ref())
          );
          self.counters.drop_one();
        }
      }
    }
    info!("工作线程 {} 退出", self.index);
  }

  fn letterbox_for(&mut self, width: u32, height: u32) -> Option<LetterboxParams> {
    let size = self.processor.layout().input_size;
    match self.letterbox {
      Some(lb) if lb.src_width == width && lb.src_height == height => Some(lb),
      _ => {
        let lb = LetterboxParams::new(width, height, size)?;
        self.letterbox = Some(lb);
        Some(lb)
      }
    }
  }

  fn process(&mut self, job: Job) -> Result<Completed, (TaskStage, TaskFailure)> {
    let Job {
      id,
      image,
      submitted,
    } = job;
    let index = self.index;
    let trace = |slot: &mut TaskStage, stage: TaskStage| {
      *slot = stage;
      debug!("任务 {} 在工作线程 {}: {}", id, index, stage);
    };

    trace(&mut self.stage, TaskStage::Converting);
    let (width, height) = image.dimensions();
    let letterbox = self.letterbox_for(width, height).ok_or_else(|| {
      (
        TaskStage::Converting,
        TaskFailure::Convert(format!("无法为 {}x{} 的图像计算映射参数", width, height)),
      )
    })?;
    let input = letterbox.forward(&image);

    trace(&mut self.stage, TaskStage::Accelerating);
    let tensors = self
      .accel
      .run(input.as_raw())
      .map_err(|e| (TaskStage::Accelerating, TaskFailure::Accelerator(e.to_string())))?;

    trace(&mut self.stage, TaskStage::Decoding);
    let candidates = self
      .processor
      .decode(tensors, &letterbox)
      .map_err(|e| (TaskStage::Decoding, TaskFailure::from(e)))?;

    trace(&mut self.stage, TaskStage::PostProcessing);
    let result = self.processor.finish(&candidates, tensors, &letterbox);

    Ok(Completed {
      id,
      worker: self.index,
      image,
      result,
      elapsed: submitted.elapsed(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::SyntheticBuilder;

  #[test]
  fn config_from_url() {
    let url = Url::parse(
      "pool://?depth=8&policy=drop-oldest&conf=0.3&nms=0.5&max=16&cores=2&variant=segment",
    )
    .unwrap();
    let config = PoolConfig::from_url(&url).unwrap();
    let expected = PoolConfig::default()
      .queue_depth(8)
      .policy(BackpressurePolicy::DropOldest)
      .box_threshold(0.3)
      .nms_threshold(0.5)
      .max_detections(16)
      .cores(2)
      .variant(Some(ModelVariant::Segment));
    assert_eq!(config, expected);
  }

  #[test]
  fn config_defaults_follow_deployment_constants() {
    let config = PoolConfig::from_url(&Url::parse("pool://").unwrap()).unwrap();
    assert_eq!(config.get_queue_depth(), 4);
    assert_eq!(config.get_policy(), BackpressurePolicy::Block);
    assert_eq!(config.get_thresholds(), &Thresholds::default());
    assert_eq!(config.get_thresholds().max_detections, 128);
  }

  #[test]
  fn config_rejects_bad_values() {
    for url in [
      "pool://?depth=0",
      "pool://?policy=lifo",
      "pool://?conf=1.5",
      "pool://?cores=x",
      "pool://?speed=3",
      "synthetic://?depth=2",
    ] {
      assert!(
        PoolConfig::from_url(&Url::parse(url).unwrap()).is_err(),
        "{url}"
      );
    }
  }

  #[test]
  fn handles_are_bound_to_cores_round_robin() {
    let handles: Vec<_> = (0..4)
      .map(|_| {
        SyntheticBuilder::default()
          .input_size(32)
          .strides(&[8, 16])
          .build()
          .unwrap()
      })
      .collect();
    let probes: Vec<_> = handles.iter().map(|h| h.probe()).collect();
    let pool = Coordinator::new(handles, Labels::default(), PoolConfig::default()).unwrap();
    let cores: Vec<_> = probes.iter().map(|p| p.core()).collect();
    assert_eq!(cores, vec![Some(0), Some(1), Some(2), Some(0)]);
    assert_eq!(pool.worker_count(), 4);
    pool.shutdown();
  }

  #[test]
  fn rejects_empty_pool_and_mixed_variants() {
    let none: Vec<crate::model::SyntheticAccelerator> = Vec::new();
    assert!(matches!(
      Coordinator::new(none, Labels::default(), PoolConfig::default()),
      Err(PoolError::NoHandles)
    ));

    let build = |variant| {
      SyntheticBuilder::default()
        .variant(variant)
        .input_size(32)
        .strides(&[8, 16])
        .build()
        .unwrap()
    };
    let handles = vec![build(ModelVariant::Detect), build(ModelVariant::Segment)];
    assert!(matches!(
      Coordinator::new(handles, Labels::default(), PoolConfig::default()),
      Err(PoolError::VariantMismatch { worker: 1, .. })
    ));
  }

  #[test]
  fn empty_image_is_rejected_at_submit() {
    let handle = SyntheticBuilder::default()
      .input_size(32)
      .strides(&[8])
      .build()
      .unwrap();
    let pool = Coordinator::new(vec![handle], Labels::default(), PoolConfig::default()).unwrap();
    assert!(matches!(
      pool.submit(RgbImage::new(0, 10)),
      Err(PoolError::EmptyImage)
    ));
    assert_eq!(pool.pending_count(), 0);
  }

  /// 第 `panic_on` 次调用时直接崩溃的加速器
  struct PanickingAccelerator {
    inner: crate::model::SyntheticAccelerator,
    calls: usize,
    panic_on: usize,
  }

  impl Accelerator for PanickingAccelerator {
    type Error = crate::model::SyntheticError;

    fn metadata(&self) -> Result<crate::model::ModelMetadata, Self::Error> {
      self.inner.metadata()
    }

    fn run(&mut self, input: &[u8]) -> Result<&[crate::tensor::RawOutputTensor], Self::Error> {
      self.calls += 1;
      if self.calls == self.panic_on {
        panic!("驱动崩溃");
      }
      self.inner.run(input)
    }
  }

  #[test]
  fn panicking_accelerator_drops_the_task_and_keeps_the_worker() {
    let inner = SyntheticBuilder::default()
      .input_size(32)
      .strides(&[8, 16])
      .build()
      .unwrap();
    let accel = PanickingAccelerator {
      inner,
      calls: 0,
      panic_on: 1,
    };
    let pool = Coordinator::new(vec![accel], Labels::default(), PoolConfig::default()).unwrap();
    for _ in 0..3 {
      pool.submit(RgbImage::new(48, 32)).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut ids = Vec::new();
    while pool.pending_count() > 0 && Instant::now() < deadline {
      if let Some(done) = pool.receive_timeout(Duration::from_millis(20)) {
        ids.push(done.id);
      }
    }
    while let Some(done) = pool.try_receive() {
      ids.push(done.id);
    }

    assert_eq!(pool.pending_count(), 0);
    assert_eq!(pool.dropped_count(), 1);
    ids.sort();
    assert_eq!(ids, vec![1, 2]);
    pool.shutdown();
  }
}
