// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/synthetic.rs - 合成加速器，用于测试与基准
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{Accelerator, ModelMetadata, ModelVariant, layout::KEYPOINT_CHANNELS},
  tensor::{RawOutputTensor, TensorMeta},
};

const NO_CORE: usize = usize::MAX;
// 非目标分箱的 logit，softmax 后可忽略
const DFL_FLOOR_LOGIT: f32 = -50.0;
const MASK_CHANNELS: usize = 32;

#[derive(Error, Debug)]
pub enum SyntheticError {
  #[error("注入的推理失败: 第 {0} 次调用")]
  Injected(usize),
  #[error("输入长度不符: 期望 {expected}, 实际 {actual}")]
  InputSize { expected: usize, actual: usize },
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("参数错误: {0}")]
  ParameterError(String),
  #[error("目标 {0:?} 无法编码到任何检测头")]
  UnencodableObject(SyntheticObject),
}

/// 供测试观察加速器被调用情况的探针
#[derive(Debug)]
pub struct SyntheticProbe {
  calls: AtomicUsize,
  core: AtomicUsize,
}

impl Default for SyntheticProbe {
  fn default() -> Self {
    SyntheticProbe {
      calls: AtomicUsize::new(0),
      core: AtomicUsize::new(NO_CORE),
    }
  }
}

impl SyntheticProbe {
  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn core(&self) -> Option<usize> {
    match self.core.load(Ordering::SeqCst) {
      NO_CORE => None,
      core => Some(core),
    }
  }
}

/// 编码进输出张量的目标，坐标位于模型输入空间
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticObject {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
}

/// 每次调用都返回同一组输出张量的加速器
pub struct SyntheticAccelerator {
  metadata: ModelMetadata,
  outputs: Vec<RawOutputTensor>,
  latency: Duration,
  fail_every: usize,
  probe: Arc<SyntheticProbe>,
}

impl SyntheticAccelerator {
  /// 直接使用给定张量作为输出
  pub fn from_tensors(input_size: u32, outputs: Vec<RawOutputTensor>) -> Self {
    let metadata = ModelMetadata {
      input_size,
      outputs: outputs.iter().map(|t| t.meta().clone()).collect(),
    };
    SyntheticAccelerator {
      metadata,
      outputs,
      latency: Duration::ZERO,
      fail_every: 0,
      probe: Arc::new(SyntheticProbe::default()),
    }
  }

  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }

  /// 每第 `n` 次调用返回错误，0 表示从不失败
  pub fn with_fail_every(mut self, n: usize) -> Self {
    self.fail_every = n;
    self
  }

  pub fn probe(&self) -> Arc<SyntheticProbe> {
    self.probe.clone()
  }
}

impl Accelerator for SyntheticAccelerator {
  type Error = SyntheticError;

  fn metadata(&self) -> Result<ModelMetadata, Self::Error> {
    Ok(self.metadata.clone())
  }

  fn bind_core(&mut self, core: usize) -> Result<(), Self::Error> {
    self.probe.core.store(core, Ordering::SeqCst);
    Ok(())
  }

  fn run(&mut self, input: &[u8]) -> Result<&[RawOutputTensor], Self::Error> {
    let size = self.metadata.input_size as usize;
    let expected = size * size * 3;
    if input.len() != expected {
      return Err(SyntheticError::InputSize {
        expected,
        actual: input.len(),
      });
    }

    if !self.latency.is_zero() {
      std::thread::sleep(self.latency);
    }

    let calls = self.probe.calls.fetch_add(1, Ordering::SeqCst) + 1;
    if self.fail_every > 0 && calls % self.fail_every == 0 {
      return Err(SyntheticError::Injected(calls));
    }
    Ok(&self.outputs)
  }
}

/// 按 rknn_model_zoo 的 YOLOv8 输出顺序生成浮点张量
pub struct SyntheticBuilder {
  variant: ModelVariant,
  input_size: u32,
  num_classes: usize,
  dfl_len: usize,
  strides: Vec<usize>,
  latency: Duration,
  fail_every: usize,
  objects: Vec<SyntheticObject>,
}

impl Default for SyntheticBuilder {
  fn default() -> Self {
    SyntheticBuilder {
      variant: ModelVariant::Detect,
      input_size: 640,
      num_classes: 80,
      dfl_len: 16,
      strides: vec![8, 16, 32],
      latency: Duration::ZERO,
      fail_every: 0,
      objects: Vec::new(),
    }
  }
}

impl FromUrlWithScheme for SyntheticBuilder {
  const SCHEME: &'static str = "synthetic";
}

impl FromUrl for SyntheticBuilder {
  type Error = SyntheticError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(SyntheticError::SchemeMismatch(format!(
        "期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let mut builder = SyntheticBuilder::default();
    for (key, value) in url.query_pairs() {
      let invalid = || SyntheticError::ParameterError(format!("{}={}", key, value));
      match key.as_ref() {
        "latency_ms" => {
          let ms = value.parse::<u64>().map_err(|_| invalid())?;
          builder.latency = Duration::from_millis(ms);
        }
        "classes" => builder.num_classes = value.parse().map_err(|_| invalid())?,
        "size" => builder.input_size = value.parse().map_err(|_| invalid())?,
        "dfl" => builder.dfl_len = value.parse().map_err(|_| invalid())?,
        "fail_every" => builder.fail_every = value.parse().map_err(|_| invalid())?,
        "variant" => builder.variant = value.parse().map_err(|_| invalid())?,
        _ => {
          return Err(SyntheticError::ParameterError(format!(
            "未知参数 '{}'",
            key
          )));
        }
      }
    }
    Ok(builder)
  }
}

impl SyntheticBuilder {
  pub fn variant(mut self, variant: ModelVariant) -> Self {
    self.variant = variant;
    self
  }

  pub fn input_size(mut self, size: u32) -> Self {
    self.input_size = size;
    self
  }

  pub fn num_classes(mut self, classes: usize) -> Self {
    self.num_classes = classes;
    self
  }

  pub fn dfl_len(mut self, len: usize) -> Self {
    self.dfl_len = len;
    self
  }

  pub fn strides(mut self, strides: &[usize]) -> Self {
    self.strides = strides.to_vec();
    self
  }

  pub fn latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }

  pub fn fail_every(mut self, n: usize) -> Self {
    self.fail_every = n;
    self
  }

  pub fn object(mut self, object: SyntheticObject) -> Self {
    self.objects.push(object);
    self
  }

  pub fn build(&self) -> Result<SyntheticAccelerator, SyntheticError> {
    let size = self.input_size as usize;
    if size == 0 || self.num_classes == 0 || self.dfl_len < 2 || self.strides.is_empty() {
      return Err(SyntheticError::ParameterError(format!(
        "size={}, classes={}, dfl={}, strides={:?}",
        size, self.num_classes, self.dfl_len, self.strides
      )));
    }
    if let Some(&s) = self.strides.iter().find(|&&s| s == 0 || size % s != 0) {
      return Err(SyntheticError::ParameterError(format!(
        "步长 {} 不能整除输入尺寸 {}",
        s, size
      )));
    }

    let mut heads: Vec<Head> = self
      .strides
      .iter()
      .map(|&stride| Head::new(self.variant, size / stride, self.num_classes, self.dfl_len))
      .collect();

    for object in &self.objects {
      self.encode(&mut heads, object)?;
    }

    let mut outputs = Vec::new();
    for (i, head) in heads.into_iter().enumerate() {
      head.push_tensors(i, self.variant, &mut outputs);
    }
    if self.variant == ModelVariant::Segment {
      let proto_size = size / 4;
      let mut proto = vec![0.0; MASK_CHANNELS * proto_size * proto_size];
      // 第 0 个原型通道恒为正，掩码范围完全由检测框裁剪决定
      proto[..proto_size * proto_size].fill(1.0);
      outputs.push(float_tensor(
        "proto",
        &[1, MASK_CHANNELS, proto_size, proto_size],
        proto,
      ));
    }

    info!(
      "合成加速器: 种类={}, 输入={}, 类别={}, 输出={}, 目标={}",
      self.variant,
      size,
      self.num_classes,
      outputs.len(),
      self.objects.len()
    );

    Ok(
      SyntheticAccelerator::from_tensors(self.input_size, outputs)
        .with_latency(self.latency)
        .with_fail_every(self.fail_every),
    )
  }

  /// 选择最小的、能以 DFL 表示该目标的检测头
  fn encode(&self, heads: &mut [Head], object: &SyntheticObject) -> Result<(), SyntheticError> {
    let [x1, y1, x2, y2] = object.bbox;
    let cx = (x1 + x2) / 2.0;
    let cy = (y1 + y2) / 2.0;
    let max_bin = (self.dfl_len - 1) as f32;

    if object.class_id as usize >= self.num_classes {
      return Err(SyntheticError::UnencodableObject(object.clone()));
    }

    for (head, &stride) in heads.iter_mut().zip(&self.strides) {
      let s = stride as f32;
      let j = (cx / s).floor();
      let i = (cy / s).floor();
      if j < 0.0 || i < 0.0 || j as usize >= head.grid || i as usize >= head.grid {
        continue;
      }
      let anchor_x = j + 0.5;
      let anchor_y = i + 0.5;
      let distances = [
        anchor_x - x1 / s,
        anchor_y - y1 / s,
        x2 / s - anchor_x,
        y2 / s - anchor_y,
      ];
      if distances.iter().any(|&d| !(0.0..=max_bin).contains(&d)) {
        continue;
      }

      let cell = i as usize * head.grid + j as usize;
      head.set_object(cell, &distances, object);
      debug!(
        "目标 {:?} 编码到步长 {} 的网格 ({}, {})",
        object.bbox, stride, i, j
      );
      return Ok(());
    }
    Err(SyntheticError::UnencodableObject(object.clone()))
  }
}

struct Head {
  grid: usize,
  num_classes: usize,
  dfl_len: usize,
  boxes: Vec<f32>,
  scores: Vec<f32>,
  score_sum: Vec<f32>,
  aux_channels: usize,
  aux: Vec<f32>,
}

impl Head {
  fn new(variant: ModelVariant, grid: usize, num_classes: usize, dfl_len: usize) -> Self {
    let cells = grid * grid;
    let (aux_channels, aux_fill) = match variant {
      ModelVariant::Detect => (0, 0.0),
      ModelVariant::Segment => (MASK_CHANNELS, 0.0),
      ModelVariant::Pose => (KEYPOINT_CHANNELS, 0.0),
      // 角度原始值 0.25 对应 0 弧度
      ModelVariant::Obb => (1, 0.25),
    };

    // 未编码目标的格子: DFL 全部集中在第 0 个分箱
    let mut boxes = vec![DFL_FLOOR_LOGIT; 4 * dfl_len * cells];
    for side in 0..4 {
      let start = side * dfl_len * cells;
      boxes[start..start + cells].fill(0.0);
    }

    Head {
      grid,
      num_classes,
      dfl_len,
      boxes,
      scores: vec![0.0; num_classes * cells],
      score_sum: vec![0.0; cells],
      aux_channels,
      aux: vec![aux_fill; aux_channels * cells],
    }
  }

  fn set_object(&mut self, cell: usize, distances: &[f32; 4], object: &SyntheticObject) {
    let cells = self.grid * self.grid;
    for (side, &d) in distances.iter().enumerate() {
      let base = side * self.dfl_len;
      for bin in 0..self.dfl_len {
        self.boxes[(base + bin) * cells + cell] = DFL_FLOOR_LOGIT;
      }
      // 相邻两个分箱按线性插值分配概率，期望值即为 d
      let lower = d.floor();
      let frac = d - lower;
      let lower = lower as usize;
      self.boxes[(base + lower) * cells + cell] = logit(1.0 - frac);
      if frac > 0.0 {
        self.boxes[(base + lower + 1) * cells + cell] = logit(frac);
      }
    }

    let class = object.class_id as usize;
    self.scores[class * cells + cell] = object.score;
    self.score_sum[cell] += object.score;

    if self.aux_channels == MASK_CHANNELS {
      self.aux[cell] = 1.0;
    }
  }

  fn push_tensors(self, index: usize, variant: ModelVariant, outputs: &mut Vec<RawOutputTensor>) {
    let g = self.grid;
    outputs.push(float_tensor(
      &format!("box{index}"),
      &[1, 4 * self.dfl_len, g, g],
      self.boxes,
    ));
    outputs.push(float_tensor(
      &format!("score{index}"),
      &[1, self.num_classes, g, g],
      self.scores,
    ));
    if variant != ModelVariant::Obb {
      outputs.push(float_tensor(
        &format!("score_sum{index}"),
        &[1, 1, g, g],
        self.score_sum,
      ));
    }
    let aux_name = match variant {
      ModelVariant::Detect => return,
      ModelVariant::Segment => format!("seg{index}"),
      ModelVariant::Pose => format!("kpt{index}"),
      ModelVariant::Obb => format!("angle{index}"),
    };
    outputs.push(float_tensor(&aux_name, &[1, self.aux_channels, g, g], self.aux));
  }
}

fn logit(p: f32) -> f32 {
  if p > 0.0 { p.ln() } else { DFL_FLOOR_LOGIT }
}

fn float_tensor(name: &str, shape: &[usize], data: Vec<f32>) -> RawOutputTensor {
  let meta = TensorMeta::float32(name, shape);
  match RawOutputTensor::float32(meta, data) {
    Some(tensor) => tensor,
    None => unreachable!("合成张量的长度由形状计算得到"),
  }
}
