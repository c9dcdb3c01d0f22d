// 该文件是 Shanan （山南西风） 项目的一部分。
// src/postprocess/decode.rs - 逐步长解码候选框
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::f32::consts::PI;

use tracing::debug;

use crate::{
  model::{
    Keypoint, ModelVariant, NUM_KEYPOINTS,
    layout::{Branch, OutputLayout},
  },
  tensor::{RawOutputTensor, TensorView},
};

/// 解码得到的候选，按并行数组存放，坐标位于模型输入空间
#[derive(Debug, Default)]
pub(crate) struct Candidates {
  /// [x, y, w, h]
  pub boxes: Vec<[f32; 4]>,
  pub scores: Vec<f32>,
  pub class_ids: Vec<u32>,
  /// 每个候选 `mask_channels` 个分割系数，量化模型为截断到 int8 的 `raw - zero_point`
  pub mask_coeffs: Vec<f32>,
  pub mask_channels: usize,
  pub keypoints: Vec<[Keypoint; NUM_KEYPOINTS]>,
  pub angles: Vec<f32>,
}

impl Candidates {
  pub fn len(&self) -> usize {
    self.scores.len()
  }

  pub fn coeffs(&self, index: usize) -> &[f32] {
    let c = self.mask_channels;
    &self.mask_coeffs[index * c..(index + 1) * c]
  }

  /// 旋转框 [cx, cy, w, h, angle]
  pub fn oriented(&self, index: usize) -> [f32; 5] {
    let [x, y, w, h] = self.boxes[index];
    let angle = self.angles.get(index).copied().unwrap_or(0.0);
    [x + w / 2.0, y + h / 2.0, w, h, angle]
  }

  fn push(&mut self, bbox: [f32; 4], score: f32, class_id: u32) {
    self.boxes.push(bbox);
    self.scores.push(score);
    self.class_ids.push(class_id);
  }
}

/// 在原始数值域上比较阈值的分类张量
///
/// 量化模型的阈值每次调用量化一次，逐格比较直接使用 int8 原始值。
enum ScoreGate<'a> {
  Int8 {
    data: &'a [i8],
    threshold: i8,
    floor: i8,
    quant: crate::tensor::QuantParams,
  },
  Float32 {
    data: &'a [f32],
    threshold: f32,
  },
}

impl<'a> ScoreGate<'a> {
  fn new(view: TensorView<'a>, threshold: f32) -> Self {
    match view {
      TensorView::Int8 { data, quant } => ScoreGate::Int8 {
        data,
        threshold: quant.quantize(threshold),
        // 零点取负后按 int8 回绕，与部署端的初始值保持一致
        floor: (-quant.zero_point) as i8,
        quant,
      },
      TensorView::Float32(data) => ScoreGate::Float32 { data, threshold },
    }
  }

  /// 分数和张量的短路判断
  fn passes(&self, index: usize) -> bool {
    match self {
      ScoreGate::Int8 {
        data, threshold, ..
      } => data[index] >= *threshold,
      ScoreGate::Float32 { data, threshold } => data[index] >= *threshold,
    }
  }

  /// 该格子上得分最高且超过阈值的类别
  fn best_class(&self, classes: usize, cells: usize, cell: usize) -> Option<(u32, f32)> {
    match self {
      ScoreGate::Int8 {
        data,
        threshold,
        floor,
        quant,
      } => {
        let mut max = *floor;
        let mut id = None;
        for c in 0..classes {
          let raw = data[c * cells + cell];
          if raw > *threshold && raw > max {
            max = raw;
            id = Some(c as u32);
          }
        }
        id.filter(|_| max > *threshold)
          .map(|id| (id, quant.dequantize(max)))
      }
      ScoreGate::Float32 { data, threshold } => {
        let mut max = 0.0f32;
        let mut id = None;
        for c in 0..classes {
          let score = data[c * cells + cell];
          if score > *threshold && score > max {
            max = score;
            id = Some(c as u32);
          }
        }
        id.filter(|_| max > *threshold).map(|id| (id, max))
      }
    }
  }
}

/// DFL 分布的期望: 数值稳定的 softmax 后按分箱下标加权
///
/// 第 `b` 个分箱位于 `offset + b * step`。
fn dfl_expectation(
  view: &TensorView<'_>,
  offset: usize,
  step: usize,
  len: usize,
  buf: &mut [f32],
) -> f32 {
  let mut max = f32::NEG_INFINITY;
  for (b, slot) in buf.iter_mut().enumerate().take(len) {
    *slot = view.value(offset + b * step);
    max = max.max(*slot);
  }
  let mut sum = 0.0;
  for slot in buf.iter_mut().take(len) {
    *slot = (*slot - max).exp();
    sum += *slot;
  }
  buf
    .iter()
    .take(len)
    .enumerate()
    .map(|(b, p)| b as f32 * p / sum)
    .sum()
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

/// 量化张量取 `raw - zero_point`，浮点张量取原值
pub(super) fn centered(view: &TensorView<'_>, index: usize) -> f32 {
  match view {
    TensorView::Int8 { data, quant } => data[index] as f32 - quant.zero_point as f32,
    TensorView::Float32(data) => data[index],
  }
}

/// 分割系数；量化张量的 `raw - zero_point` 截断回 int8
fn mask_coefficient(view: &TensorView<'_>, index: usize) -> f32 {
  match view {
    TensorView::Int8 { data, quant } => (data[index] as i32 - quant.zero_point) as i8 as f32,
    TensorView::Float32(data) => data[index],
  }
}

pub(crate) fn decode(
  layout: &OutputLayout,
  tensors: &[RawOutputTensor],
  box_threshold: f32,
) -> Candidates {
  let mut candidates = Candidates {
    mask_channels: layout.prototype.as_ref().map_or(0, |p| p.channels),
    ..Default::default()
  };
  let mut dfl_buf = vec![0.0f32; layout.dfl_len];

  for branch in &layout.branches {
    let before = candidates.len();
    decode_branch(
      layout,
      branch,
      tensors,
      box_threshold,
      &mut dfl_buf,
      &mut candidates,
    );
    debug!(
      "步长 {} 解码得到 {} 个候选",
      branch.stride,
      candidates.len() - before
    );
  }
  candidates
}

fn decode_branch(
  layout: &OutputLayout,
  branch: &Branch,
  tensors: &[RawOutputTensor],
  box_threshold: f32,
  dfl_buf: &mut [f32],
  out: &mut Candidates,
) {
  let cells = branch.grid_len();
  let stride = branch.stride as f32;
  let boxes = tensors[branch.box_index].view();
  let scores = ScoreGate::new(tensors[branch.score_index].view(), box_threshold);
  let score_sum = branch
    .score_sum_index
    .map(|i| ScoreGate::new(tensors[i].view(), box_threshold));
  let aux = branch.aux_index.map(|i| tensors[i].view());

  for i in 0..branch.grid_h {
    for j in 0..branch.grid_w {
      let cell = i * branch.grid_w + j;
      if let Some(sum) = &score_sum
        && !sum.passes(cell)
      {
        continue;
      }
      let Some((class_id, score)) = scores.best_class(layout.num_classes, cells, cell) else {
        continue;
      };

      let mut dist = [0.0f32; 4];
      for (side, d) in dist.iter_mut().enumerate() {
        let offset = side * layout.dfl_len * cells + cell;
        *d = dfl_expectation(&boxes, offset, cells, layout.dfl_len, dfl_buf);
      }
      let [l, t, r, b] = dist;
      let (x, y) = (j as f32 + 0.5, i as f32 + 0.5);

      match (layout.variant, &aux) {
        (ModelVariant::Obb, Some(angle_view)) => {
          let angle = (angle_view.value(cell) - 0.25) * PI;
          let (sin, cos) = angle.sin_cos();
          let xf = (r - l) / 2.0;
          let yf = (b - t) / 2.0;
          let cx = (xf * cos - yf * sin + x) * stride;
          let cy = (xf * sin + yf * cos + y) * stride;
          let w = (l + r) * stride;
          let h = (t + b) * stride;
          out.push([cx - w / 2.0, cy - h / 2.0, w, h], score, class_id);
          out.angles.push(angle);
        }
        _ => {
          let x1 = (x - l) * stride;
          let y1 = (y - t) * stride;
          let x2 = (x + r) * stride;
          let y2 = (y + b) * stride;
          out.push([x1, y1, x2 - x1, y2 - y1], score, class_id);
        }
      }

      match (layout.variant, &aux) {
        (ModelVariant::Segment, Some(coeffs)) => {
          for c in 0..out.mask_channels {
            out.mask_coeffs.push(mask_coefficient(coeffs, c * cells + cell));
          }
        }
        (ModelVariant::Pose, Some(kpts)) => {
          let mut keypoints = [Keypoint::default(); NUM_KEYPOINTS];
          for (k, kp) in keypoints.iter_mut().enumerate() {
            let kx = kpts.value((3 * k) * cells + cell);
            let ky = kpts.value((3 * k + 1) * cells + cell);
            let kv = kpts.value((3 * k + 2) * cells + cell);
            *kp = Keypoint {
              x: (kx * 2.0 + j as f32) * stride,
              y: (ky * 2.0 + i as f32) * stride,
              visibility: sigmoid(kv),
            };
          }
          out.keypoints.push(keypoints);
        }
        _ => {}
      }
    }
  }
}
