// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/layout.rs - 输出张量布局协商
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
  model::{ModelMetadata, ModelVariant, NUM_KEYPOINTS},
  tensor::{DataType, RawOutputTensor, TensorMeta},
};

/// 姿态模型每个网格的关键点通道数 (x, y, 可见度)
pub const KEYPOINT_CHANNELS: usize = NUM_KEYPOINTS * 3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LayoutError {
  #[error("模型没有输出张量")]
  NoOutputs,
  #[error("无法识别的输出布局: {0}")]
  Unrecognized(String),
  #[error("输出 {index} ({name}) 形状不符: {reason}")]
  Shape {
    index: usize,
    name: String,
    reason: String,
  },
  #[error("输出 {0} 的数据类型与输出 0 不一致")]
  MixedDataType(usize),
  #[error("分割模型类别数 {0} 超出标签图上限 255")]
  TooManyClasses(usize),
  #[error("输出数量不符: 期望 {expected}, 实际 {actual}")]
  OutputCount { expected: usize, actual: usize },
}

/// 单个步长的检测头
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
  pub grid_h: usize,
  pub grid_w: usize,
  pub stride: usize,
  pub box_index: usize,
  pub score_index: usize,
  pub score_sum_index: Option<usize>,
  /// 分割系数、关键点或角度
  pub aux_index: Option<usize>,
}

impl Branch {
  pub fn grid_len(&self) -> usize {
    self.grid_h * self.grid_w
  }
}

/// 分割原型张量 `[1, C, H, W]`
#[derive(Debug, Clone, PartialEq)]
pub struct Prototype {
  pub index: usize,
  pub channels: usize,
  pub height: usize,
  pub width: usize,
}

/// 经过校验的输出布局，初始化时生成一次
#[derive(Debug, Clone, PartialEq)]
pub struct OutputLayout {
  pub variant: ModelVariant,
  pub input_size: u32,
  pub dfl_len: usize,
  pub num_classes: usize,
  pub quantized: bool,
  pub branches: Vec<Branch>,
  pub prototype: Option<Prototype>,
  outputs: Vec<TensorMeta>,
}

impl OutputLayout {
  /// 根据输出张量的名称和数量判断模型种类，再按该种类解析布局
  pub fn negotiate(metadata: &ModelMetadata) -> Result<Self, LayoutError> {
    let variant = sniff_variant(&metadata.outputs)?;
    info!("识别到模型种类: {}", variant);
    Self::for_variant(variant, metadata)
  }

  /// 按指定种类解析布局
  pub fn for_variant(variant: ModelVariant, metadata: &ModelMetadata) -> Result<Self, LayoutError> {
    let layout = Parser::new(variant, metadata)?.parse().inspect_err(|e| {
      error!("模型输出布局校验失败: {}", e);
    })?;

    debug!(
      "输出布局: 种类={}, 检测头={}, dfl={}, 类别={}, 量化={}",
      layout.variant,
      layout.branches.len(),
      layout.dfl_len,
      layout.num_classes,
      layout.quantized
    );
    Ok(layout)
  }

  pub fn outputs(&self) -> &[TensorMeta] {
    &self.outputs
  }

  /// 检查一次推理的输出是否仍符合初始化时的布局
  pub fn check(&self, tensors: &[RawOutputTensor]) -> Result<(), LayoutError> {
    if tensors.len() != self.outputs.len() {
      return Err(LayoutError::OutputCount {
        expected: self.outputs.len(),
        actual: tensors.len(),
      });
    }
    for (index, (tensor, expected)) in tensors.iter().zip(&self.outputs).enumerate() {
      let meta = tensor.meta();
      if meta.dtype != expected.dtype {
        return Err(LayoutError::MixedDataType(index));
      }
      if meta.shape != expected.shape {
        return Err(LayoutError::Shape {
          index,
          name: meta.name.clone(),
          reason: format!("期望 {:?}, 实际 {:?}", expected.shape, meta.shape),
        });
      }
    }
    Ok(())
  }
}

fn sniff_variant(outputs: &[TensorMeta]) -> Result<ModelVariant, LayoutError> {
  if outputs.is_empty() {
    return Err(LayoutError::NoOutputs);
  }
  let has = |pattern: &str| {
    outputs
      .iter()
      .any(|t| t.name.to_ascii_lowercase().contains(pattern))
  };

  let variant = if has("angle") {
    ModelVariant::Obb
  } else if has("kpt") {
    ModelVariant::Pose
  } else if has("proto") || outputs.len() == 13 {
    ModelVariant::Segment
  } else {
    ModelVariant::Detect
  };
  Ok(variant)
}

struct Parser<'a> {
  variant: ModelVariant,
  size: usize,
  outputs: &'a [TensorMeta],
}

impl<'a> Parser<'a> {
  fn new(variant: ModelVariant, metadata: &'a ModelMetadata) -> Result<Self, LayoutError> {
    let outputs = metadata.outputs.as_slice();
    let first = outputs.first().ok_or(LayoutError::NoOutputs)?;
    if let Some(index) = outputs.iter().position(|t| t.dtype != first.dtype) {
      return Err(LayoutError::MixedDataType(index));
    }
    Ok(Parser {
      variant,
      size: metadata.input_size as usize,
      outputs,
    })
  }

  fn shape_error(&self, index: usize, reason: impl Into<String>) -> LayoutError {
    LayoutError::Shape {
      index,
      name: self.outputs[index].name.clone(),
      reason: reason.into(),
    }
  }

  /// `[1, C, H, W]` -> (C, H, W)
  fn dims(&self, index: usize) -> Result<(usize, usize, usize), LayoutError> {
    let shape = &self.outputs[index].shape;
    if shape.len() != 4 || shape[0] != 1 {
      return Err(self.shape_error(index, format!("期望 [1, C, H, W], 实际 {:?}", shape)));
    }
    if shape[1] == 0 || shape[2] == 0 || shape[3] == 0 {
      return Err(self.shape_error(index, "存在为 0 的维度"));
    }
    Ok((shape[1], shape[2], shape[3]))
  }

  fn is_plane(&self, index: usize, end: usize, grid: (usize, usize), channels: usize) -> bool {
    index < end
      && self
        .dims(index)
        .is_ok_and(|(c, h, w)| c == channels && (h, w) == grid)
  }

  fn expect_plane(
    &self,
    index: usize,
    end: usize,
    grid: (usize, usize),
    channels: usize,
    what: &str,
  ) -> Result<usize, LayoutError> {
    if index >= end {
      return Err(LayoutError::Unrecognized(format!(
        "{} 模型的检测头缺少{}输出",
        self.variant, what
      )));
    }
    let (c, h, w) = self.dims(index)?;
    if c != channels || (h, w) != grid {
      return Err(self.shape_error(
        index,
        format!(
          "{}输出期望 [1, {}, {}, {}], 实际 [1, {}, {}, {}]",
          what, channels, grid.0, grid.1, c, h, w
        ),
      ));
    }
    Ok(index)
  }

  fn parse_prototype(&self, index: usize) -> Result<Prototype, LayoutError> {
    let (channels, height, width) = self.dims(index)?;
    if self.size % height != 0 || self.size % width != 0 || self.size / height != self.size / width
    {
      return Err(self.shape_error(
        index,
        format!("原型尺寸 {}x{} 与输入尺寸 {} 不成整数比例", height, width, self.size),
      ));
    }
    Ok(Prototype {
      index,
      channels,
      height,
      width,
    })
  }

  fn parse(self) -> Result<OutputLayout, LayoutError> {
    let (end, prototype) = match self.variant {
      ModelVariant::Segment => {
        let last = self.outputs.len() - 1;
        (last, Some(self.parse_prototype(last)?))
      }
      _ => (self.outputs.len(), None),
    };

    let mut branches = Vec::new();
    let mut dfl_len = None;
    let mut num_classes = None;
    let mut idx = 0;

    while idx < end {
      let box_index = idx;
      let (box_ch, gh, gw) = self.dims(box_index)?;
      if box_ch % 4 != 0 {
        return Err(self.shape_error(box_index, format!("回归通道数 {} 不是 4 的倍数", box_ch)));
      }
      match dfl_len {
        Some(len) if len != box_ch / 4 => {
          return Err(self.shape_error(box_index, "各检测头的 DFL 长度不一致"));
        }
        _ => dfl_len = Some(box_ch / 4),
      }

      let score_index = idx + 1;
      if score_index >= end {
        return Err(LayoutError::Unrecognized(format!(
          "输出 {} 之后缺少分类输出",
          box_index
        )));
      }
      let (classes, sh, sw) = self.dims(score_index)?;
      if (sh, sw) != (gh, gw) {
        return Err(self.shape_error(score_index, "分类输出与回归输出网格不一致"));
      }
      match num_classes {
        Some(n) if n != classes => {
          return Err(self.shape_error(score_index, "各检测头的类别数不一致"));
        }
        _ => num_classes = Some(classes),
      }
      idx += 2;

      let grid = (gh, gw);
      let mut score_sum_index = None;
      let mut aux_index = None;
      match self.variant {
        ModelVariant::Detect => {
          if self.is_plane(idx, end, grid, 1) {
            score_sum_index = Some(idx);
            idx += 1;
          }
        }
        ModelVariant::Segment | ModelVariant::Pose => {
          if self.is_plane(idx, end, grid, 1) {
            score_sum_index = Some(idx);
            idx += 1;
          }
          let (channels, what) = match (&self.variant, &prototype) {
            (ModelVariant::Segment, Some(proto)) => (proto.channels, "分割系数"),
            _ => (KEYPOINT_CHANNELS, "关键点"),
          };
          aux_index = Some(self.expect_plane(idx, end, grid, channels, what)?);
          idx += 1;
        }
        ModelVariant::Obb => {
          if self.is_plane(idx, end, grid, 1) && self.is_plane(idx + 1, end, grid, 1) {
            score_sum_index = Some(idx);
            idx += 1;
          }
          aux_index = Some(self.expect_plane(idx, end, grid, 1, "角度")?);
          idx += 1;
        }
      }

      if self.size % gh != 0 || self.size % gw != 0 || self.size / gh != self.size / gw {
        return Err(self.shape_error(
          box_index,
          format!("网格 {}x{} 与输入尺寸 {} 不成整数步长", gh, gw, self.size),
        ));
      }

      branches.push(Branch {
        grid_h: gh,
        grid_w: gw,
        stride: self.size / gh,
        box_index,
        score_index,
        score_sum_index,
        aux_index,
      });
    }

    let (Some(dfl_len), Some(num_classes)) = (dfl_len, num_classes) else {
      return Err(LayoutError::Unrecognized("没有可用的检测头".to_string()));
    };

    if self.variant == ModelVariant::Segment && num_classes > u8::MAX as usize - 1 {
      return Err(LayoutError::TooManyClasses(num_classes));
    }

    Ok(OutputLayout {
      variant: self.variant,
      input_size: self.size as u32,
      dfl_len,
      num_classes,
      quantized: self.outputs[0].dtype == DataType::Int8,
      branches,
      prototype,
      outputs: self.outputs.to_vec(),
    })
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::tensor::QuantParams;

  /// 按 rknn_model_zoo 的顺序生成浮点输出描述
  pub(crate) fn metas(
    variant: ModelVariant,
    size: usize,
    classes: usize,
    dfl: usize,
    strides: &[usize],
    with_sum: bool,
  ) -> Vec<TensorMeta> {
    let mut out = Vec::new();
    for (i, &s) in strides.iter().enumerate() {
      let g = size / s;
      out.push(TensorMeta::float32(format!("box{i}"), &[1, 4 * dfl, g, g]));
      out.push(TensorMeta::float32(format!("score{i}"), &[1, classes, g, g]));
      if with_sum {
        out.push(TensorMeta::float32(format!("score_sum{i}"), &[1, 1, g, g]));
      }
      match variant {
        ModelVariant::Detect => {}
        ModelVariant::Segment => out.push(TensorMeta::float32(format!("seg{i}"), &[1, 32, g, g])),
        ModelVariant::Pose => out.push(TensorMeta::float32(
          format!("kpt{i}"),
          &[1, KEYPOINT_CHANNELS, g, g],
        )),
        ModelVariant::Obb => out.push(TensorMeta::float32(format!("angle{i}"), &[1, 1, g, g])),
      }
    }
    if variant == ModelVariant::Segment {
      out.push(TensorMeta::float32("proto", &[1, 32, size / 4, size / 4]));
    }
    out
  }

  fn metadata(outputs: Vec<TensorMeta>) -> ModelMetadata {
    ModelMetadata {
      input_size: 640,
      outputs,
    }
  }

  #[test]
  fn negotiates_detect_with_score_sum() {
    let meta = metadata(metas(ModelVariant::Detect, 640, 80, 16, &[8, 16, 32], true));
    let layout = OutputLayout::negotiate(&meta).unwrap();
    assert_eq!(layout.variant, ModelVariant::Detect);
    assert_eq!(layout.dfl_len, 16);
    assert_eq!(layout.num_classes, 80);
    assert!(!layout.quantized);
    assert_eq!(layout.branches.len(), 3);
    assert_eq!(layout.branches[1].stride, 16);
    assert_eq!(layout.branches[1].box_index, 3);
    assert_eq!(layout.branches[1].score_sum_index, Some(5));
    assert_eq!(layout.branches[2].grid_len(), 400);
  }

  #[test]
  fn single_class_without_sum_is_not_mistaken_for_sum() {
    let meta = metadata(metas(ModelVariant::Detect, 640, 1, 4, &[8, 16], false));
    let layout = OutputLayout::negotiate(&meta).unwrap();
    assert_eq!(layout.branches.len(), 2);
    assert_eq!(layout.branches[0].score_sum_index, None);
    assert_eq!(layout.branches[1].box_index, 2);
  }

  #[test]
  fn single_class_with_sum() {
    let meta = metadata(metas(ModelVariant::Detect, 640, 1, 4, &[8, 16], true));
    let layout = OutputLayout::negotiate(&meta).unwrap();
    assert_eq!(layout.branches.len(), 2);
    assert_eq!(layout.branches[0].score_sum_index, Some(2));
  }

  #[test]
  fn negotiates_segment_from_thirteen_outputs() {
    let meta = metadata(metas(ModelVariant::Segment, 640, 80, 16, &[8, 16, 32], true));
    assert_eq!(meta.outputs.len(), 13);
    let layout = OutputLayout::negotiate(&meta).unwrap();
    assert_eq!(layout.variant, ModelVariant::Segment);
    let proto = layout.prototype.as_ref().unwrap();
    assert_eq!((proto.index, proto.channels, proto.height), (12, 32, 160));
    assert_eq!(layout.branches[2].aux_index, Some(11));
  }

  #[test]
  fn negotiates_pose_and_obb_by_name() {
    let meta = metadata(metas(ModelVariant::Pose, 640, 1, 16, &[8, 16, 32], false));
    let layout = OutputLayout::negotiate(&meta).unwrap();
    assert_eq!(layout.variant, ModelVariant::Pose);
    assert_eq!(layout.branches[0].aux_index, Some(2));

    let meta = metadata(metas(ModelVariant::Obb, 640, 15, 16, &[8, 16, 32], false));
    let layout = OutputLayout::negotiate(&meta).unwrap();
    assert_eq!(layout.variant, ModelVariant::Obb);
    assert_eq!(layout.branches[0].score_sum_index, None);
    assert_eq!(layout.branches[0].aux_index, Some(2));
  }

  #[test]
  fn rejects_unrecognized_layouts() {
    let mut outputs = metas(ModelVariant::Detect, 640, 80, 16, &[8, 16, 32], false);
    outputs[0].shape = vec![1, 63, 80, 80];
    assert!(matches!(
      OutputLayout::negotiate(&metadata(outputs)),
      Err(LayoutError::Shape { index: 0, .. })
    ));

    let outputs = vec![TensorMeta::float32("output0", &[1, 84, 8400])];
    assert!(OutputLayout::negotiate(&metadata(outputs)).is_err());

    assert_eq!(
      OutputLayout::negotiate(&metadata(Vec::new())),
      Err(LayoutError::NoOutputs)
    );
  }

  #[test]
  fn rejects_missing_auxiliary_output() {
    let outputs = metas(ModelVariant::Detect, 640, 80, 16, &[8, 16, 32], false);
    let meta = metadata(outputs);
    assert!(OutputLayout::for_variant(ModelVariant::Pose, &meta).is_err());
  }

  #[test]
  fn rejects_mixed_data_types() {
    let mut outputs = metas(ModelVariant::Detect, 640, 80, 16, &[8, 16, 32], false);
    outputs[3] = TensorMeta::int8("score1", &[1, 80, 40, 40], QuantParams::new(-128, 0.003));
    assert_eq!(
      OutputLayout::negotiate(&metadata(outputs)),
      Err(LayoutError::MixedDataType(3))
    );
  }

  #[test]
  fn rejects_non_integer_stride() {
    let outputs = vec![
      TensorMeta::float32("box", &[1, 64, 7, 7]),
      TensorMeta::float32("score", &[1, 80, 7, 7]),
    ];
    assert!(matches!(
      OutputLayout::negotiate(&metadata(outputs)),
      Err(LayoutError::Shape { index: 0, .. })
    ));
  }
}
