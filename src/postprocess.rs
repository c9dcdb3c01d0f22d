// 该文件是 Shanan （山南西风） 项目的一部分。
// src/postprocess.rs - 输出张量解码与后处理
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use thiserror::Error;
use tracing::debug;

use crate::{
  letterbox::LetterboxParams,
  model::{
    DetectionResult, ModelMetadata, ModelVariant,
    layout::{LayoutError, OutputLayout},
  },
  tensor::RawOutputTensor,
};

mod assemble;
mod decode;
mod mask;
mod nms;

pub(crate) use self::decode::Candidates;

pub const DEFAULT_BOX_THRESHOLD: f32 = 0.25;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.45;
pub const DEFAULT_MAX_DETECTIONS: usize = 128;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
  #[error("输出张量与模型布局不符: {0}")]
  Layout(#[from] LayoutError),
  #[error("映射参数的输入尺寸 {actual} 与模型输入尺寸 {expected} 不一致")]
  InputSize { expected: u32, actual: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
  /// 置信度阈值
  pub box_threshold: f32,
  /// IoU 严格大于该值的同类框被抑制
  pub nms_threshold: f32,
  pub max_detections: usize,
}

impl Default for Thresholds {
  fn default() -> Self {
    Thresholds {
      box_threshold: DEFAULT_BOX_THRESHOLD,
      nms_threshold: DEFAULT_NMS_THRESHOLD,
      max_detections: DEFAULT_MAX_DETECTIONS,
    }
  }
}

/// 绑定到某个已校验布局的后处理器，每个工作线程持有一个
#[derive(Debug, Clone)]
pub struct PostProcessor {
  layout: OutputLayout,
  thresholds: Thresholds,
}

impl PostProcessor {
  pub fn new(layout: OutputLayout, thresholds: Thresholds) -> Self {
    PostProcessor { layout, thresholds }
  }

  pub fn layout(&self) -> &OutputLayout {
    &self.layout
  }

  pub fn thresholds(&self) -> &Thresholds {
    &self.thresholds
  }

  pub fn run(
    &self,
    tensors: &[RawOutputTensor],
    letterbox: &LetterboxParams,
  ) -> Result<DetectionResult, DecodeError> {
    let candidates = self.decode(tensors, letterbox)?;
    Ok(self.finish(&candidates, tensors, letterbox))
  }

  /// 校验输出并解码候选
  pub(crate) fn decode(
    &self,
    tensors: &[RawOutputTensor],
    letterbox: &LetterboxParams,
  ) -> Result<Candidates, DecodeError> {
    if letterbox.size != self.layout.input_size {
      return Err(DecodeError::InputSize {
        expected: self.layout.input_size,
        actual: letterbox.size,
      });
    }
    self.layout.check(tensors)?;
    Ok(decode::decode(
      &self.layout,
      tensors,
      self.thresholds.box_threshold,
    ))
  }

  /// 抑制、掩码重建与坐标逆映射
  pub(crate) fn finish(
    &self,
    candidates: &Candidates,
    tensors: &[RawOutputTensor],
    letterbox: &LetterboxParams,
  ) -> DetectionResult {
    let Thresholds {
      nms_threshold,
      max_detections,
      ..
    } = self.thresholds;
    let keep = match self.layout.variant {
      ModelVariant::Obb => nms::suppress(
        &candidates.scores,
        &candidates.class_ids,
        nms_threshold,
        max_detections,
        |a, b| nms::rotated_iou(&candidates.oriented(a), &candidates.oriented(b)),
      ),
      _ => nms::suppress(
        &candidates.scores,
        &candidates.class_ids,
        nms_threshold,
        max_detections,
        |a, b| nms::iou(&candidates.boxes[a], &candidates.boxes[b]),
      ),
    };
    debug!("候选 {} 个, 抑制后保留 {} 个", candidates.len(), keep.len());

    match self.layout.variant {
      ModelVariant::Detect => {
        DetectionResult::Detection(assemble::detections(candidates, &keep, letterbox).into())
      }
      ModelVariant::Segment => {
        let mask = match &self.layout.prototype {
          Some(proto) => mask::reconstruct(
            candidates,
            &keep,
            proto,
            tensors[proto.index].view(),
            letterbox,
          ),
          None => mask::empty(letterbox),
        };
        DetectionResult::Segmentation {
          items: assemble::detections(candidates, &keep, letterbox).into(),
          mask,
        }
      }
      ModelVariant::Pose => {
        DetectionResult::Pose(assemble::poses(candidates, &keep, letterbox).into())
      }
      ModelVariant::Obb => {
        DetectionResult::OrientedBox(assemble::oriented(candidates, &keep, letterbox).into())
      }
    }
  }
}

/// 不经过协调器的独立解码入口；布局从张量描述现场解析
pub fn decode_and_postprocess(
  tensors: &[RawOutputTensor],
  letterbox: &LetterboxParams,
  thresholds: &Thresholds,
  variant: ModelVariant,
) -> Result<DetectionResult, DecodeError> {
  let metadata = ModelMetadata {
    input_size: letterbox.size,
    outputs: tensors.iter().map(|t| t.meta().clone()).collect(),
  };
  let layout = OutputLayout::for_variant(variant, &metadata)?;
  PostProcessor::new(layout, *thresholds).run(tensors, letterbox)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    model::{Accelerator, SyntheticBuilder, SyntheticObject},
    tensor::{QuantParams, TensorMeta},
  };

  fn letterbox_64() -> LetterboxParams {
    LetterboxParams::new(64, 64, 64).unwrap()
  }

  #[test]
  fn detect_round_trip_through_synthetic_tensors() {
    let mut accel = SyntheticBuilder::default()
      .input_size(64)
      .strides(&[8, 16])
      .dfl_len(8)
      .num_classes(3)
      .object(SyntheticObject {
        class_id: 2,
        score: 0.8,
        bbox: [8.0, 12.0, 40.0, 36.0],
      })
      .build()
      .unwrap();
    let tensors = accel.run(&[0; 64 * 64 * 3]).unwrap();

    let result = decode_and_postprocess(
      tensors,
      &letterbox_64(),
      &Thresholds::default(),
      ModelVariant::Detect,
    )
    .unwrap();
    let DetectionResult::Detection(items) = result else {
      panic!("期望检测结果");
    };
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].class_id, 2);
    assert!((items[0].score - 0.8).abs() < 1e-6);
    for (got, want) in items[0].bbox.iter().zip([8.0, 12.0, 40.0, 36.0]) {
      assert!((got - want).abs() < 1e-3, "{:?}", items[0].bbox);
    }
  }

  #[test]
  fn segment_result_always_carries_mask() {
    let mut accel = SyntheticBuilder::default()
      .variant(ModelVariant::Segment)
      .input_size(64)
      .strides(&[8, 16, 32])
      .num_classes(2)
      .build()
      .unwrap();
    let tensors = accel.run(&[0; 64 * 64 * 3]).unwrap();
    let lb = LetterboxParams::new(100, 50, 64).unwrap();

    let result =
      decode_and_postprocess(tensors, &lb, &Thresholds::default(), ModelVariant::Segment).unwrap();
    assert!(result.is_empty());
    let mask = result.mask().unwrap();
    assert_eq!(mask.dimensions(), (100, 50));
    assert!(mask.pixels().all(|p| p.0[0] == 0));
  }

  #[test]
  fn obb_and_pose_variants_produce_their_own_results() {
    for variant in [ModelVariant::Obb, ModelVariant::Pose] {
      let mut accel = SyntheticBuilder::default()
        .variant(variant)
        .input_size(64)
        .strides(&[8, 16])
        .dfl_len(8)
        .num_classes(2)
        .object(SyntheticObject {
          class_id: 1,
          score: 0.7,
          bbox: [16.0, 16.0, 48.0, 40.0],
        })
        .build()
        .unwrap();
      let tensors = accel.run(&[0; 64 * 64 * 3]).unwrap();
      let result =
        decode_and_postprocess(tensors, &letterbox_64(), &Thresholds::default(), variant).unwrap();
      assert_eq!(result.variant(), variant);
      assert_eq!(result.len(), 1);
      if let DetectionResult::OrientedBox(items) = &result {
        assert!((items[0].cx - 32.0).abs() < 1e-3);
        assert!((items[0].cy - 28.0).abs() < 1e-3);
        assert!((items[0].width - 32.0).abs() < 1e-3);
        assert!((items[0].height - 24.0).abs() < 1e-3);
        assert!(items[0].angle.abs() < 1e-6);
      }
    }
  }

  #[test]
  fn rejects_tensors_that_drift_from_layout() {
    let mut accel = SyntheticBuilder::default()
      .input_size(64)
      .strides(&[8, 16])
      .build()
      .unwrap();
    let metadata = accel.metadata().unwrap();
    let layout = OutputLayout::negotiate(&metadata).unwrap();
    let processor = PostProcessor::new(layout, Thresholds::default());
    let tensors = accel.run(&[0; 64 * 64 * 3]).unwrap();

    assert!(matches!(
      processor.run(&tensors[1..], &letterbox_64()),
      Err(DecodeError::Layout(LayoutError::OutputCount { .. }))
    ));
    let lb = LetterboxParams::new(64, 64, 32).unwrap();
    assert!(matches!(
      processor.run(tensors, &lb),
      Err(DecodeError::InputSize { .. })
    ));

    let mut drifted = tensors.to_vec();
    let meta = TensorMeta::int8("box0", &[1, 64, 8, 8], QuantParams::new(0, 1.0));
    drifted[0] = RawOutputTensor::int8(meta, vec![0; 64 * 64]).unwrap();
    assert!(matches!(
      processor.run(&drifted, &letterbox_64()),
      Err(DecodeError::Layout(LayoutError::MixedDataType(0)))
    ));
  }
}
