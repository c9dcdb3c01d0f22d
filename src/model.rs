// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 模型能力与检测结果
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{fmt, str::FromStr};

use image::GrayImage;

use crate::tensor::{RawOutputTensor, TensorMeta};

pub mod layout;

mod labels;
pub use self::labels::{LabelError, Labels};

mod synthetic;
pub use self::synthetic::{
  SyntheticAccelerator, SyntheticBuilder, SyntheticError, SyntheticObject, SyntheticProbe,
};

/// 姿态模型的关键点数量
pub const NUM_KEYPOINTS: usize = 17;

/// 模型种类，由初始化阶段的能力协商得到
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelVariant {
  Detect,
  Segment,
  Pose,
  Obb,
}

impl fmt::Display for ModelVariant {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ModelVariant::Detect => "detect",
      ModelVariant::Segment => "segment",
      ModelVariant::Pose => "pose",
      ModelVariant::Obb => "obb",
    };
    f.write_str(name)
  }
}

impl FromStr for ModelVariant {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "detect" | "detection" => Ok(ModelVariant::Detect),
      "segment" | "seg" => Ok(ModelVariant::Segment),
      "pose" => Ok(ModelVariant::Pose),
      "obb" => Ok(ModelVariant::Obb),
      other => Err(format!("未知的模型种类: {}", other)),
    }
  }
}

/// 加速器在初始化时给出的静态信息
#[derive(Debug, Clone, PartialEq)]
pub struct ModelMetadata {
  /// 正方形输入边长
  pub input_size: u32,
  pub outputs: Vec<TensorMeta>,
}

/// 绑定到单个 NPU 核心的模型执行上下文
///
/// 输入为 `input_size x input_size` 的 NHWC RGB 字节；
/// 返回的输出张量只在下一次调用 `run` 之前有效。
pub trait Accelerator: Send {
  type Error: std::error::Error + Send + Sync + 'static;

  fn metadata(&self) -> Result<ModelMetadata, Self::Error>;

  fn bind_core(&mut self, core: usize) -> Result<(), Self::Error> {
    let _ = core;
    Ok(())
  }

  fn run(&mut self, input: &[u8]) -> Result<&[RawOutputTensor], Self::Error>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
}

/// 旋转框，角度为弧度
#[derive(Debug, Clone, PartialEq)]
pub struct OrientedItem {
  pub class_id: u32,
  pub score: f32,
  pub cx: f32,
  pub cy: f32,
  pub width: f32,
  pub height: f32,
  pub angle: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Keypoint {
  pub x: f32,
  pub y: f32,
  pub visibility: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoseItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4],
  pub keypoints: [Keypoint; NUM_KEYPOINTS],
}

/// 一次推理的结果，坐标均位于源图像空间
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionResult {
  Detection(Box<[DetectItem]>),
  Segmentation {
    items: Box<[DetectItem]>,
    /// 源图像分辨率的标签图，像素值为 `class_id + 1`，0 表示背景
    mask: GrayImage,
  },
  OrientedBox(Box<[OrientedItem]>),
  Pose(Box<[PoseItem]>),
}

impl DetectionResult {
  pub fn variant(&self) -> ModelVariant {
    match self {
      DetectionResult::Detection(_) => ModelVariant::Detect,
      DetectionResult::Segmentation { .. } => ModelVariant::Segment,
      DetectionResult::OrientedBox(_) => ModelVariant::Obb,
      DetectionResult::Pose(_) => ModelVariant::Pose,
    }
  }

  pub fn len(&self) -> usize {
    match self {
      DetectionResult::Detection(items) => items.len(),
      DetectionResult::Segmentation { items, .. } => items.len(),
      DetectionResult::OrientedBox(items) => items.len(),
      DetectionResult::Pose(items) => items.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// 分割模型的标签图
  pub fn mask(&self) -> Option<&GrayImage> {
    match self {
      DetectionResult::Segmentation { mask, .. } => Some(mask),
      _ => None,
    }
  }

  /// 取走标签图，结果中留下空图
  pub fn release_mask(&mut self) -> Option<GrayImage> {
    match self {
      DetectionResult::Segmentation { mask, .. } => Some(std::mem::replace(mask, GrayImage::new(0, 0))),
      _ => None,
    }
  }
}
