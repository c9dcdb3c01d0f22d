// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output.rs - 输出定义
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::convert::Infallible;

use image::RgbImage;
use tracing::info;

use crate::model::{DetectionResult, Labels};

pub trait Render<Frame, Output>: Sized {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

#[cfg(feature = "save_image_file")]
pub mod draw;

#[cfg(feature = "save_image_file")]
mod save_image_file;
#[cfg(feature = "save_image_file")]
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

/// 只记录日志、不产生文件的输出
#[derive(Debug, Default)]
pub struct LogOutput {
  labels: Labels,
}

impl LogOutput {
  pub fn with_labels(labels: Labels) -> Self {
    LogOutput { labels }
  }
}

impl Render<RgbImage, DetectionResult> for LogOutput {
  type Error = Infallible;

  fn render_result(&self, _frame: &RgbImage, result: &DetectionResult) -> Result<(), Self::Error> {
    log_result(&self.labels, result);
    Ok(())
  }
}

/// 按类别名称逐条记录检测结果
pub(crate) fn log_result(labels: &Labels, result: &DetectionResult) {
  let name = |id: u32| labels.name(id).unwrap_or("null").to_string();
  match result {
    DetectionResult::Detection(items) | DetectionResult::Segmentation { items, .. } => {
      for item in items.iter() {
        info!("{} @ {:?} {:.3}", name(item.class_id), item.bbox, item.score);
      }
    }
    DetectionResult::OrientedBox(items) => {
      for item in items.iter() {
        info!(
          "{} @ xywhθ = ({:.1} {:.1} {:.1} {:.1} {:.1}°) {:.3}",
          name(item.class_id),
          item.cx,
          item.cy,
          item.width,
          item.height,
          item.angle.to_degrees(),
          item.score
        );
      }
    }
    DetectionResult::Pose(items) => {
      for item in items.iter() {
        info!("{} @ {:?} {:.3}", name(item.class_id), item.bbox, item.score);
      }
    }
  }
}
