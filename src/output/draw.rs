// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/draw.rs - 检测结果可视化
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut};
use tracing::warn;

use crate::model::{DetectionResult, OrientedItem, PoseItem};

/// 分割标签图使用的 20 色调色板
pub const PALETTE: [[u8; 3]; 20] = [
  [255, 56, 56],
  [255, 157, 151],
  [255, 112, 31],
  [255, 178, 29],
  [207, 210, 49],
  [72, 249, 10],
  [146, 204, 23],
  [61, 219, 134],
  [26, 147, 52],
  [0, 212, 187],
  [44, 153, 168],
  [0, 194, 255],
  [52, 69, 147],
  [100, 115, 255],
  [0, 24, 236],
  [132, 56, 255],
  [82, 0, 133],
  [203, 56, 255],
  [255, 149, 200],
  [255, 55, 199],
];

// COCO 人体关键点连线
const SKELETON: [(usize, usize); 18] = [
  (0, 1),
  (1, 3),
  (0, 2),
  (2, 4),
  (0, 5),
  (5, 7),
  (7, 9),
  (0, 6),
  (6, 8),
  (8, 10),
  (5, 6),
  (11, 12),
  (11, 5),
  (12, 6),
  (11, 13),
  (12, 14),
  (13, 15),
  (14, 16),
];

const OBB_COLOR: [u8; 3] = [0, 255, 0];
const KEYPOINT_COLOR: [u8; 3] = [255, 0, 0];
const SKELETON_COLOR: [u8; 3] = [0, 0, 255];

pub fn class_color(class_id: u32) -> [u8; 3] {
  PALETTE[class_id as usize % PALETTE.len()]
}

pub struct Draw {
  mask_alpha: f32,
  thickness: i32,
  keypoint_radius: i32,
  visibility_threshold: f32,
}

impl Default for Draw {
  fn default() -> Self {
    Draw {
      mask_alpha: 0.5,
      thickness: 2,
      keypoint_radius: 4,
      visibility_threshold: 0.6,
    }
  }
}

impl Draw {
  pub fn draw_result(&self, image: &RgbImage, result: &DetectionResult) -> RgbImage {
    let mut canvas = image.clone();
    match result {
      DetectionResult::Detection(items) => {
        for item in items.iter() {
          self.draw_bbox(&mut canvas, &item.bbox, class_color(item.class_id));
        }
      }
      DetectionResult::Segmentation { items, mask } => {
        self.blend_mask(&mut canvas, mask);
        for item in items.iter() {
          self.draw_bbox(&mut canvas, &item.bbox, class_color(item.class_id));
        }
      }
      DetectionResult::OrientedBox(items) => {
        for item in items.iter() {
          self.draw_oriented(&mut canvas, item);
        }
      }
      DetectionResult::Pose(items) => {
        for item in items.iter() {
          self.draw_bbox(&mut canvas, &item.bbox, class_color(item.class_id));
          self.draw_pose(&mut canvas, item);
        }
      }
    }
    canvas
  }

  /// 标签图非零像素按调色板混合，`out = color * (1 - alpha) + pixel * alpha`
  pub fn blend_mask(&self, image: &mut RgbImage, mask: &GrayImage) {
    if mask.dimensions() != image.dimensions() {
      warn!(
        "标签图尺寸 {:?} 与图像尺寸 {:?} 不一致, 跳过混合",
        mask.dimensions(),
        image.dimensions()
      );
      return;
    }
    let alpha = self.mask_alpha;
    for (pixel, label) in image.pixels_mut().zip(mask.pixels()) {
      let value = label.0[0];
      if value == 0 {
        continue;
      }
      let color = PALETTE[value as usize % PALETTE.len()];
      for c in 0..3 {
        let blended = color[c] as f32 * (1.0 - alpha) + pixel.0[c] as f32 * alpha;
        pixel.0[c] = blended.clamp(0.0, 255.0) as u8;
      }
    }
  }

  // bbox 为源图像像素坐标 [x_min, y_min, x_max, y_max]
  fn draw_bbox(&self, image: &mut RgbImage, bbox: &[f32; 4], color: [u8; 3]) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    let x_min = (bbox[0].floor() as i32).clamp(0, w - 1);
    let y_min = (bbox[1].floor() as i32).clamp(0, h - 1);
    let x_max = (bbox[2].ceil() as i32).clamp(0, w - 1);
    let y_max = (bbox[3].ceil() as i32).clamp(0, h - 1);
    if x_min >= x_max || y_min >= y_max {
      return;
    }

    for t in 0..self.thickness {
      let (x0, y0) = ((x_min + t).min(x_max), (y_min + t).min(y_max));
      let (x1, y1) = ((x_max - t).max(x_min), (y_max - t).max(y_min));
      for x in x0..=x1 {
        image.put_pixel(x as u32, y0 as u32, Rgb(color));
        image.put_pixel(x as u32, y1 as u32, Rgb(color));
      }
      for y in y0..=y1 {
        image.put_pixel(x0 as u32, y as u32, Rgb(color));
        image.put_pixel(x1 as u32, y as u32, Rgb(color));
      }
    }
  }

  fn draw_oriented(&self, image: &mut RgbImage, item: &OrientedItem) {
    let (sin, cos) = item.angle.sin_cos();
    let (dx, dy) = (item.width / 2.0, item.height / 2.0);
    let corners = [(-dx, -dy), (dx, -dy), (dx, dy), (-dx, dy)]
      .map(|(x, y)| (item.cx + x * cos - y * sin, item.cy + x * sin + y * cos));
    for i in 0..corners.len() {
      let (a, b) = (corners[i], corners[(i + 1) % corners.len()]);
      for t in 0..self.thickness {
        let o = t as f32;
        draw_line_segment_mut(image, (a.0 + o, a.1), (b.0 + o, b.1), Rgb(OBB_COLOR));
      }
    }
  }

  fn draw_pose(&self, image: &mut RgbImage, item: &PoseItem) {
    let visible = |k: usize| item.keypoints[k].visibility > self.visibility_threshold;

    for &(a, b) in SKELETON.iter() {
      if visible(a) && visible(b) {
        let (pa, pb) = (&item.keypoints[a], &item.keypoints[b]);
        draw_line_segment_mut(image, (pa.x, pa.y), (pb.x, pb.y), Rgb(SKELETON_COLOR));
      }
    }
    for (k, kp) in item.keypoints.iter().enumerate() {
      if visible(k) {
        draw_filled_circle_mut(
          image,
          (kp.x as i32, kp.y as i32),
          self.keypoint_radius,
          Rgb(KEYPOINT_COLOR),
        );
      }
    }
  }
}
