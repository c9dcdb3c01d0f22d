// 该文件是 Shanan （山南西风） 项目的一部分。
// src/letterbox.rs - 等比缩放与对称填充变换
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

use image::{Rgb, RgbImage, imageops};

/// 填充区域的背景灰度
pub const LETTERBOX_FILL: u8 = 114;

/// 源图像到正方形模型输入之间的映射参数
///
/// `pad_x` / `pad_y` 为单侧填充量（总填充量整除 2）。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxParams {
  pub scale: f64,
  pub pad_x: i32,
  pub pad_y: i32,
  pub src_width: u32,
  pub src_height: u32,
  pub size: u32,
}

impl LetterboxParams {
  /// 计算映射参数，源图像为空时返回 `None`
  pub fn new(src_width: u32, src_height: u32, size: u32) -> Option<Self> {
    if src_width == 0 || src_height == 0 || size == 0 {
      return None;
    }

    let scale = size as f64 / src_width.max(src_height) as f64;
    let (new_w, new_h) = resized_dims(src_width, src_height, size, scale);

    Some(LetterboxParams {
      scale,
      pad_x: (size as i32 - new_w as i32) / 2,
      pad_y: (size as i32 - new_h as i32) / 2,
      src_width,
      src_height,
      size,
    })
  }

  /// 源图像缩放后的尺寸
  pub fn resized_dims(&self) -> (u32, u32) {
    resized_dims(self.src_width, self.src_height, self.size, self.scale)
  }

  /// 生成 `size x size` 的模型输入图像
  pub fn forward(&self, image: &RgbImage) -> RgbImage {
    debug_assert_eq!(image.dimensions(), (self.src_width, self.src_height));

    let (new_w, new_h) = self.resized_dims();
    let resized = imageops::resize(image, new_w, new_h, imageops::FilterType::Triangle);

    let mut canvas = RgbImage::from_pixel(self.size, self.size, Rgb([LETTERBOX_FILL; 3]));
    imageops::replace(&mut canvas, &resized, self.pad_x as i64, self.pad_y as i64);
    canvas
  }

  pub fn map_x(&self, x: f32) -> f32 {
    (x as f64 * self.scale + self.pad_x as f64) as f32
  }

  pub fn map_y(&self, y: f32) -> f32 {
    (y as f64 * self.scale + self.pad_y as f64) as f32
  }

  /// 模型空间横坐标映射回源图像
  pub fn unmap_x(&self, x: f32) -> f32 {
    unmap(x, self.size, self.pad_x, self.scale, self.src_width)
  }

  /// 模型空间纵坐标映射回源图像
  pub fn unmap_y(&self, y: f32) -> f32 {
    unmap(y, self.size, self.pad_y, self.scale, self.src_height)
  }

  /// 模型空间长度映射回源图像（不做平移与裁剪）
  pub fn unmap_len(&self, len: f32) -> f32 {
    (len as f64 / self.scale) as f32
  }
}

fn resized_dims(src_width: u32, src_height: u32, size: u32, scale: f64) -> (u32, u32) {
  // 长边直接取 size，避免浮点误差少一个像素
  let new_w = if src_width >= src_height {
    size
  } else {
    ((src_width as f64 * scale) as u32).min(size)
  };
  let new_h = if src_height >= src_width {
    size
  } else {
    ((src_height as f64 * scale) as u32).min(size)
  };
  (new_w.max(1), new_h.max(1))
}

fn unmap(m: f32, size: u32, pad: i32, scale: f64, bound: u32) -> f32 {
  let m = (m as f64).clamp(0.0, size as f64);
  ((m - pad as f64) / scale).clamp(0.0, bound as f64) as f32
}
