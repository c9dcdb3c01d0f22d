// 该文件是 Shanan （山南西风） 项目的一部分。
// src/postprocess/mask.rs - 实例分割掩码重建
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::{GrayImage, Luma, imageops};
use ndarray::Array2;
use tracing::debug;

use crate::{
  letterbox::LetterboxParams,
  model::layout::Prototype,
  postprocess::decode::{Candidates, centered},
  tensor::TensorView,
};

/// 源图像尺寸的全零标签图
pub(crate) fn empty(letterbox: &LetterboxParams) -> GrayImage {
  GrayImage::new(letterbox.src_width, letterbox.src_height)
}

/// 系数与原型相乘、按框裁剪、合成为单张标签图并还原到源图像尺寸
///
/// 只关心乘积的符号，量化模型的系数与原型都取 `raw - zero_point`，
/// 省去两个正的缩放因子。
pub(crate) fn reconstruct(
  candidates: &Candidates,
  keep: &[usize],
  proto: &Prototype,
  proto_view: TensorView<'_>,
  letterbox: &LetterboxParams,
) -> GrayImage {
  if keep.is_empty() {
    return empty(letterbox);
  }

  let (ph, pw) = (proto.height, proto.width);
  let plane = ph * pw;
  let coeffs = Array2::from_shape_fn((keep.len(), proto.channels), |(n, c)| {
    candidates.coeffs(keep[n])[c]
  });
  let prototype = Array2::from_shape_fn((proto.channels, plane), |(c, p)| {
    centered(&proto_view, c * plane + p)
  });
  let masks = coeffs.dot(&prototype);

  let ratio = letterbox.size as f32 / ph as f32;
  let mut label = GrayImage::new(pw as u32, ph as u32);
  // 按分数顺序写入，已写像素不再覆盖
  for (n, &index) in keep.iter().enumerate() {
    let [x, y, w, h] = candidates.boxes[index];
    let (x1, y1, x2, y2) = (x / ratio, y / ratio, (x + w) / ratio, (y + h) / ratio);
    let value = (candidates.class_ids[index] + 1) as u8;
    for i in 0..ph {
      let fi = i as f32;
      if fi < y1 || fi >= y2 {
        continue;
      }
      for j in 0..pw {
        let fj = j as f32;
        if fj < x1 || fj >= x2 || masks[[n, i * pw + j]] <= 0.0 {
          continue;
        }
        let pixel = label.get_pixel_mut(j as u32, i as u32);
        if pixel.0[0] == 0 {
          *pixel = Luma([value]);
        }
      }
    }
  }

  debug!("掩码合成完成: {} 个实例, 原型 {}x{}", keep.len(), pw, ph);
  restore(&label, ratio, letterbox)
}

/// 去掉填充区域后缩放回源图像尺寸
fn restore(label: &GrayImage, ratio: f32, letterbox: &LetterboxParams) -> GrayImage {
  let (new_w, new_h) = letterbox.resized_dims();
  let total_x = letterbox.size.saturating_sub(new_w);
  let total_y = letterbox.size.saturating_sub(new_h);
  let left = letterbox.pad_x.max(0) as u32;
  let top = letterbox.pad_y.max(0) as u32;
  let right = total_x.saturating_sub(left);
  let bottom = total_y.saturating_sub(top);

  let (pw, ph) = label.dimensions();
  let x0 = ((left as f32 / ratio) as u32).min(pw - 1);
  let y0 = ((top as f32 / ratio) as u32).min(ph - 1);
  let x1 = pw.saturating_sub((right as f32 / ratio) as u32).max(x0 + 1);
  let y1 = ph.saturating_sub((bottom as f32 / ratio) as u32).max(y0 + 1);

  let cropped = imageops::crop_imm(label, x0, y0, x1 - x0, y1 - y0).to_image();
  imageops::resize(
    &cropped,
    letterbox.src_width,
    letterbox.src_height,
    imageops::FilterType::Nearest,
  )
}
