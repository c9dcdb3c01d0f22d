// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("参数错误: {0}")]
  ParameterError(String),
}

/// 读取一张图像文件，按 `repeat` 次数重复产出同一帧
pub struct ImageFileInput {
  image: RgbImage,
  remaining: usize,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemeMismatch(url.scheme().to_string()));
    }

    let mut repeat = 1;
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "repeat" => {
          repeat = value
            .parse()
            .map_err(|_| ImageFileInputError::ParameterError(format!("repeat={}", value)))?;
        }
        other => {
          return Err(ImageFileInputError::ParameterError(format!(
            "未知参数 '{}'",
            other
          )));
        }
      }
    }

    let path = url.path();
    info!("读取图像文件: {}", path);
    let image = ImageReader::open(path)?.decode()?.to_rgb8();
    Ok(ImageFileInput::new(image, repeat))
  }
}

impl ImageFileInput {
  pub fn new(image: RgbImage, repeat: usize) -> Self {
    ImageFileInput {
      image,
      remaining: repeat,
    }
  }

  pub fn dimensions(&self) -> (u32, u32) {
    self.image.dimensions()
  }
}

impl Iterator for ImageFileInput {
  type Item = RgbImage;

  fn next(&mut self) -> Option<Self::Item> {
    match self.remaining {
      0 => None,
      1 => {
        self.remaining = 0;
        Some(std::mem::replace(&mut self.image, RgbImage::new(0, 0)))
      }
      _ => {
        self.remaining -= 1;
        Some(self.image.clone())
      }
    }
  }
}
