// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/labels.rs - 类别名称列表
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::Path;

use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("标签文件读取错误 {0}: {1}")]
  IoError(String, std::io::Error),
}

/// 按行排列的类别名称，行号即类别编号
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels {
  names: Vec<String>,
}

impl Labels {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LabelError> {
    let path = path.as_ref();
    info!("加载标签文件: {}", path.display());
    let text = std::fs::read_to_string(path)
      .map_err(|e| LabelError::IoError(path.display().to_string(), e))?;
    let labels = Self::parse(&text);
    info!("共加载 {} 个类别", labels.len());
    Ok(labels)
  }

  pub fn parse(text: &str) -> Self {
    let names = text
      .lines()
      .map(|line| line.trim_end_matches('\r').to_string())
      .collect();
    Labels { names }
  }

  pub fn name(&self, class_id: u32) -> Option<&str> {
    self.names.get(class_id as usize).map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }
}

impl<S: Into<String>> FromIterator<S> for Labels {
  fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
    Labels {
      names: iter.into_iter().map(Into::into).collect(),
    }
  }
}
