// 该文件是 Shanan （山南西风） 项目的一部分。
// src/tensor.rs - 模型输出张量与仿射量化
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

/// 非对称仿射量化参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantParams {
  pub zero_point: i32,
  pub scale: f32,
}

impl QuantParams {
  pub fn new(zero_point: i32, scale: f32) -> Self {
    QuantParams { zero_point, scale }
  }

  /// 浮点数转量化值：先钳位到 [-128, 127]，再向零截断
  pub fn quantize(&self, value: f32) -> i8 {
    let dst = value / self.scale + self.zero_point as f32;
    dst.clamp(-128.0, 127.0) as i32 as i8
  }

  /// `(raw - zero_point) * scale`
  pub fn dequantize(&self, raw: i8) -> f32 {
    (raw as f32 - self.zero_point as f32) * self.scale
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
  Int8,
  Float32,
}

/// 输出张量的静态描述，初始化时从加速器查询一次
#[derive(Debug, Clone, PartialEq)]
pub struct TensorMeta {
  pub name: String,
  /// NCHW 形状
  pub shape: Vec<usize>,
  pub dtype: DataType,
  pub quant: Option<QuantParams>,
}

impl TensorMeta {
  pub fn int8(name: impl Into<String>, shape: &[usize], quant: QuantParams) -> Self {
    TensorMeta {
      name: name.into(),
      shape: shape.to_vec(),
      dtype: DataType::Int8,
      quant: Some(quant),
    }
  }

  pub fn float32(name: impl Into<String>, shape: &[usize]) -> Self {
    TensorMeta {
      name: name.into(),
      shape: shape.to_vec(),
      dtype: DataType::Float32,
      quant: None,
    }
  }

  pub fn elements(&self) -> usize {
    self.shape.iter().product()
  }

  /// `[1, C, H, W]` 中的 C
  pub fn channels(&self) -> Option<usize> {
    (self.shape.len() == 4).then(|| self.shape[1])
  }

  /// `[1, C, H, W]` 中的 (H, W)
  pub fn grid(&self) -> Option<(usize, usize)> {
    (self.shape.len() == 4).then(|| (self.shape[2], self.shape[3]))
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
  Int8(Vec<i8>),
  Float32(Vec<f32>),
}

/// 一次推理调用产生的原始输出张量
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutputTensor {
  meta: TensorMeta,
  data: TensorData,
}

impl RawOutputTensor {
  /// 量化张量；数据长度必须与形状一致
  pub fn int8(meta: TensorMeta, data: Vec<i8>) -> Option<Self> {
    (meta.dtype == DataType::Int8 && meta.quant.is_some() && meta.elements() == data.len()).then(
      || RawOutputTensor {
        meta,
        data: TensorData::Int8(data),
      },
    )
  }

  /// 浮点张量；数据长度必须与形状一致
  pub fn float32(meta: TensorMeta, data: Vec<f32>) -> Option<Self> {
    (meta.dtype == DataType::Float32 && meta.elements() == data.len()).then(|| RawOutputTensor {
      meta,
      data: TensorData::Float32(data),
    })
  }

  pub fn meta(&self) -> &TensorMeta {
    &self.meta
  }

  pub fn data(&self) -> &TensorData {
    &self.data
  }

  pub fn view(&self) -> TensorView<'_> {
    match (&self.data, self.meta.quant) {
      (TensorData::Int8(data), Some(quant)) => TensorView::Int8 { data, quant },
      // 构造函数保证量化张量一定带有量化参数
      (TensorData::Int8(data), None) => TensorView::Int8 {
        data,
        quant: QuantParams::new(0, 1.0),
      },
      (TensorData::Float32(data), _) => TensorView::Float32(data),
    }
  }
}

/// 解码阶段对输出张量的只读借用
#[derive(Debug, Clone, Copy)]
pub enum TensorView<'a> {
  Int8 { data: &'a [i8], quant: QuantParams },
  Float32(&'a [f32]),
}

impl TensorView<'_> {
  pub fn len(&self) -> usize {
    match self {
      TensorView::Int8 { data, .. } => data.len(),
      TensorView::Float32(data) => data.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// 反量化后的数值
  #[inline]
  pub fn value(&self, index: usize) -> f32 {
    match self {
      TensorView::Int8 { data, quant } => quant.dequantize(data[index]),
      TensorView::Float32(data) => data[index],
    }
  }
}
