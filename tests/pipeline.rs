// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/pipeline.rs - 推理池集成测试
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::time::Duration;

use image::RgbImage;
use shanan_pool::{
  letterbox::LetterboxParams,
  model::{DetectionResult, Labels, ModelVariant, SyntheticAccelerator, SyntheticBuilder},
  pool::{BackpressurePolicy, Completed, Coordinator, PoolConfig},
  postprocess::{Thresholds, decode_and_postprocess},
  tensor::{RawOutputTensor, TensorMeta},
};

fn small(latency_ms: u64) -> SyntheticAccelerator {
  SyntheticBuilder::default()
    .input_size(32)
    .strides(&[8, 16])
    .latency(Duration::from_millis(latency_ms))
    .build()
    .unwrap()
}

fn frame() -> RgbImage {
  RgbImage::new(48, 32)
}

/// 等到没有在途任务后取出全部结果
fn drain(pool: &Coordinator) -> Vec<Completed> {
  let mut done = Vec::new();
  while pool.pending_count() > 0 {
    if let Some(c) = pool.receive_timeout(Duration::from_millis(20)) {
      done.push(c);
    }
  }
  while let Some(c) = pool.try_receive() {
    done.push(c);
  }
  done
}

#[test]
fn submissions_are_spread_round_robin() {
  let handles: Vec<_> = (0..3).map(|_| small(2)).collect();
  let probes: Vec<_> = handles.iter().map(|h| h.probe()).collect();
  let pool = Coordinator::new(handles, Labels::default(), PoolConfig::default()).unwrap();

  for _ in 0..9 {
    pool.submit(frame()).unwrap();
  }
  let done = drain(&pool);
  pool.shutdown();

  assert_eq!(done.len(), 9);
  for (worker, probe) in probes.iter().enumerate() {
    assert_eq!(probe.calls(), 3, "工作线程 {}", worker);
    assert_eq!(probe.core(), Some(worker));
  }
  for c in done.iter() {
    assert_eq!(c.worker, (c.id % 3) as usize);
  }
}

#[test]
fn results_arrive_in_completion_order() {
  let handles = vec![small(300), small(0)];
  let pool = Coordinator::new(handles, Labels::default(), PoolConfig::default()).unwrap();

  let slow = pool.submit(frame()).unwrap();
  let fast = pool.submit(frame()).unwrap();

  let first = pool.receive_timeout(Duration::from_secs(2)).unwrap();
  assert_eq!(first.id, fast);
  assert_eq!(first.worker, 1);
  let second = pool.receive_timeout(Duration::from_secs(2)).unwrap();
  assert_eq!(second.id, slow);
}

#[test]
fn drop_oldest_keeps_the_latest_frame() {
  let config = PoolConfig::default()
    .queue_depth(1)
    .policy(BackpressurePolicy::DropOldest);
  let pool = Coordinator::new(vec![small(200)], Labels::default(), config).unwrap();

  let ids: Vec<_> = (0..4).map(|_| pool.submit(frame()).unwrap()).collect();
  let done = drain(&pool);

  let dropped = pool.dropped_count();
  assert!((2..=3).contains(&dropped), "丢弃 {}", dropped);
  assert_eq!(done.len() + dropped, 4);
  assert!(done.iter().any(|c| c.id == ids[3]));
}

#[test]
fn failed_runs_are_dropped_not_published() {
  let accel = small(0).with_fail_every(2);
  let probe = accel.probe();
  let pool = Coordinator::new(vec![accel], Labels::default(), PoolConfig::default()).unwrap();

  for _ in 0..4 {
    pool.submit(frame()).unwrap();
  }
  let done = drain(&pool);

  assert_eq!(probe.calls(), 4);
  assert_eq!(done.len(), 2);
  assert_eq!(pool.dropped_count(), 2);
  let mut ids: Vec<_> = done.iter().map(|c| c.id).collect();
  ids.sort();
  assert_eq!(ids, vec![0, 2]);
}

#[test]
fn dropping_the_pool_joins_workers() {
  let accel = small(50);
  let probe = accel.probe();
  let pool = Coordinator::new(vec![accel], Labels::default(), PoolConfig::default()).unwrap();
  for _ in 0..3 {
    pool.submit(frame()).unwrap();
  }
  drop(pool);
  assert_eq!(probe.calls(), 3);
}

/// 64x64 输入，步长 8 与 16，DFL 长度 4，单类别浮点输出；
/// 第一个检测头 (3, 3) 格子上四条边都集中在第 2 个区间
fn single_object_tensors() -> Vec<RawOutputTensor> {
  let cell = 3 * 8 + 3;
  let mut box0 = vec![0.0f32; 16 * 64];
  for side in 0..4 {
    box0[(side * 4 + 2) * 64 + cell] = 20.0;
  }
  let mut score0 = vec![0.0f32; 64];
  score0[cell] = 0.9;

  vec![
    RawOutputTensor::float32(TensorMeta::float32("box_8", &[1, 16, 8, 8]), box0).unwrap(),
    RawOutputTensor::float32(TensorMeta::float32("cls_8", &[1, 1, 8, 8]), score0).unwrap(),
    RawOutputTensor::float32(
      TensorMeta::float32("box_16", &[1, 16, 4, 4]),
      vec![0.0; 16 * 16],
    )
    .unwrap(),
    RawOutputTensor::float32(TensorMeta::float32("cls_16", &[1, 1, 4, 4]), vec![0.0; 16])
      .unwrap(),
  ]
}

fn assert_single_box(result: &DetectionResult) {
  let DetectionResult::Detection(items) = result else {
    panic!("期望检测结果, 实际 {:?}", result.variant());
  };
  assert_eq!(items.len(), 1);
  let item = &items[0];
  assert_eq!(item.class_id, 0);
  assert!((item.score - 0.9).abs() < 1e-6);
  // 模型空间 [12, 12, 44, 44]，128x64 源图像缩放 0.5，纵向填充 16
  let expected = [24.0, 0.0, 88.0, 56.0];
  for (got, want) in item.bbox.iter().zip(expected) {
    assert!((got - want).abs() < 0.05, "{:?} != {:?}", item.bbox, expected);
  }
}

#[test]
fn decode_and_postprocess_maps_boxes_to_the_source_image() {
  let lb = LetterboxParams::new(128, 64, 64).unwrap();
  let result = decode_and_postprocess(
    &single_object_tensors(),
    &lb,
    &Thresholds::default(),
    ModelVariant::Detect,
  )
  .unwrap();
  assert_single_box(&result);
}

#[test]
fn coordinator_produces_the_same_detection() {
  let accel = SyntheticAccelerator::from_tensors(64, single_object_tensors());
  let pool = Coordinator::new(vec![accel], Labels::default(), PoolConfig::default()).unwrap();
  assert_eq!(pool.layout().variant, ModelVariant::Detect);

  let id = pool.submit(RgbImage::new(128, 64)).unwrap();
  let done = pool.receive_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!(done.id, id);
  assert_eq!(done.image.dimensions(), (128, 64));
  assert_single_box(&done.result);
}
