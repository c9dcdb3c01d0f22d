// 该文件是 Shanan （山南西风） 项目的一部分。
// src/postprocess/nms.rs - 按类别的非极大值抑制
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::collections::BTreeSet;

/// 轴对齐框的 IoU，框为 [x, y, w, h]，按像素包含端点计算（宽高各加 1）
pub(crate) fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let (ax1, ay1, ax2, ay2) = (a[0], a[1], a[0] + a[2], a[1] + a[3]);
  let (bx1, by1, bx2, by2) = (b[0], b[1], b[0] + b[2], b[1] + b[3]);

  let w = (ax2.min(bx2) - ax1.max(bx1) + 1.0).max(0.0);
  let h = (ay2.min(by2) - ay1.max(by1) + 1.0).max(0.0);
  let inter = w * h;
  let union = (ax2 - ax1 + 1.0) * (ay2 - ay1 + 1.0) + (bx2 - bx1 + 1.0) * (by2 - by1 + 1.0) - inter;
  if union <= 0.0 { 0.0 } else { inter / union }
}

/// 旋转框 [cx, cy, w, h, angle] 的四个顶点，逆时针
fn corners(r: &[f32; 5]) -> [(f32, f32); 4] {
  let [cx, cy, w, h, angle] = *r;
  let (sin, cos) = angle.sin_cos();
  let (dx, dy) = (w / 2.0, h / 2.0);
  [(-dx, -dy), (dx, -dy), (dx, dy), (-dx, dy)]
    .map(|(x, y)| (cx + x * cos - y * sin, cy + x * sin + y * cos))
}

fn polygon_area(points: &[(f32, f32)]) -> f32 {
  let n = points.len();
  let twice: f32 = (0..n)
    .map(|i| {
      let (x1, y1) = points[i];
      let (x2, y2) = points[(i + 1) % n];
      x1 * y2 - x2 * y1
    })
    .sum();
  twice.abs() / 2.0
}

/// Sutherland–Hodgman: 用凸多边形 `clip` 裁剪 `subject`
fn clip_polygon(subject: &[(f32, f32)], clip: &[(f32, f32)]) -> Vec<(f32, f32)> {
  let cross = |a: (f32, f32), b: (f32, f32), p: (f32, f32)| {
    (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0)
  };

  let mut output = subject.to_vec();
  for i in 0..clip.len() {
    if output.is_empty() {
      break;
    }
    let (a, b) = (clip[i], clip[(i + 1) % clip.len()]);
    let input = std::mem::take(&mut output);
    for k in 0..input.len() {
      let cur = input[k];
      let prev = input[(k + input.len() - 1) % input.len()];
      let (c_cur, c_prev) = (cross(a, b, cur), cross(a, b, prev));
      if c_cur >= 0.0 {
        if c_prev < 0.0 {
          output.push(intersect(prev, cur, c_prev, c_cur));
        }
        output.push(cur);
      } else if c_prev >= 0.0 {
        output.push(intersect(prev, cur, c_prev, c_cur));
      }
    }
  }
  output
}

fn intersect(p: (f32, f32), q: (f32, f32), cp: f32, cq: f32) -> (f32, f32) {
  let t = cp / (cp - cq);
  (p.0 + t * (q.0 - p.0), p.1 + t * (q.1 - p.1))
}

/// 旋转框的 IoU
pub(crate) fn rotated_iou(a: &[f32; 5], b: &[f32; 5]) -> f32 {
  let area_a = a[2] * a[3];
  let area_b = b[2] * b[3];
  if area_a <= 0.0 || area_b <= 0.0 {
    return 0.0;
  }
  let inter = polygon_area(&clip_polygon(&corners(a), &corners(b)));
  let union = area_a + area_b - inter;
  if union <= 0.0 { 0.0 } else { inter / union }
}

/// 贪心抑制，返回按分数降序保留的候选下标
///
/// 分数相同时保持原始顺序；只在同类别之间比较重叠度，
/// 重叠度严格大于 `threshold` 时抑制。保留数量达到 `max` 后其余候选全部丢弃。
pub(crate) fn suppress<F>(
  scores: &[f32],
  class_ids: &[u32],
  threshold: f32,
  max: usize,
  overlap: F,
) -> Vec<usize>
where
  F: Fn(usize, usize) -> f32,
{
  let mut order: Vec<usize> = (0..scores.len()).collect();
  order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

  let mut eliminated = vec![false; order.len()];
  let classes: BTreeSet<u32> = class_ids.iter().copied().collect();
  for class in classes {
    for i in 0..order.len() {
      let n = order[i];
      if eliminated[i] || class_ids[n] != class {
        continue;
      }
      for j in i + 1..order.len() {
        let m = order[j];
        if eliminated[j] || class_ids[m] != class {
          continue;
        }
        if overlap(n, m) > threshold {
          eliminated[j] = true;
        }
      }
    }
  }

  order
    .into_iter()
    .zip(eliminated)
    .filter_map(|(n, gone)| (!gone).then_some(n))
    .take(max)
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn run(boxes: &[[f32; 4]], scores: &[f32], classes: &[u32], thr: f32, max: usize) -> Vec<usize> {
    suppress(scores, classes, thr, max, |a, b| iou(&boxes[a], &boxes[b]))
  }

  #[test]
  fn iou_uses_inclusive_pixels() {
    let a = [0.0, 0.0, 9.0, 9.0];
    assert_eq!(iou(&a, &a), 1.0);
    assert_eq!(iou(&a, &[0.0, 0.0, 9.0, 4.0]), 0.5);
    assert_eq!(iou(&a, &[20.0, 20.0, 5.0, 5.0]), 0.0);
  }

  #[test]
  fn overlap_exactly_at_threshold_is_kept() {
    let boxes = [[0.0, 0.0, 9.0, 9.0], [0.0, 0.0, 9.0, 4.0]];
    let scores = [0.9, 0.8];
    assert_eq!(run(&boxes, &scores, &[0, 0], 0.5, 128), vec![0, 1]);
    assert_eq!(run(&boxes, &scores, &[0, 0], 0.5 - f32::EPSILON, 128), vec![0]);
  }

  #[test]
  fn different_classes_never_suppress_each_other() {
    let boxes = [[0.0, 0.0, 10.0, 10.0]; 2];
    assert_eq!(run(&boxes, &[0.5, 0.9], &[0, 1], 0.45, 128), vec![1, 0]);
  }

  #[test]
  fn ties_keep_submission_order() {
    let boxes = [
      [0.0, 0.0, 10.0, 10.0],
      [50.0, 50.0, 10.0, 10.0],
      [100.0, 0.0, 10.0, 10.0],
    ];
    assert_eq!(run(&boxes, &[0.5, 0.7, 0.5], &[0, 0, 0], 0.45, 128), vec![1, 0, 2]);
  }

  #[test]
  fn greedy_suppression_and_idempotence() {
    let boxes = [
      [0.0, 0.0, 10.0, 10.0],
      [1.0, 1.0, 10.0, 10.0],
      [30.0, 30.0, 10.0, 10.0],
      [31.0, 30.0, 10.0, 10.0],
    ];
    let scores = [0.6, 0.9, 0.5, 0.8];
    let classes = [0, 0, 0, 0];
    let keep = run(&boxes, &scores, &classes, 0.45, 128);
    assert_eq!(keep, vec![1, 3]);

    let kept_boxes: Vec<_> = keep.iter().map(|&i| boxes[i]).collect();
    let kept_scores: Vec<_> = keep.iter().map(|&i| scores[i]).collect();
    let again = run(&kept_boxes, &kept_scores, &[0, 0], 0.45, 128);
    assert_eq!(again, vec![0, 1]);
  }

  #[test]
  fn output_is_capped() {
    let boxes: Vec<[f32; 4]> = (0..10).map(|i| [i as f32 * 20.0, 0.0, 10.0, 10.0]).collect();
    let scores: Vec<f32> = (0..10).map(|i| i as f32 / 10.0).collect();
    let keep = run(&boxes, &scores, &[0; 10], 0.45, 3);
    assert_eq!(keep, vec![9, 8, 7]);
  }

  #[test]
  fn rotated_iou_matches_axis_aligned_case() {
    let a = [5.0, 5.0, 10.0, 10.0, 0.0];
    let b = [10.0, 5.0, 10.0, 10.0, 0.0];
    assert!((rotated_iou(&a, &b) - 50.0 / 150.0).abs() < 1e-5);
    assert!((rotated_iou(&a, &a) - 1.0).abs() < 1e-5);
  }

  #[test]
  fn rotated_iou_of_square_and_its_diamond() {
    let a = [0.0, 0.0, 2.0, 2.0, 0.0];
    let b = [0.0, 0.0, 2.0, 2.0, std::f32::consts::FRAC_PI_4];
    // 交集为正八边形，面积 8(√2 - 1)
    let inter = 8.0 * (2f32.sqrt() - 1.0);
    let expected = inter / (8.0 - inter);
    assert!((rotated_iou(&a, &b) - expected).abs() < 1e-4);
    assert_eq!(rotated_iou(&a, &[10.0, 10.0, 2.0, 2.0, 0.3]), 0.0);
  }
}
