// 该文件是 Shanan （山南西风） 项目的一部分。
// src/postprocess/assemble.rs - 坐标逆映射与结果组装
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use crate::{
  letterbox::LetterboxParams,
  model::{DetectItem, Keypoint, OrientedItem, PoseItem},
  postprocess::decode::Candidates,
};

fn source_box(candidates: &Candidates, index: usize, lb: &LetterboxParams) -> [f32; 4] {
  let [x, y, w, h] = candidates.boxes[index];
  [
    lb.unmap_x(x),
    lb.unmap_y(y),
    lb.unmap_x(x + w),
    lb.unmap_y(y + h),
  ]
}

pub(crate) fn detections(
  candidates: &Candidates,
  keep: &[usize],
  lb: &LetterboxParams,
) -> Vec<DetectItem> {
  keep
    .iter()
    .map(|&i| DetectItem {
      class_id: candidates.class_ids[i],
      score: candidates.scores[i],
      bbox: source_box(candidates, i, lb),
    })
    .collect()
}

/// 旋转框中心做逆映射，宽高只做缩放
pub(crate) fn oriented(
  candidates: &Candidates,
  keep: &[usize],
  lb: &LetterboxParams,
) -> Vec<OrientedItem> {
  keep
    .iter()
    .map(|&i| {
      let [cx, cy, w, h, angle] = candidates.oriented(i);
      OrientedItem {
        class_id: candidates.class_ids[i],
        score: candidates.scores[i],
        cx: lb.unmap_x(cx),
        cy: lb.unmap_y(cy),
        width: lb.unmap_len(w),
        height: lb.unmap_len(h),
        angle,
      }
    })
    .collect()
}

pub(crate) fn poses(candidates: &Candidates, keep: &[usize], lb: &LetterboxParams) -> Vec<PoseItem> {
  keep
    .iter()
    .map(|&i| PoseItem {
      class_id: candidates.class_ids[i],
      score: candidates.scores[i],
      bbox: source_box(candidates, i, lb),
      keypoints: candidates.keypoints[i].map(|kp| Keypoint {
        x: lb.unmap_x(kp.x),
        y: lb.unmap_y(kp.y),
        visibility: kp.visibility,
      }),
    })
    .collect()
}
