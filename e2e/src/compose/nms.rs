use ndarray::{Array2, ArrayView1, ArrayView2, ArrayView3, Axis};

use anyhow::ensure;
use half::f16;

use crate::TractResult;
use tract_e2e_graph::pb::tensor_proto::DataType;

/// Largest tolerated rounding error on offset coordinates, in input pixels.
pub const OFFSET_TOLERANCE: f32 = 1.0 / 16.0;

/// `(cx, cy, w, h)` to `(x1, y1, x2, y2)`, as a right-multiplied matrix.
pub const CONVERT_MATRIX: [[f32; 4]; 4] =
    [[1.0, 0.0, 1.0, 0.0], [0.0, 1.0, 0.0, 1.0], [-0.5, 0.0, 0.5, 0.0], [0.0, -0.5, 0.0, 0.5]];

pub fn to_corners(boxes: ArrayView2<f32>) -> Array2<f32> {
    let convert = ndarray::arr2(&CONVERT_MATRIX);
    boxes.dot(&convert)
}

/// Float type class offsets and NMS coordinates are computed in, whatever
/// the precision of the rest of the graph.
pub const OFFSET_TYPE: DataType = DataType::Float;

/// Spacing of `dt` at the largest offset coordinate NMS will see: boxes of
/// the last class are shifted by `max_wh * (nc - 1)` and extend up to
/// `max_wh`. Infinite when that coordinate overflows `dt`.
pub fn offset_rounding(max_wh: f32, nc: usize, dt: DataType) -> f32 {
    let largest = (max_wh * nc.max(1) as f32).abs();
    if dt == DataType::Float16 {
        let h = f16::from_f32(largest);
        if h.is_infinite() {
            return f32::INFINITY;
        }
        return f16::from_bits(h.to_bits() + 1).to_f32() - h.to_f32();
    }
    f32::from_bits(largest.to_bits() + 1) - largest
}

/// Whether the class offset trick keeps sub-pixel accuracy in `dt`.
pub fn offset_is_precise(max_wh: f32, nc: usize, dt: DataType) -> bool {
    offset_rounding(max_wh, nc, dt) <= OFFSET_TOLERANCE
}

/// Per anchor best score and class, first class winning ties.
pub fn class_max(scores: ArrayView2<f32>) -> (Vec<f32>, Vec<usize>) {
    scores
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter().enumerate().fold((f32::NEG_INFINITY, 0), |(best, arg), (ix, &s)| {
                if s > best { (s, ix) } else { (best, arg) }
            })
        })
        .unzip()
}

fn get_min_max(lhs: f32, rhs: f32) -> (f32, f32) {
    if lhs >= rhs { (rhs, lhs) } else { (lhs, rhs) }
}

/// IoU of two corner boxes.
pub fn iou(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    let (ax1, ax2) = get_min_max(a[0], a[2]);
    let (ay1, ay2) = get_min_max(a[1], a[3]);
    let (bx1, bx2) = get_min_max(b[0], b[2]);
    let (by1, by2) = get_min_max(b[1], b[3]);

    let iw = f32::min(ax2, bx2) - f32::max(ax1, bx1);
    let ih = f32::min(ay2, by2) - f32::max(ay1, by1);
    if iw <= 0.0 || ih <= 0.0 {
        return 0.0;
    }
    let inter = iw * ih;
    let union = (ax2 - ax1) * (ay2 - ay1) + (bx2 - bx1) * (by2 - by1) - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Greedy NMS over one image.
///
/// `boxes` are corner boxes already shifted by their class offset, so boxes
/// of different classes never overlap. Anchors scoring `score_thres` or less
/// are dropped. Returns at most `max_out` anchor indices, by decreasing
/// score, anchor order breaking ties.
pub fn greedy_nms(
    boxes: ArrayView2<f32>,
    scores: &[f32],
    iou_thres: f32,
    score_thres: f32,
    max_out: usize,
) -> TractResult<Vec<usize>> {
    ensure!(boxes.shape() == [scores.len(), 4], "Expected ({}, 4) boxes", scores.len());
    ensure!(!scores.iter().any(|s| s.is_nan()), "Scores must not be NaN");
    let mut candidates: Vec<(f32, usize)> = scores
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, s)| *s > score_thres)
        .map(|(i, s)| (s, i))
        .collect();
    candidates.sort_by(|(a, _), (b, _)| b.total_cmp(a));

    let mut kept: Vec<usize> = vec![];
    for (_, ix) in candidates {
        if kept.len() >= max_out {
            break;
        }
        if kept.iter().all(|&k| iou(boxes.row(k), boxes.row(ix)) <= iou_thres) {
            kept.push(ix);
        }
    }
    Ok(kept)
}

/// A surviving anchor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub batch: usize,
    pub anchor: usize,
    pub class: usize,
    pub score: f32,
}

/// Class-aware NMS over a `(N, A, 4)` corner boxes batch and their
/// `(N, A, nc)` class scores, using the `max_wh` offset trick.
pub fn batched_nms(
    boxes: ArrayView3<f32>,
    scores: ArrayView3<f32>,
    iou_thres: f32,
    score_thres: f32,
    max_out: usize,
    max_wh: f32,
) -> TractResult<Vec<Vec<Detection>>> {
    (0..boxes.shape()[0])
        .map(|batch| {
            let (best, classes) = class_max(scores.index_axis(Axis(0), batch));
            let mut shifted = boxes.index_axis(Axis(0), batch).to_owned();
            for (mut row, &class) in shifted.axis_iter_mut(Axis(0)).zip(&classes) {
                row += class as f32 * max_wh;
            }
            let kept = greedy_nms(shifted.view(), &best, iou_thres, score_thres, max_out)?;
            Ok(kept
                .into_iter()
                .map(|anchor| Detection {
                    batch,
                    anchor,
                    class: classes[anchor],
                    score: best[anchor],
                })
                .collect())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, arr2};

    #[test]
    fn center_to_corners() {
        let corners = to_corners(arr2(&[[10.0f32, 10.0, 4.0, 4.0]]).view());
        assert_eq!(corners, arr2(&[[8.0f32, 8.0, 12.0, 12.0]]));
    }

    #[test]
    fn class_max_prefers_first_on_ties() {
        let (best, classes) = class_max(arr2(&[[0.1f32, 0.7, 0.7], [0.9, 0.2, 0.0]]).view());
        assert_eq!(best, vec![0.7, 0.9]);
        assert_eq!(classes, vec![1, 0]);
    }

    #[test]
    fn overlapping_same_class_is_suppressed() {
        let boxes =
            arr2(&[[0.0f32, 0.0, 10.0, 10.0], [1.0, 1.0, 11.0, 11.0], [20.0, 20.0, 30.0, 30.0]]);
        let kept = greedy_nms(boxes.view(), &[0.8, 0.9, 0.5], 0.45, 0.25, 100).unwrap();
        assert_eq!(kept, vec![1, 2]);
    }

    #[test]
    fn ties_keep_anchor_order() {
        let boxes = arr2(&[[0.0f32, 0.0, 1.0, 1.0], [5.0, 5.0, 6.0, 6.0], [9.0, 9.0, 10.0, 10.0]]);
        let kept = greedy_nms(boxes.view(), &[0.5, 0.5, 0.5], 0.45, 0.25, 2).unwrap();
        assert_eq!(kept, vec![0, 1]);
    }

    #[test]
    fn below_threshold_is_dropped() {
        let boxes = arr2(&[[0.0f32, 0.0, 1.0, 1.0]]);
        assert!(greedy_nms(boxes.view(), &[0.25], 0.45, 0.25, 10).unwrap().is_empty());
    }

    #[test]
    fn classes_do_not_suppress_each_other() {
        let boxes =
            Array3::from_shape_vec((1, 2, 4), vec![0.0f32, 0.0, 10.0, 10.0, 0.0, 0.0, 10.0, 10.0])
                .unwrap();
        let scores = Array3::from_shape_vec((1, 2, 2), vec![0.9f32, 0.1, 0.1, 0.8]).unwrap();
        let dets = batched_nms(boxes.view(), scores.view(), 0.45, 0.25, 100, 640.0).unwrap();
        assert_eq!(dets[0].len(), 2);
        assert_eq!(dets[0][1], Detection { batch: 0, anchor: 1, class: 1, score: 0.8 });
    }

    #[test]
    fn offset_precision_budget() {
        assert!(offset_is_precise(640.0, 80, OFFSET_TYPE));
        assert!(offset_rounding(640.0, 80, DataType::Float) <= 1.0 / 128.0);
        assert!(!offset_is_precise(4096.0, 10_000, DataType::Float));
    }

    #[test]
    fn half_offsets_lose_pixels() {
        assert_eq!(offset_rounding(640.0, 80, DataType::Float16), 32.0);
        assert!(!offset_is_precise(640.0, 80, DataType::Float16));
        assert!(offset_rounding(1280.0, 80, DataType::Float16).is_infinite());
    }
}
