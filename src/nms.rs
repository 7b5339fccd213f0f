use burn::{prelude::Backend, tensor::Tensor};
use tracing::debug;

use crate::{assign::index_tensor, boxes::bbox_overlaps, config::TestCfg};

/// Final detections for one image after Fast NMS.
///
/// Rows are sorted by descending score. `labels` are foreground class ids in
/// `0..num_classes`; `coeffs` carries the per-detection prototype
/// coefficients needed for mask synthesis.
#[derive(Debug)]
pub struct Detections<B: Backend> {
    pub bboxes: Tensor<B, 2>,
    pub scores: Tensor<B, 1>,
    pub labels: Vec<i64>,
    pub coeffs: Tensor<B, 2>,
}

impl<B: Backend> Detections<B> {
    pub fn empty(num_coeffs: usize, device: &B::Device) -> Self {
        Detections {
            bboxes: Tensor::empty([0, 4], device),
            scores: Tensor::empty([0], device),
            labels: vec![],
            coeffs: Tensor::empty([0, num_coeffs], device),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Fast NMS: matrix suppression instead of the sequential greedy scan.
///
/// Per class, candidates are sorted by score and truncated to
/// `cfg.top_k`; a candidate is suppressed when any *higher-scoring*
/// candidate of the same class overlaps it by more than `cfg.iou_thr`.
/// The higher-scoring one is kept even if it was itself suppressed, which
/// is the one deliberate departure from greedy NMS that makes the whole
/// pass a single IoU matrix per class.
///
/// `multi_scores` is `[num_anchors, num_classes + 1]` with the background
/// column last; it is ignored. Survivors below `cfg.score_thr` are dropped
/// and the result is truncated to `cfg.max_per_img` across all classes.
pub fn fast_nms<B: Backend>(
    multi_bboxes: Tensor<B, 2>,
    multi_scores: Tensor<B, 2>,
    multi_coeffs: Tensor<B, 2>,
    cfg: &TestCfg,
) -> Detections<B> {
    let device = multi_bboxes.device();
    let [num_anchors, num_cols] = multi_scores.shape().dims();
    let num_classes = num_cols - 1;
    let [_, num_coeffs] = multi_coeffs.shape().dims();

    let score_vals = multi_scores.to_data().to_vec::<f32>().unwrap();

    // (score, class, anchor) for every survivor across classes.
    let mut kept: Vec<(f32, i64, usize)> = Vec::new();

    for class in 0..num_classes {
        let mut candidates: Vec<(f32, usize)> = (0..num_anchors)
            .map(|a| (score_vals[a * num_cols + class], a))
            .collect();
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
        candidates.truncate(cfg.top_k);
        if candidates.is_empty() {
            continue;
        }

        let anchor_inds: Vec<usize> = candidates.iter().map(|&(_, a)| a).collect();
        let boxes = multi_bboxes
            .clone()
            .select(0, index_tensor::<B>(&anchor_inds, &device));
        let iou = bbox_overlaps(boxes.clone(), boxes)
            .to_data()
            .to_vec::<f32>()
            .unwrap();

        let k = candidates.len();
        for j in 0..k {
            let (score, anchor) = candidates[j];
            if score <= cfg.score_thr {
                // Candidates are score-sorted, so nothing after j passes.
                break;
            }
            // Column max over strictly higher-scored rows (upper triangle).
            let mut max_overlap = 0.0f32;
            for i in 0..j {
                max_overlap = max_overlap.max(iou[i * k + j]);
            }
            if max_overlap <= cfg.iou_thr {
                kept.push((score, class as i64, anchor));
            }
        }
    }

    kept.sort_by(|a, b| b.0.total_cmp(&a.0));
    kept.truncate(cfg.max_per_img);
    debug!(num_kept = kept.len(), "fast nms survivors");

    if kept.is_empty() {
        return Detections::empty(num_coeffs, &device);
    }

    let anchor_inds: Vec<usize> = kept.iter().map(|&(_, _, a)| a).collect();
    let anchor_index = index_tensor::<B>(&anchor_inds, &device);
    let scores: Vec<f32> = kept.iter().map(|&(s, _, _)| s).collect();

    Detections {
        bboxes: multi_bboxes.select(0, anchor_index.clone()),
        scores: Tensor::from_floats(scores.as_slice(), &device),
        labels: kept.iter().map(|&(_, c, _)| c).collect(),
        coeffs: multi_coeffs.select(0, anchor_index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};

    type B = NdArray<f32>;

    fn cfg() -> TestCfg {
        TestCfg::new()
    }

    /// Five boxes, one class. Boxes 0 and 2 overlap heavily with box 2
    /// scoring lower, so 2 must be suppressed; the rest are disjoint.
    #[test]
    fn test_overlapping_lower_scorer_suppressed() {
        let device = &NdArrayDevice::default();
        let boxes = Tensor::<B, 2>::from_data(
            [
                [0.0f32, 0.0, 10.0, 10.0],
                [20.0, 0.0, 30.0, 10.0],
                [1.0, 0.0, 11.0, 10.0], // overlaps box 0
                [40.0, 0.0, 50.0, 10.0],
                [60.0, 0.0, 70.0, 10.0],
            ],
            device,
        );
        let scores = Tensor::<B, 2>::from_data(
            [
                [0.9f32, 0.1],
                [0.8, 0.2],
                [0.7, 0.3], // lower than box 0
                [0.6, 0.4],
                [0.5, 0.5],
            ],
            device,
        );
        let coeffs = Tensor::<B, 2>::zeros([5, 8], device);

        let dets = fast_nms(boxes, scores, coeffs, &cfg());

        assert_eq!(dets.len(), 4);
        let out_scores = dets.scores.to_data().to_vec::<f32>().unwrap();
        assert_eq!(out_scores, vec![0.9, 0.8, 0.6, 0.5]);
        assert!(dets.labels.iter().all(|&l| l == 0));
        assert_eq!(dets.coeffs.shape().dims, [4, 8]);
    }

    #[test]
    fn test_score_threshold_filters_survivors() {
        let device = &NdArrayDevice::default();
        let boxes = Tensor::<B, 2>::from_data(
            [[0.0f32, 0.0, 10.0, 10.0], [20.0, 0.0, 30.0, 10.0]],
            device,
        );
        let scores =
            Tensor::<B, 2>::from_data([[0.9f32, 0.1], [0.01, 0.99]], device);
        let coeffs = Tensor::<B, 2>::zeros([2, 4], device);

        let dets = fast_nms(boxes, scores, coeffs, &cfg());

        assert_eq!(dets.len(), 1);
        let out = dets.scores.to_data().to_vec::<f32>().unwrap();
        assert!(out.iter().all(|&s| s > cfg().score_thr));
    }

    /// Any two same-class survivors overlap by at most iou_thr.
    #[test]
    fn test_pairwise_iou_bound() {
        let device = &NdArrayDevice::default();
        let boxes = Tensor::<B, 2>::from_data(
            [
                [0.0f32, 0.0, 10.0, 10.0],
                [2.0, 0.0, 12.0, 10.0],
                [4.0, 0.0, 14.0, 10.0],
                [30.0, 0.0, 40.0, 10.0],
            ],
            device,
        );
        let scores = Tensor::<B, 2>::from_data(
            [[0.9f32, 0.1], [0.8, 0.2], [0.7, 0.3], [0.6, 0.4]],
            device,
        );
        let coeffs = Tensor::<B, 2>::zeros([4, 4], device);

        let dets = fast_nms(boxes, scores, coeffs, &cfg());

        let n = dets.len();
        let iou = bbox_overlaps(dets.bboxes.clone(), dets.bboxes.clone())
            .to_data()
            .to_vec::<f32>()
            .unwrap();
        for i in 0..n {
            for j in 0..n {
                if i != j && dets.labels[i] == dets.labels[j] {
                    assert!(iou[i * n + j] <= cfg().iou_thr + 1e-6);
                }
            }
        }
    }

    #[test]
    fn test_classes_do_not_suppress_each_other() {
        let device = &NdArrayDevice::default();
        // Identical boxes, different classes: both survive.
        let boxes = Tensor::<B, 2>::from_data(
            [[0.0f32, 0.0, 10.0, 10.0], [0.0, 0.0, 10.0, 10.0]],
            device,
        );
        let scores = Tensor::<B, 2>::from_data(
            [[0.9f32, 0.0, 0.1], [0.0, 0.8, 0.2]],
            device,
        );
        let coeffs = Tensor::<B, 2>::zeros([2, 4], device);

        let dets = fast_nms(boxes, scores, coeffs, &cfg());

        assert_eq!(dets.len(), 2);
        let mut labels = dets.labels.clone();
        labels.sort();
        assert_eq!(labels, vec![0, 1]);
    }

    #[test]
    fn test_max_per_img_truncates_globally() {
        let device = &NdArrayDevice::default();
        let mut coords = Vec::new();
        let mut score_rows = Vec::new();
        for i in 0..6 {
            let x = i as f32 * 20.0;
            coords.extend([x, 0.0, x + 10.0, 10.0]);
            score_rows.extend([0.9 - 0.05 * i as f32, 0.1]);
        }
        let boxes = Tensor::<B, 1>::from_floats(coords.as_slice(), device).reshape([6, 4]);
        let scores =
            Tensor::<B, 1>::from_floats(score_rows.as_slice(), device).reshape([6, 2]);
        let coeffs = Tensor::<B, 2>::zeros([6, 4], device);

        let mut cfg = cfg();
        cfg.max_per_img = 3;
        let dets = fast_nms(boxes, scores, coeffs, &cfg);

        assert_eq!(dets.len(), 3);
        let out = dets.scores.to_data().to_vec::<f32>().unwrap();
        assert!(out.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_all_below_threshold_returns_empty() {
        let device = &NdArrayDevice::default();
        let boxes = Tensor::<B, 2>::from_data([[0.0f32, 0.0, 10.0, 10.0]], device);
        let scores = Tensor::<B, 2>::from_data([[0.01f32, 0.99]], device);
        let coeffs = Tensor::<B, 2>::zeros([1, 4], device);

        let dets = fast_nms(boxes, scores, coeffs, &cfg());

        assert!(dets.is_empty());
        assert_eq!(dets.bboxes.shape().dims, [0, 4]);
    }
}
