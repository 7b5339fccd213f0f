use burn::{
    config::Config,
    prelude::Backend,
    tensor::{Int, Tensor},
};

use crate::boxes::bbox_overlaps;

/// The outcome of matching one image's anchors against its ground-truth
/// boxes.
///
/// `gt_inds` uses the conventional encoding: `0` = background, `-1` =
/// ignored (contributes to no loss), `k + 1` = matched to ground-truth
/// instance `k`. Produced fresh per image per step, never persisted.
#[derive(Debug, Clone)]
pub struct AssignResult {
    pub num_gts: usize,
    pub gt_inds: Vec<i64>,
    pub max_overlaps: Vec<f32>,
    pub labels: Option<Vec<i64>>,
}

impl AssignResult {
    fn background(num_anchors: usize, with_labels: bool) -> Self {
        AssignResult {
            num_gts: 0,
            gt_inds: vec![0; num_anchors],
            max_overlaps: vec![0.0; num_anchors],
            labels: with_labels.then(|| vec![-1; num_anchors]),
        }
    }

    fn fill_labels(&mut self, gt_labels: &[i64]) {
        let labels = self
            .gt_inds
            .iter()
            .map(|&ind| if ind > 0 { gt_labels[ind as usize - 1] } else { -1 })
            .collect();
        self.labels = Some(labels);
    }
}

/// Fixed-threshold IoU matching.
///
/// Every anchor overlapping some ground truth above `pos_iou_thr` becomes a
/// positive; anchors below `neg_iou_thr` become background; the band in
/// between is ignored. Additionally each ground truth rescues its
/// best-overlapping anchor(s) (provided the overlap reaches `min_pos_iou`),
/// so no object is left without a positive anchor.
#[derive(Config, Debug)]
pub struct MaxIouAssigner {
    #[config(default = 0.5)]
    pub pos_iou_thr: f32,
    #[config(default = 0.4)]
    pub neg_iou_thr: f32,
    #[config(default = 0.0)]
    pub min_pos_iou: f32,
    /// Intersection-over-foreground threshold against explicitly ignored
    /// boxes; non-positive disables the check.
    #[config(default = -1.0)]
    pub ignore_iof_thr: f32,
}

impl MaxIouAssigner {
    pub fn assign<B: Backend>(
        &self,
        anchors: &Tensor<B, 2>,
        gt_bboxes: &Tensor<B, 2>,
        gt_bboxes_ignore: Option<&Tensor<B, 2>>,
        gt_labels: Option<&[i64]>,
    ) -> AssignResult {
        let [num_anchors, _] = anchors.shape().dims();
        let [num_gts, _] = gt_bboxes.shape().dims();

        if num_gts == 0 {
            return AssignResult::background(num_anchors, gt_labels.is_some());
        }

        // IoU matrix, ground truths down the rows, anchors across the
        // columns, pulled to the host for the matching loops.
        let overlaps = bbox_overlaps(gt_bboxes.clone(), anchors.clone())
            .to_data()
            .to_vec::<f32>()
            .unwrap();
        let at = |gt: usize, anchor: usize| overlaps[gt * num_anchors + anchor];

        let mut gt_inds = vec![-1i64; num_anchors];
        let mut max_overlaps = vec![0.0f32; num_anchors];
        let mut argmax = vec![0usize; num_anchors];

        for anchor in 0..num_anchors {
            for gt in 0..num_gts {
                let o = at(gt, anchor);
                if o > max_overlaps[anchor] || gt == 0 {
                    max_overlaps[anchor] = o;
                    argmax[anchor] = gt;
                }
            }

            if max_overlaps[anchor] < self.neg_iou_thr {
                gt_inds[anchor] = 0;
            } else if max_overlaps[anchor] >= self.pos_iou_thr {
                gt_inds[anchor] = argmax[anchor] as i64 + 1;
            }
        }

        // Rescue pass: every ground truth claims the anchor(s) it overlaps
        // best, even when that overlap is below pos_iou_thr.
        for gt in 0..num_gts {
            let gt_best = (0..num_anchors)
                .map(|a| at(gt, a))
                .fold(0.0f32, f32::max);
            if gt_best < self.min_pos_iou || gt_best == 0.0 {
                continue;
            }
            for anchor in 0..num_anchors {
                if at(gt, anchor) == gt_best {
                    gt_inds[anchor] = gt as i64 + 1;
                }
            }
        }

        if let Some(ignored) = gt_bboxes_ignore {
            self.mark_ignored(anchors, ignored, &mut gt_inds);
        }

        let mut result = AssignResult {
            num_gts,
            gt_inds,
            max_overlaps,
            labels: None,
        };
        if let Some(labels) = gt_labels {
            result.fill_labels(labels);
        }
        result
    }

    fn mark_ignored<B: Backend>(
        &self,
        anchors: &Tensor<B, 2>,
        ignored: &Tensor<B, 2>,
        gt_inds: &mut [i64],
    ) {
        let [num_ignored, _] = ignored.shape().dims();
        if self.ignore_iof_thr <= 0.0 || num_ignored == 0 {
            return;
        }

        let coords = anchors.to_data().to_vec::<f32>().unwrap();
        let ign = ignored.to_data().to_vec::<f32>().unwrap();

        for (anchor, gt_ind) in gt_inds.iter_mut().enumerate() {
            let a = &coords[anchor * 4..anchor * 4 + 4];
            let area = ((a[2] - a[0]) * (a[3] - a[1])).max(1e-6);

            for i in 0..num_ignored {
                let b = &ign[i * 4..i * 4 + 4];
                let iw = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
                let ih = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
                if iw * ih / area > self.ignore_iof_thr {
                    *gt_ind = -1;
                    break;
                }
            }
        }
    }
}

/// Adaptive per-level statistical matching (ATSS).
///
/// For each ground truth the `topk` anchors closest in center distance are
/// gathered *per pyramid level*, and the IoU threshold for that ground truth
/// is set to mean + std of the candidate overlaps. This favors anchors close
/// to an object in scale and location independent of raw IoU magnitude,
/// which is why this variant must know how many valid anchors each level
/// contributed.
#[derive(Config, Debug)]
pub struct AtssAssigner {
    #[config(default = 9)]
    pub topk: usize,
}

impl AtssAssigner {
    pub fn assign<B: Backend>(
        &self,
        anchors: &Tensor<B, 2>,
        num_level_anchors: &[usize],
        gt_bboxes: &Tensor<B, 2>,
        gt_labels: Option<&[i64]>,
    ) -> AssignResult {
        let [num_anchors, _] = anchors.shape().dims();
        let [num_gts, _] = gt_bboxes.shape().dims();

        if num_gts == 0 {
            return AssignResult::background(num_anchors, gt_labels.is_some());
        }

        let overlaps = bbox_overlaps(gt_bboxes.clone(), anchors.clone())
            .to_data()
            .to_vec::<f32>()
            .unwrap();
        let at = |gt: usize, anchor: usize| overlaps[gt * num_anchors + anchor];

        let anchor_coords = anchors.to_data().to_vec::<f32>().unwrap();
        let gt_coords = gt_bboxes.to_data().to_vec::<f32>().unwrap();

        let anchor_centers: Vec<(f32, f32)> = (0..num_anchors)
            .map(|a| {
                let c = &anchor_coords[a * 4..a * 4 + 4];
                ((c[0] + c[2]) * 0.5, (c[1] + c[3]) * 0.5)
            })
            .collect();

        let mut assigned_overlap = vec![f32::NEG_INFINITY; num_anchors];
        let mut gt_inds = vec![0i64; num_anchors];
        let mut max_overlaps = vec![0.0f32; num_anchors];

        for gt in 0..num_gts {
            let g = &gt_coords[gt * 4..gt * 4 + 4];
            let gt_center = ((g[0] + g[2]) * 0.5, (g[1] + g[3]) * 0.5);

            // Top-k closest candidates per level, by center distance.
            let mut candidates: Vec<usize> = Vec::new();
            let mut level_start = 0;
            for &level_count in num_level_anchors {
                let level_end = level_start + level_count;
                let mut level_inds: Vec<usize> = (level_start..level_end).collect();
                level_inds.sort_by(|&a, &b| {
                    let da = center_distance(anchor_centers[a], gt_center);
                    let db = center_distance(anchor_centers[b], gt_center);
                    da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                });
                level_inds.truncate(self.topk.min(level_count));
                candidates.extend(level_inds);
                level_start = level_end;
            }

            // Adaptive threshold: mean + std of the candidate overlaps.
            let cand_overlaps: Vec<f32> = candidates.iter().map(|&a| at(gt, a)).collect();
            let n = cand_overlaps.len();
            if n == 0 {
                continue;
            }
            let mean = cand_overlaps.iter().sum::<f32>() / n as f32;
            let var = if n > 1 {
                cand_overlaps
                    .iter()
                    .map(|o| (o - mean) * (o - mean))
                    .sum::<f32>()
                    / (n as f32 - 1.0)
            } else {
                0.0
            };
            let thresh = mean + var.sqrt();

            for &anchor in &candidates {
                let o = at(gt, anchor);
                let (cx, cy) = anchor_centers[anchor];
                let center_inside = cx > g[0] && cx < g[2] && cy > g[1] && cy < g[3];

                // An anchor claimed by several ground truths goes to the one
                // it overlaps most.
                if o >= thresh && center_inside && o > assigned_overlap[anchor] {
                    assigned_overlap[anchor] = o;
                    gt_inds[anchor] = gt as i64 + 1;
                    max_overlaps[anchor] = o;
                }
            }
        }

        let mut result = AssignResult {
            num_gts,
            gt_inds,
            max_overlaps,
            labels: None,
        };
        if let Some(labels) = gt_labels {
            result.fill_labels(labels);
        }
        result
    }
}

fn center_distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    (dx * dx + dy * dy).sqrt()
}

/// The closed set of matching strategies used by the target assignment
/// engine. The two variants deliberately take different argument sets; only
/// the adaptive one needs per-level valid-anchor counts.
#[derive(Debug)]
pub enum Assigner {
    MaxIou(MaxIouAssigner),
    Atss(AtssAssigner),
}

/// The positive/negative anchor selection derived from an [`AssignResult`].
///
/// Invariants: the positive and negative index sets are disjoint; every
/// positive index maps to exactly one ground-truth instance.
#[derive(Debug, Clone)]
pub struct SamplingResult<B: Backend> {
    pub pos_inds: Vec<usize>,
    pub neg_inds: Vec<usize>,
    pub pos_assigned_gt_inds: Vec<usize>,
    pub pos_bboxes: Tensor<B, 2>,
    pub pos_gt_bboxes: Tensor<B, 2>,
}

impl<B: Backend> SamplingResult<B> {
    pub fn num_pos(&self) -> usize {
        self.pos_inds.len()
    }
}

/// Pass-through sampler: every assigned-positive anchor is positive, every
/// assigned-background anchor is negative. Hard-negative selection happens
/// later, in the loss, so no subsampling is done here.
#[derive(Debug, Default, Clone)]
pub struct PseudoSampler;

impl PseudoSampler {
    pub fn sample<B: Backend>(
        &self,
        assign_result: &AssignResult,
        anchors: &Tensor<B, 2>,
        gt_bboxes: &Tensor<B, 2>,
    ) -> SamplingResult<B> {
        let device = anchors.device();

        let mut pos_inds = Vec::new();
        let mut neg_inds = Vec::new();
        let mut pos_assigned_gt_inds = Vec::new();

        for (anchor, &gt_ind) in assign_result.gt_inds.iter().enumerate() {
            if gt_ind > 0 {
                pos_inds.push(anchor);
                pos_assigned_gt_inds.push(gt_ind as usize - 1);
            } else if gt_ind == 0 {
                neg_inds.push(anchor);
            }
        }

        let (pos_bboxes, pos_gt_bboxes) = if pos_inds.is_empty() {
            (
                Tensor::empty([0, 4], &device),
                Tensor::empty([0, 4], &device),
            )
        } else {
            let pos = index_tensor::<B>(&pos_inds, &device);
            let assigned = index_tensor::<B>(&pos_assigned_gt_inds, &device);
            (
                anchors.clone().select(0, pos),
                gt_bboxes.clone().select(0, assigned),
            )
        };

        SamplingResult {
            pos_inds,
            neg_inds,
            pos_assigned_gt_inds,
            pos_bboxes,
            pos_gt_bboxes,
        }
    }
}

/// Builds a 1-D Int index tensor from host indices.
pub fn index_tensor<B: Backend>(inds: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let inds: Vec<i64> = inds.iter().map(|&i| i as i64).collect();
    Tensor::from_data(inds.as_slice(), device)
}
