use burn::{
    prelude::Backend,
    tensor::{Int, Tensor, s},
};
use tracing::debug;

use crate::{
    assign::{Assigner, PseudoSampler, SamplingResult, index_tensor},
    boxes::DeltaXywhCoder,
    config::TrainCfg,
    data::{GroundTruth, ImageMeta},
};

/// Dense per-anchor training targets for one image, aligned 1:1 with the
/// full (all levels, including invalid) anchor list.
///
/// Labels use the convention foreground = `0..num_classes`, background =
/// `num_classes`. Weights are nonzero only where a target is meaningful;
/// anchors outside the valid image region come back as background with zero
/// weight.
#[derive(Debug, Clone)]
pub struct ImageTargets<B: Backend> {
    pub labels: Tensor<B, 1, Int>,
    pub label_weights: Tensor<B, 1>,
    pub bbox_targets: Tensor<B, 2>,
    pub bbox_weights: Tensor<B, 2>,
    pub sampling: SamplingResult<B>,
}

/// Per-level batched targets for a whole batch of images: each entry of the
/// lists is one pyramid level, images stacked along dim 0.
#[derive(Debug)]
pub struct BatchTargets<B: Backend> {
    pub labels_list: Vec<Tensor<B, 2, Int>>,
    pub label_weights_list: Vec<Tensor<B, 2>>,
    pub bbox_targets_list: Vec<Tensor<B, 3>>,
    pub bbox_weights_list: Vec<Tensor<B, 3>>,
    pub num_total_pos: usize,
    pub num_total_neg: usize,
    pub sampling_results: Vec<SamplingResult<B>>,
}

/// The target assignment engine: matches anchors to ground truth and turns
/// the match into dense per-anchor labels, weights and regression targets.
///
/// Matching itself is delegated to the configured [`Assigner`];
/// positive/negative selection to the pass-through [`PseudoSampler`]
/// (hard-negative mining happens later, in the loss, and duplicating the
/// selection here would let the two drift apart).
#[derive(Debug)]
pub struct TargetEngine {
    pub assigner: Assigner,
    pub sampler: PseudoSampler,
    pub coder: DeltaXywhCoder,
    pub cfg: TrainCfg,
    /// Foreground class count; the background label id equals this.
    pub num_classes: usize,
}

impl TargetEngine {
    pub fn background_label(&self) -> i64 {
        self.num_classes as i64
    }

    /// Computes targets for a single image.
    ///
    /// `flat_anchors` is the all-levels `[num_anchors, 4]` concatenation and
    /// `valid_flags` its per-anchor validity mask; `num_level_anchors` gives
    /// the per-level anchor counts (needed by the adaptive assigner).
    ///
    /// Returns `None` when not a single anchor lies inside the valid image
    /// region; the caller must treat that as "skip this image's loss
    /// contribution", not as an error.
    pub fn targets_single<B: Backend>(
        &self,
        flat_anchors: &Tensor<B, 2>,
        valid_flags: &[bool],
        num_level_anchors: &[usize],
        gt: &GroundTruth<B>,
        gt_bboxes_ignore: Option<&Tensor<B, 2>>,
        img_meta: &ImageMeta,
        use_gt_labels: bool,
    ) -> Option<ImageTargets<B>> {
        let device = flat_anchors.device();
        let [num_total_anchors, _] = flat_anchors.shape().dims();

        let inside = anchor_inside_flags(
            flat_anchors,
            valid_flags,
            img_meta.img_shape,
            self.cfg.allowed_border,
        );
        let inside_inds: Vec<usize> = inside
            .iter()
            .enumerate()
            .filter_map(|(i, &f)| f.then_some(i))
            .collect();

        if inside_inds.is_empty() {
            debug!(img_shape = ?img_meta.img_shape, "no anchors inside the valid region");
            return None;
        }

        let anchors = flat_anchors
            .clone()
            .select(0, index_tensor::<B>(&inside_inds, &device));
        let num_valid = inside_inds.len();

        let gt_labels = use_gt_labels.then_some(gt.labels.as_slice());
        let assign_result = match &self.assigner {
            Assigner::MaxIou(a) => a.assign(&anchors, &gt.bboxes, gt_bboxes_ignore, gt_labels),
            Assigner::Atss(a) => {
                // The adaptive variant needs to know how many valid anchors
                // each level contributed.
                let counts = num_level_anchors_inside(num_level_anchors, &inside);
                a.assign(&anchors, &counts, &gt.bboxes, gt_labels)
            }
        };
        let sampling = self.sampler.sample(&assign_result, &anchors, &gt.bboxes);

        // Dense targets on the valid subset, assembled host-side.
        let bg = self.background_label();
        let mut labels = vec![bg; num_valid];
        let mut label_weights = vec![0.0f32; num_valid];
        let mut bbox_targets = vec![0.0f32; num_valid * 4];
        let mut bbox_weights = vec![0.0f32; num_valid * 4];

        if !sampling.pos_inds.is_empty() {
            let pos_deltas = self
                .coder
                .encode(sampling.pos_bboxes.clone(), sampling.pos_gt_bboxes.clone())
                .to_data()
                .to_vec::<f32>()
                .unwrap();
            let pos_weight = if self.cfg.pos_weight <= 0.0 {
                1.0
            } else {
                self.cfg.pos_weight
            };

            for (p, &anchor) in sampling.pos_inds.iter().enumerate() {
                bbox_targets[anchor * 4..anchor * 4 + 4]
                    .copy_from_slice(&pos_deltas[p * 4..p * 4 + 4]);
                bbox_weights[anchor * 4..anchor * 4 + 4].fill(1.0);
                labels[anchor] = match gt_labels {
                    Some(gtl) => gtl[sampling.pos_assigned_gt_inds[p]],
                    // No class supervision requested: foreground is 1.
                    None => 1,
                };
                label_weights[anchor] = pos_weight;
            }
        }
        for &anchor in &sampling.neg_inds {
            label_weights[anchor] = 1.0;
        }

        // Re-expand to the full anchor count; unmapped slots stay at
        // background label and zero weight.
        let labels = unmap_i64(&labels, num_total_anchors, &inside_inds, bg);
        let label_weights = unmap_f32(&label_weights, num_total_anchors, &inside_inds, 1);
        let bbox_targets = unmap_f32(&bbox_targets, num_total_anchors, &inside_inds, 4);
        let bbox_weights = unmap_f32(&bbox_weights, num_total_anchors, &inside_inds, 4);

        // Sampling indices were relative to the valid subset; express them
        // in full-anchor coordinates so downstream consumers (coefficient
        // selection) can index the full prediction list.
        let sampling = SamplingResult {
            pos_inds: sampling.pos_inds.iter().map(|&i| inside_inds[i]).collect(),
            neg_inds: sampling.neg_inds.iter().map(|&i| inside_inds[i]).collect(),
            pos_assigned_gt_inds: sampling.pos_assigned_gt_inds,
            pos_bboxes: sampling.pos_bboxes,
            pos_gt_bboxes: sampling.pos_gt_bboxes,
        };

        Some(ImageTargets {
            labels: Tensor::from_ints(labels.as_slice(), &device),
            label_weights: Tensor::from_floats(label_weights.as_slice(), &device),
            bbox_targets: Tensor::<B, 1>::from_floats(bbox_targets.as_slice(), &device)
                .reshape([num_total_anchors, 4]),
            bbox_weights: Tensor::<B, 1>::from_floats(bbox_weights.as_slice(), &device)
                .reshape([num_total_anchors, 4]),
            sampling,
        })
    }

    /// Computes targets for a whole batch, merging per-image results into
    /// one tensor per pyramid level (anchors ordered per level, images
    /// stacked along dim 0), since the loss head consumes per-level-shaped
    /// predictions.
    ///
    /// An image with no valid anchors contributes all-background labels with
    /// zero weight (its loss contribution vanishes) instead of aborting the
    /// batch.
    pub fn get_targets<B: Backend>(
        &self,
        anchor_list: &[Tensor<B, 2>],
        valid_flag_list: &[Vec<Vec<bool>>],
        ground_truths: &[GroundTruth<B>],
        img_metas: &[ImageMeta],
        use_gt_labels: bool,
    ) -> BatchTargets<B> {
        let num_imgs = img_metas.len();
        let num_level_anchors: Vec<usize> = anchor_list
            .iter()
            .map(|a| a.shape().dims::<2>()[0])
            .collect();
        let num_total_anchors: usize = num_level_anchors.iter().sum();

        let flat_anchors = Tensor::cat(anchor_list.to_vec(), 0);
        let device = flat_anchors.device();

        let mut all_labels = Vec::with_capacity(num_imgs);
        let mut all_label_weights = Vec::with_capacity(num_imgs);
        let mut all_bbox_targets = Vec::with_capacity(num_imgs);
        let mut all_bbox_weights = Vec::with_capacity(num_imgs);
        let mut sampling_results = Vec::with_capacity(num_imgs);
        let mut num_total_pos = 0;
        let mut num_total_neg = 0;

        for img in 0..num_imgs {
            let flags: Vec<bool> = valid_flag_list[img].iter().flatten().copied().collect();

            let targets = self.targets_single(
                &flat_anchors,
                &flags,
                &num_level_anchors,
                &ground_truths[img],
                None,
                &img_metas[img],
                use_gt_labels,
            );

            let targets = targets.unwrap_or_else(|| {
                // NO_VALID_ANCHORS: background everywhere, zero weights, so
                // this image's loss contribution is zero.
                ImageTargets {
                    labels: Tensor::full(
                        [num_total_anchors],
                        self.background_label(),
                        &device,
                    ),
                    label_weights: Tensor::zeros([num_total_anchors], &device),
                    bbox_targets: Tensor::zeros([num_total_anchors, 4], &device),
                    bbox_weights: Tensor::zeros([num_total_anchors, 4], &device),
                    sampling: SamplingResult {
                        pos_inds: vec![],
                        neg_inds: vec![],
                        pos_assigned_gt_inds: vec![],
                        pos_bboxes: Tensor::empty([0, 4], &device),
                        pos_gt_bboxes: Tensor::empty([0, 4], &device),
                    },
                }
            });

            num_total_pos += targets.sampling.pos_inds.len().max(1);
            num_total_neg += targets.sampling.neg_inds.len().max(1);

            all_labels.push(targets.labels);
            all_label_weights.push(targets.label_weights);
            all_bbox_targets.push(targets.bbox_targets);
            all_bbox_weights.push(targets.bbox_weights);
            sampling_results.push(targets.sampling);
        }

        BatchTargets {
            labels_list: images_to_levels_1d_int(all_labels, &num_level_anchors),
            label_weights_list: images_to_levels_1d(all_label_weights, &num_level_anchors),
            bbox_targets_list: images_to_levels_2d(all_bbox_targets, &num_level_anchors),
            bbox_weights_list: images_to_levels_2d(all_bbox_weights, &num_level_anchors),
            num_total_pos,
            num_total_neg,
            sampling_results,
        }
    }
}

/// Flags anchors whose center lies inside the image region expanded by
/// `allowed_border` pixels (negative border keeps every anchor that passed
/// the grid validity check). Gradient spent on padding regions is wasted, so
/// those anchors are excluded before assignment.
pub fn anchor_inside_flags<B: Backend>(
    flat_anchors: &Tensor<B, 2>,
    valid_flags: &[bool],
    img_shape: (usize, usize),
    allowed_border: i64,
) -> Vec<bool> {
    if allowed_border < 0 {
        return valid_flags.to_vec();
    }

    let (h, w) = img_shape;
    let border = allowed_border as f32;
    let coords = flat_anchors.to_data().to_vec::<f32>().unwrap();

    valid_flags
        .iter()
        .enumerate()
        .map(|(i, &valid)| {
            let c = &coords[i * 4..i * 4 + 4];
            let cx = (c[0] + c[2]) * 0.5;
            let cy = (c[1] + c[3]) * 0.5;
            valid
                && cx >= -border
                && cy >= -border
                && cx < w as f32 + border
                && cy < h as f32 + border
        })
        .collect()
}

/// Counts, per pyramid level, how many anchors survived the inside filter.
pub fn num_level_anchors_inside(num_level_anchors: &[usize], inside: &[bool]) -> Vec<usize> {
    let mut counts = Vec::with_capacity(num_level_anchors.len());
    let mut start = 0;
    for &n in num_level_anchors {
        counts.push(inside[start..start + n].iter().filter(|&&f| f).count());
        start += n;
    }
    counts
}

fn unmap_i64(data: &[i64], count: usize, inds: &[usize], fill: i64) -> Vec<i64> {
    let mut out = vec![fill; count];
    for (src, &dst) in inds.iter().enumerate() {
        out[dst] = data[src];
    }
    out
}

fn unmap_f32(data: &[f32], count: usize, inds: &[usize], stride: usize) -> Vec<f32> {
    let mut out = vec![0.0; count * stride];
    for (src, &dst) in inds.iter().enumerate() {
        out[dst * stride..(dst + 1) * stride]
            .copy_from_slice(&data[src * stride..(src + 1) * stride]);
    }
    out
}

fn images_to_levels_1d<B: Backend>(
    per_image: Vec<Tensor<B, 1>>,
    num_level_anchors: &[usize],
) -> Vec<Tensor<B, 2>> {
    let stacked = Tensor::stack(per_image, 0);
    split_levels_dim1(stacked, num_level_anchors)
}

fn images_to_levels_1d_int<B: Backend>(
    per_image: Vec<Tensor<B, 1, Int>>,
    num_level_anchors: &[usize],
) -> Vec<Tensor<B, 2, Int>> {
    let stacked: Tensor<B, 2, Int> = Tensor::stack(per_image, 0);
    let mut out = Vec::with_capacity(num_level_anchors.len());
    let mut start = 0;
    for &n in num_level_anchors {
        out.push(stacked.clone().slice(s![.., start..start + n]));
        start += n;
    }
    out
}

fn images_to_levels_2d<B: Backend>(
    per_image: Vec<Tensor<B, 2>>,
    num_level_anchors: &[usize],
) -> Vec<Tensor<B, 3>> {
    let stacked: Tensor<B, 3> = Tensor::stack(per_image, 0);
    let mut out = Vec::with_capacity(num_level_anchors.len());
    let mut start = 0;
    for &n in num_level_anchors {
        out.push(stacked.clone().slice(s![.., start..start + n, ..]));
        start += n;
    }
    out
}

fn split_levels_dim1<B: Backend>(
    stacked: Tensor<B, 2>,
    num_level_anchors: &[usize],
) -> Vec<Tensor<B, 2>> {
    let mut out = Vec::with_capacity(num_level_anchors.len());
    let mut start = 0;
    for &n in num_level_anchors {
        out.push(stacked.clone().slice(s![.., start..start + n]));
        start += n;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assign::MaxIouAssigner;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};

    type B = NdArray<f32>;

    fn engine() -> TargetEngine {
        TargetEngine {
            assigner: Assigner::MaxIou(MaxIouAssigner::new()),
            sampler: PseudoSampler,
            coder: DeltaXywhCoder::default(),
            cfg: TrainCfg::new(),
            num_classes: 5,
        }
    }

    /// Ten non-overlapping anchors along a row; a single gt box covering
    /// anchors 3 and 7 closely enough for both to clear the IoU threshold
    /// can be faked by placing the gt across two chosen anchors.
    fn row_anchors(device: &NdArrayDevice) -> Tensor<B, 2> {
        let mut coords = Vec::new();
        for i in 0..10 {
            let x = i as f32 * 20.0;
            coords.extend([x, 0.0, x + 16.0, 16.0]);
        }
        Tensor::<B, 1>::from_floats(coords.as_slice(), device).reshape([10, 4])
    }

    #[test]
    fn test_two_positive_anchors() {
        let device = &NdArrayDevice::default();
        // Overlap anchors 3 and 7 heavily with one gt each, same instance
        // label; use two gts sharing a class to keep the fixture simple.
        let anchors = row_anchors(device);
        let gt = GroundTruth::<B> {
            bboxes: Tensor::from_data(
                [[60.0, 0.0, 76.0, 16.0], [140.0, 0.0, 156.0, 16.0]],
                device,
            ),
            labels: vec![2, 2],
            masks: None,
        };
        let meta = ImageMeta::unscaled(64, 256);
        let tgt = engine()
            .targets_single(
                &anchors,
                &vec![true; 10],
                &[10],
                &gt,
                None,
                &meta,
                true,
            )
            .unwrap();

        assert_eq!(tgt.sampling.pos_inds, vec![3, 7]);

        let labels = tgt.labels.to_data().to_vec::<i64>().unwrap();
        let weights = tgt.label_weights.to_data().to_vec::<f32>().unwrap();
        for i in 0..10 {
            if i == 3 || i == 7 {
                assert_eq!(labels[i], 2);
            } else {
                assert_eq!(labels[i], 5); // background id = num_classes
            }
            assert_eq!(weights[i], 1.0);
        }
    }

    #[test]
    fn test_bbox_target_round_trips() {
        let device = &NdArrayDevice::default();
        let anchors = row_anchors(device);
        let gt = GroundTruth::<B> {
            bboxes: Tensor::from_data([[58.0, 1.0, 78.0, 15.0]], device),
            labels: vec![0],
            masks: None,
        };
        let meta = ImageMeta::unscaled(64, 256);
        let eng = engine();
        let tgt = eng
            .targets_single(&anchors, &vec![true; 10], &[10], &gt, None, &meta, true)
            .unwrap();

        let pos = tgt.sampling.pos_inds[0];
        let anchor = anchors.slice(s![pos..pos + 1, ..]);
        let delta = tgt.bbox_targets.slice(s![pos..pos + 1, ..]);
        let decoded = eng.coder.decode(anchor, delta, None);

        gt.bboxes
            .into_data()
            .assert_approx_eq::<f32>(&decoded.to_data(), burn::tensor::Tolerance::absolute(1e-3));
    }

    #[test]
    fn test_zero_gt_all_background() {
        let device = &NdArrayDevice::default();
        let anchors = row_anchors(device);
        let gt = GroundTruth::<B> {
            bboxes: Tensor::empty([0, 4], device),
            labels: vec![],
            masks: None,
        };
        let meta = ImageMeta::unscaled(64, 256);
        let tgt = engine()
            .targets_single(&anchors, &vec![true; 10], &[10], &gt, None, &meta, true)
            .unwrap();

        assert!(tgt.sampling.pos_inds.is_empty());
        assert_eq!(tgt.sampling.neg_inds.len(), 10);
        let labels = tgt.labels.to_data().to_vec::<i64>().unwrap();
        assert!(labels.iter().all(|&l| l == 5));
    }

    #[test]
    fn test_invalid_anchors_unmapped_with_zero_weight() {
        let device = &NdArrayDevice::default();
        let anchors = row_anchors(device);
        let mut flags = vec![true; 10];
        flags[0] = false;
        flags[9] = false;

        let gt = GroundTruth::<B> {
            bboxes: Tensor::from_data([[60.0, 0.0, 76.0, 16.0]], device),
            labels: vec![1],
            masks: None,
        };
        let meta = ImageMeta::unscaled(64, 256);
        let mut eng = engine();
        eng.cfg.allowed_border = 0; // activate the inside filter
        let tgt = eng
            .targets_single(&anchors, &flags, &[10], &gt, None, &meta, true)
            .unwrap();

        let weights = tgt.label_weights.to_data().to_vec::<f32>().unwrap();
        let labels = tgt.labels.to_data().to_vec::<i64>().unwrap();

        // Excluded anchors come back as background with zero weight; every
        // background anchor that *was* valid keeps weight 1.
        assert_eq!(weights[0], 0.0);
        assert_eq!(weights[9], 0.0);
        assert_eq!(labels[0], 5);
        for i in 1..9 {
            assert!(weights[i] > 0.0);
        }
    }

    #[test]
    fn test_no_valid_anchors_sentinel() {
        let device = &NdArrayDevice::default();
        let anchors = row_anchors(device);
        let gt = GroundTruth::<B> {
            bboxes: Tensor::from_data([[60.0, 0.0, 76.0, 16.0]], device),
            labels: vec![1],
            masks: None,
        };
        let meta = ImageMeta::unscaled(64, 256);
        let result = engine().targets_single(
            &anchors,
            &vec![false; 10],
            &[10],
            &gt,
            None,
            &meta,
            true,
        );

        assert!(result.is_none());
    }

    #[test]
    fn test_batch_split_per_level() {
        let device = &NdArrayDevice::default();
        let anchors = row_anchors(device);
        // Pretend the 10 anchors span two levels of 6 and 4.
        let level_a = anchors.clone().slice(s![0..6, ..]);
        let level_b = anchors.clone().slice(s![6..10, ..]);

        let gt = GroundTruth::<B> {
            bboxes: Tensor::from_data([[60.0, 0.0, 76.0, 16.0]], device),
            labels: vec![4],
            masks: None,
        };
        let metas = vec![ImageMeta::unscaled(64, 256); 2];
        let gts = vec![gt.clone(), gt];
        let flags = vec![vec![vec![true; 6], vec![true; 4]]; 2];

        let batch = engine().get_targets(&[level_a, level_b], &flags, &gts, &metas, true);

        assert_eq!(batch.labels_list.len(), 2);
        assert_eq!(batch.labels_list[0].shape().dims, [2, 6]);
        assert_eq!(batch.labels_list[1].shape().dims, [2, 4]);
        assert_eq!(batch.bbox_targets_list[0].shape().dims, [2, 6, 4]);
        assert_eq!(batch.num_total_pos, 2);
        assert_eq!(batch.sampling_results.len(), 2);
    }
}
