use burn::{
    config::Config,
    module::Module,
    nn::conv::{Conv2d, Conv2dConfig},
    prelude::Backend,
    tensor::{
        Tensor,
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

use crate::data::GroundTruth;

#[derive(Config, Debug)]
pub struct SegmHeadConfig {
    #[config(default = 256)]
    pub in_channels: usize,
    pub num_classes: usize,
    #[config(default = 1.0)]
    pub loss_segm_weight: f32,
}

impl SegmHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SegmHead<B> {
        SegmHead {
            segm_conv: Conv2dConfig::new([self.in_channels, self.num_classes], [1, 1])
                .init(device),
            loss_segm_weight: self.loss_segm_weight,
        }
    }
}

/// Training-only semantic segmentation head.
///
/// A single 1x1 conv on the finest FPN level predicts one logit map per
/// foreground class; its loss pushes the shared features toward
/// mask-friendly representations. Nothing at inference time reads it.
#[derive(Module, Debug)]
pub struct SegmHead<B: Backend> {
    segm_conv: Conv2d<B>,
    loss_segm_weight: f32,
}

impl<B: Backend> SegmHead<B> {
    /// `[batch, in_channels, h, w]` -> class logits `[batch, num_classes, h, w]`.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.segm_conv.forward(x)
    }

    /// Binary cross-entropy against per-class union masks, averaged over
    /// `num_imgs * h * w` so the weight does not scale with resolution.
    ///
    /// Images without ground-truth instances contribute nothing.
    pub fn loss(
        &self,
        segm_pred: Tensor<B, 4>,
        ground_truths: &[GroundTruth<B>],
    ) -> Tensor<B, 1> {
        let device = segm_pred.device();
        let [num_imgs, num_classes, h, w] = segm_pred.shape().dims();
        let avg_factor = (num_imgs * h * w) as f32;

        let mut loss = Tensor::<B, 1>::zeros([1], &device);
        for (img, gt) in ground_truths.iter().enumerate() {
            let pred = segm_pred
                .clone()
                .slice([img..img + 1])
                .reshape([num_classes, h, w]);
            let Some(targets) = segm_targets(gt, num_classes, (h, w)) else {
                continue;
            };
            loss = loss + bce_with_logits(pred, targets).sum();
        }
        loss / avg_factor * self.loss_segm_weight
    }
}

/// Per-class ground-truth maps at prediction resolution: the union (pixel
/// max) of every instance mask belonging to that class. `None` when the
/// image has no instances.
pub fn segm_targets<B: Backend>(
    gt: &GroundTruth<B>,
    num_classes: usize,
    size: (usize, usize),
) -> Option<Tensor<B, 3>> {
    let masks = gt.masks.as_ref()?;
    let num_gts = gt.num_instances();
    if num_gts == 0 {
        return None;
    }

    let (h, w) = size;
    let [_, gh, gw] = masks.shape().dims();
    let down = interpolate(
        masks.clone().reshape([num_gts, 1, gh, gw]),
        [h, w],
        InterpolateOptions::new(InterpolateMode::Bilinear),
    )
    .reshape([num_gts, h, w])
    .greater_elem(0.5)
    .float();

    let mut targets = Tensor::<B, 3>::zeros([num_classes, h, w], &masks.device());
    for (obj, &label) in gt.labels.iter().enumerate() {
        let class = label as usize;
        let instance = down.clone().slice([obj..obj + 1]);
        let merged = targets
            .clone()
            .slice([class..class + 1])
            .max_pair(instance);
        targets = targets.slice_assign([class..class + 1], merged);
    }
    Some(targets)
}

/// Numerically stable elementwise binary cross-entropy on raw logits.
///
/// `max(x, 0) - x*t + ln(1 + exp(-|x|))`
fn bce_with_logits<B: Backend>(logits: Tensor<B, 3>, targets: Tensor<B, 3>) -> Tensor<B, 3> {
    logits.clone().clamp_min(0.0) - logits.clone() * targets
        + (logits.abs().neg().exp() + 1.0).log()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};

    type B = NdArray<f32>;

    #[test]
    fn test_forward_shape() {
        let device = &NdArrayDevice::default();
        let head = SegmHeadConfig::new(5).init::<B>(device);
        let x = Tensor::<B, 4>::zeros([2, 256, 8, 8], device);

        assert_eq!(head.forward(x).shape().dims, [2, 5, 8, 8]);
    }

    #[test]
    fn test_targets_union_per_class() {
        let device = &NdArrayDevice::default();
        // Two instances of the same class covering the left and right
        // halves; target for that class must be their union.
        let mut left = vec![0.0f32; 16];
        let mut right = vec![0.0f32; 16];
        for y in 0..4 {
            left[y * 4] = 1.0;
            left[y * 4 + 1] = 1.0;
            right[y * 4 + 2] = 1.0;
            right[y * 4 + 3] = 1.0;
        }
        let mut data = left;
        data.extend(right);
        let masks = Tensor::<B, 1>::from_floats(data.as_slice(), device).reshape([2, 4, 4]);
        let gt = GroundTruth::<B> {
            bboxes: Tensor::zeros([2, 4], device),
            labels: vec![1, 1],
            masks: Some(masks),
        };

        let targets = segm_targets(&gt, 3, (4, 4)).unwrap();

        assert_eq!(targets.shape().dims, [3, 4, 4]);
        let vals = targets.to_data().to_vec::<f32>().unwrap();
        // Class 1 plane fully set, classes 0 and 2 empty.
        assert!(vals[16..32].iter().all(|&v| v == 1.0));
        assert!(vals[..16].iter().all(|&v| v == 0.0));
        assert!(vals[32..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_no_instances_contribute_zero_loss() {
        let device = &NdArrayDevice::default();
        let head = SegmHeadConfig::new(3).init::<B>(device);
        let pred = Tensor::<B, 4>::ones([1, 3, 4, 4], device);
        let gt = GroundTruth::<B> {
            bboxes: Tensor::empty([0, 4], device),
            labels: vec![],
            masks: Some(Tensor::empty([0, 4, 4], device)),
        };

        let loss = head.loss(pred, &[gt]).into_scalar();

        assert_eq!(loss, 0.0);
    }

    #[test]
    fn test_bce_with_logits_matches_reference() {
        let device = &NdArrayDevice::default();
        let logits = Tensor::<B, 3>::from_data([[[2.0f32, -3.0]]], device);
        let targets = Tensor::<B, 3>::from_data([[[1.0f32, 0.0]]], device);

        let loss = bce_with_logits(logits, targets).to_data().to_vec::<f32>().unwrap();

        let expected = [
            (1.0 + (-2.0f32).exp()).ln(),
            (1.0 + (-3.0f32).exp()).ln(),
        ];
        assert!((loss[0] - expected[0]).abs() < 1e-6);
        assert!((loss[1] - expected[1]).abs() < 1e-6);
    }
}
