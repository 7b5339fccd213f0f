use burn::{
    config::Config,
    module::Module,
    nn::{
        PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
    },
    prelude::Backend,
    tensor::{
        Bool, Tensor,
        activation::{relu, sigmoid},
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};
use rand::seq::SliceRandom;
use tracing::debug;

use crate::{assign::index_tensor, boxes::boxes_to_components, nms::Detections};

/// Floor on the box-size fractions used for mask loss reweighting; keeps the
/// per-instance loss finite for degenerate ground-truth boxes.
const MIN_BOX_FRACTION: f32 = 1e-4;

/// Probability clamp for the binary cross-entropy terms.
const BCE_EPS: f32 = 1e-7;

#[derive(Config, Debug)]
pub struct ProtonetConfig {
    #[config(default = 256)]
    pub in_channels: usize,
    /// 3x3 conv widths before the upsample.
    #[config(default = "vec![256, 256, 256]")]
    pub pre_channels: Vec<usize>,
    /// Bilinear upsample factor applied mid-stack.
    #[config(default = 2)]
    pub upsample_scale: usize,
    /// 3x3 conv widths after the upsample.
    #[config(default = "vec![256]")]
    pub post_channels: Vec<usize>,
    /// Prototype count, the channel width of the final 1x1 conv.
    #[config(default = 32)]
    pub num_protos: usize,
    #[config(default = true)]
    pub include_last_relu: bool,
    #[config(default = 6.125)]
    pub loss_mask_weight: f32,
    /// Cap on positives trained per image; excess positives are randomly
    /// subsampled to bound the mask loss memory.
    #[config(default = 100)]
    pub max_masks_to_train: usize,
}

impl ProtonetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Protonet<B> {
        let conv3 = |cin: usize, cout: usize| {
            Conv2dConfig::new([cin, cout], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };

        let mut convs_pre = Vec::new();
        let mut cin = self.in_channels;
        for &cout in &self.pre_channels {
            convs_pre.push(conv3(cin, cout));
            cin = cout;
        }
        let mut convs_post = Vec::new();
        for &cout in &self.post_channels {
            convs_post.push(conv3(cin, cout));
            cin = cout;
        }
        let proto_conv = Conv2dConfig::new([cin, self.num_protos], [1, 1]).init(device);

        Protonet {
            convs_pre,
            convs_post,
            proto_conv,
            upsample_scale: self.upsample_scale,
            include_last_relu: self.include_last_relu,
            loss_mask_weight: self.loss_mask_weight,
            max_masks_to_train: self.max_masks_to_train,
        }
    }
}

/// The prototype head: a small fully-convolutional stack on the finest FPN
/// level producing `num_protos` full-image mask bases. Instance masks are
/// linear combinations of these bases, weighted by the per-anchor
/// coefficients predicted alongside boxes.
#[derive(Module, Debug)]
pub struct Protonet<B: Backend> {
    convs_pre: Vec<Conv2d<B>>,
    convs_post: Vec<Conv2d<B>>,
    proto_conv: Conv2d<B>,
    upsample_scale: usize,
    include_last_relu: bool,
    pub loss_mask_weight: f32,
    pub max_masks_to_train: usize,
}

impl<B: Backend> Protonet<B> {
    /// `[batch, in_channels, h, w]` -> prototypes `[batch, num_protos, sh, sw]`
    /// where `s` is the upsample factor.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = x;
        for conv in &self.convs_pre {
            x = relu(conv.forward(x));
        }

        let [_, _, h, w] = x.shape().dims();
        x = interpolate(
            x,
            [h * self.upsample_scale, w * self.upsample_scale],
            InterpolateOptions::new(InterpolateMode::Bilinear),
        );
        x = relu(x);

        for conv in &self.convs_post {
            x = relu(conv.forward(x));
        }
        x = self.proto_conv.forward(x);
        if self.include_last_relu { relu(x) } else { x }
    }
}

/// Combines prototypes with per-instance coefficients.
///
/// `protos` is `[num_protos, h, w]` for one image, `coeffs` is
/// `[num_instances, num_protos]`. Returns sigmoid mask probabilities
/// `[num_instances, h, w]`.
pub fn synthesize_masks<B: Backend>(
    protos: Tensor<B, 3>,
    coeffs: Tensor<B, 2>,
) -> Tensor<B, 3> {
    let [num_protos, h, w] = protos.shape().dims();
    let [num_instances, _] = coeffs.shape().dims();
    let flat = protos.reshape([num_protos, h * w]);
    let masks = coeffs.matmul(flat);
    sigmoid(masks.reshape([num_instances, h, w]))
}

/// Zeroes mask values outside each instance's box.
///
/// `boxes_norm` is `[n, 4]` xyxy with coordinates normalized to `[0, 1]`;
/// the box is re-expressed at mask resolution, padded by `padding` pixels
/// and clamped to the mask extent before masking.
pub fn crop_masks<B: Backend>(
    masks: Tensor<B, 3>,
    boxes_norm: &Tensor<B, 2>,
    padding: usize,
) -> Tensor<B, 3> {
    let device = masks.device();
    let [n, h, w] = masks.shape().dims();
    let pad = padding as f32;

    let (bx1, by1, bx2, by2) = boxes_to_components(boxes_norm.clone());
    let x1 = bx1 * w as f32;
    let x2 = bx2 * w as f32;
    let y1 = by1 * h as f32;
    let y2 = by2 * h as f32;

    // Tolerate flipped boxes, then pad and clamp to the mask extent.
    let (x1, x2) = (
        x1.clone().min_pair(x2.clone()),
        x1.max_pair(x2),
    );
    let (y1, y2) = (
        y1.clone().min_pair(y2.clone()),
        y1.max_pair(y2),
    );
    let x1 = (x1 - pad).clamp_min(0.0).reshape([n, 1, 1]).expand([n, h, w]);
    let x2 = (x2 + pad).clamp_max(w as f32).reshape([n, 1, 1]).expand([n, h, w]);
    let y1 = (y1 - pad).clamp_min(0.0).reshape([n, 1, 1]).expand([n, h, w]);
    let y2 = (y2 + pad).clamp_max(h as f32).reshape([n, 1, 1]).expand([n, h, w]);

    let cols = Tensor::<B, 1, burn::tensor::Int>::arange(0..w as i64, &device)
        .float()
        .reshape([1, 1, w])
        .expand([n, h, w]);
    let rows = Tensor::<B, 1, burn::tensor::Int>::arange(0..h as i64, &device)
        .float()
        .reshape([1, h, 1])
        .expand([n, h, w]);

    let inside = cols.clone().greater_equal(x1).float()
        * cols.lower(x2).float()
        * rows.clone().greater_equal(y1).float()
        * rows.lower(y2).float();

    masks * inside
}

/// Builds binary mask targets at prototype resolution for the sampled
/// positives: pick each positive's ground-truth mask and resize it down.
pub fn mask_targets<B: Backend>(
    gt_masks: &Tensor<B, 3>,
    pos_assigned_gt_inds: &[usize],
    mask_size: (usize, usize),
) -> Tensor<B, 3> {
    let device = gt_masks.device();
    let (mh, mw) = mask_size;
    let n = pos_assigned_gt_inds.len();

    let [_, gh, gw] = gt_masks.shape().dims();
    let picked = gt_masks
        .clone()
        .select(0, index_tensor::<B>(pos_assigned_gt_inds, &device));
    let resized = interpolate(
        picked.reshape([n, 1, gh, gw]),
        [mh, mw],
        InterpolateOptions::new(InterpolateMode::Bilinear),
    );
    resized
        .reshape([n, mh, mw])
        .greater_elem(0.5)
        .float()
}

/// Picks which positives to train masks on. All of them when under the cap,
/// otherwise a uniform random subset of exactly `max_masks` indices.
pub fn pick_training_masks(num_pos: usize, max_masks: usize) -> Vec<usize> {
    let mut inds: Vec<usize> = (0..num_pos).collect();
    if num_pos > max_masks {
        debug!(num_pos, max_masks, "subsampling mask positives");
        inds.shuffle(&mut rand::thread_rng());
        inds.truncate(max_masks);
    }
    inds
}

/// Mask loss for one image's sampled positives.
///
/// `mask_pred` must already be sigmoid probabilities cropped to the
/// ground-truth boxes; `mask_targets` the matching binary maps. The
/// per-instance BCE mean is divided by the instance's relative box width
/// and height, so small objects are not drowned out by large ones, then
/// summed and divided by `avg_factor` (the batch-wide positive count).
pub fn mask_loss<B: Backend>(
    mask_pred: Tensor<B, 3>,
    mask_targets: Tensor<B, 3>,
    pos_gt_bboxes: &Tensor<B, 2>,
    img_shape: (usize, usize),
    avg_factor: f32,
    loss_weight: f32,
) -> Tensor<B, 1> {
    let [n, mh, mw] = mask_pred.shape().dims();
    let (img_h, img_w) = img_shape;

    let p = mask_pred.clamp(BCE_EPS, 1.0 - BCE_EPS);
    let t = mask_targets;
    let bce = (t.clone() * p.clone().log() + (t.neg() + 1.0) * (p.neg() + 1.0).log()).neg();
    let per_instance = bce.mean_dim(2).mean_dim(1).reshape([n]);

    let (bx1, by1, bx2, by2) = boxes_to_components(pos_gt_bboxes.clone());
    let width_frac = ((bx2 - bx1) / img_w as f32)
        .clamp_min(MIN_BOX_FRACTION)
        .reshape([n]);
    let height_frac = ((by2 - by1) / img_h as f32)
        .clamp_min(MIN_BOX_FRACTION)
        .reshape([n]);

    (per_instance / width_frac / height_frac).sum() / avg_factor * loss_weight
}

/// Renders the final binary instance masks for one image's detections.
///
/// `protos` is `[num_protos, h, w]`; detection boxes must already be in
/// `out_shape` pixel coordinates. Masks are synthesized at prototype
/// resolution, cropped to their boxes, upsampled to `out_shape` and
/// binarized at `mask_thr`.
pub fn get_seg_masks<B: Backend>(
    protos: Tensor<B, 3>,
    dets: &Detections<B>,
    out_shape: (usize, usize),
    mask_thr: f32,
) -> Tensor<B, 3, Bool> {
    let device = protos.device();
    let (out_h, out_w) = out_shape;
    if dets.is_empty() {
        return Tensor::empty([0, out_h, out_w], &device);
    }

    let n = dets.len();
    let masks = synthesize_masks(protos, dets.coeffs.clone());
    let [_, mh, mw] = masks.shape().dims();

    let scale = Tensor::<B, 1>::from_floats(
        [out_w as f32, out_h as f32, out_w as f32, out_h as f32],
        &device,
    )
    .reshape([1, 4])
    .expand([n, 4]);
    let boxes_norm = dets.bboxes.clone() / scale;

    let cropped = crop_masks(masks, &boxes_norm, 1);
    let upsampled = interpolate(
        cropped.reshape([n, 1, mh, mw]),
        [out_h, out_w],
        InterpolateOptions::new(InterpolateMode::Bilinear),
    );
    upsampled.reshape([n, out_h, out_w]).greater_elem(mask_thr)
}
