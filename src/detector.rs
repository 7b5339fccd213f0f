use burn::{
    config::Config,
    module::Module,
    nn::{
        PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
    },
    prelude::Backend,
    tensor::{Bool, Tensor, activation::softmax, s},
};
use tracing::debug;

use crate::{
    anchors::{AnchorGenerator, AnchorGeneratorConfig},
    assign::{Assigner, MaxIouAssigner, PseudoSampler, index_tensor},
    boxes::DeltaXywhCoder,
    config::{TestCfg, TrainCfg},
    data::{GroundTruth, ImageMeta},
    error::{CoreError, Result as CoreResult},
    loss::{ensure_finite, ohem_classification_loss, weighted_smooth_l1},
    nms::{Detections, fast_nms},
    protonet::{
        Protonet, ProtonetConfig, crop_masks, get_seg_masks, mask_loss, mask_targets,
        pick_training_masks, synthesize_masks,
    },
    segm::{SegmHead, SegmHeadConfig},
    targets::TargetEngine,
};

#[derive(Config, Debug)]
pub struct YolactHeadConfig {
    pub num_classes: usize,
    #[config(default = 256)]
    pub in_channels: usize,
    #[config(default = 256)]
    pub feat_channels: usize,
    #[config(default = 1)]
    pub num_head_convs: usize,
    #[config(default = 32)]
    pub num_protos: usize,
    #[config(default = 3)]
    pub num_base_anchors: usize,
}

impl YolactHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> YolactHead<B> {
        let conv3 = |cin: usize, cout: usize| {
            Conv2dConfig::new([cin, cout], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };

        let mut head_convs = Vec::new();
        let mut cin = self.in_channels;
        for _ in 0..self.num_head_convs {
            head_convs.push(conv3(cin, self.feat_channels));
            cin = self.feat_channels;
        }

        let a = self.num_base_anchors;
        YolactHead {
            head_convs,
            conv_cls: conv3(cin, a * (self.num_classes + 1)),
            conv_reg: conv3(cin, a * 4),
            conv_coeff: conv3(cin, a * self.num_protos),
            num_classes: self.num_classes,
            num_protos: self.num_protos,
        }
    }
}

/// The shared per-level prediction head: a short conv stack followed by
/// three sibling 3x3 convs for class scores, box deltas and prototype
/// coefficients. Coefficients pass through tanh so any prototype can be
/// subtracted as well as added.
#[derive(Module, Debug)]
pub struct YolactHead<B: Backend> {
    head_convs: Vec<Conv2d<B>>,
    conv_cls: Conv2d<B>,
    conv_reg: Conv2d<B>,
    conv_coeff: Conv2d<B>,
    num_classes: usize,
    num_protos: usize,
}

/// One FPN level's raw predictions, all `[batch, channels, h, w]`.
pub struct LevelPreds<B: Backend> {
    pub cls_score: Tensor<B, 4>,
    pub bbox_pred: Tensor<B, 4>,
    pub coeff_pred: Tensor<B, 4>,
}

impl<B: Backend> YolactHead<B> {
    pub fn forward_single(&self, x: Tensor<B, 4>) -> LevelPreds<B> {
        let mut x = x;
        for conv in &self.head_convs {
            x = burn::tensor::activation::relu(conv.forward(x));
        }
        LevelPreds {
            cls_score: self.conv_cls.forward(x.clone()),
            bbox_pred: self.conv_reg.forward(x.clone()),
            coeff_pred: self.conv_coeff.forward(x).tanh(),
        }
    }

    pub fn forward(&self, feats: &[Tensor<B, 4>]) -> Vec<LevelPreds<B>> {
        feats.iter().map(|f| self.forward_single(f.clone())).collect()
    }
}

/// All loss terms of one training step.
pub struct YolactLosses<B: Backend> {
    pub loss_cls: Tensor<B, 1>,
    pub loss_bbox: Tensor<B, 1>,
    pub loss_mask: Tensor<B, 1>,
    pub loss_segm: Tensor<B, 1>,
}

impl<B: Backend> YolactLosses<B> {
    pub fn total(&self) -> Tensor<B, 1> {
        self.loss_cls.clone()
            + self.loss_bbox.clone()
            + self.loss_mask.clone()
            + self.loss_segm.clone()
    }
}

/// Detections plus rendered binary masks for one image.
pub struct DetectionResult<B: Backend> {
    pub detections: Detections<B>,
    pub masks: Tensor<B, 3, Bool>,
}

/// Ties the pieces together: anchor generation, target assignment, the
/// prediction head, the prototype head and the auxiliary segmentation
/// head. Callers own the backbone/FPN; this type consumes its feature
/// maps, finest level first.
pub struct Yolact<B: Backend> {
    pub head: YolactHead<B>,
    pub protonet: Protonet<B>,
    pub segm_head: SegmHead<B>,
    pub anchor_generator: AnchorGenerator,
    pub target_engine: TargetEngine,
    pub train_cfg: TrainCfg,
    pub test_cfg: TestCfg,
}

impl<B: Backend> Yolact<B> {
    pub fn new(num_classes: usize, device: &B::Device) -> Self {
        let train_cfg = TrainCfg::new();
        Yolact {
            head: YolactHeadConfig::new(num_classes).init(device),
            protonet: ProtonetConfig::new().init(device),
            segm_head: SegmHeadConfig::new(num_classes).init(device),
            anchor_generator: AnchorGeneratorConfig::new().init(),
            target_engine: TargetEngine {
                assigner: Assigner::MaxIou(MaxIouAssigner::new()),
                sampler: PseudoSampler,
                coder: DeltaXywhCoder::default(),
                cfg: TrainCfg::new(),
                num_classes,
            },
            train_cfg,
            test_cfg: TestCfg::new(),
        }
    }

    /// Full training loss for one batch of feature maps.
    ///
    /// `feats` holds one `[batch, channels, h, w]` tensor per pyramid level;
    /// `feats[0]` (the finest) additionally feeds the prototype and
    /// segmentation heads, mirroring how the boxes and masks share features.
    pub fn loss(
        &self,
        feats: &[Tensor<B, 4>],
        ground_truths: &[GroundTruth<B>],
        img_metas: &[ImageMeta],
    ) -> CoreResult<YolactLosses<B>> {
        let device = feats[0].device();
        let num_imgs = img_metas.len();
        if ground_truths.len() != num_imgs {
            return Err(CoreError::ImageCountMismatch {
                what: "ground_truths",
                expected: num_imgs,
                got: ground_truths.len(),
            });
        }
        let num_levels = self.anchor_generator.num_levels();
        if feats.len() != num_levels {
            return Err(CoreError::LevelCountMismatch {
                what: "feats",
                expected: num_levels,
                got: feats.len(),
            });
        }
        let [batch, _, _, _] = feats[0].shape().dims();
        if num_imgs != batch {
            return Err(CoreError::ImageCountMismatch {
                what: "img_metas",
                expected: batch,
                got: num_imgs,
            });
        }

        let preds = self.head.forward(feats);
        for p in &preds {
            ensure_finite(&p.cls_score, CoreError::NonFiniteClsScores)?;
            ensure_finite(&p.bbox_pred, CoreError::NonFiniteBboxPreds)?;
        }

        let featmap_sizes: Vec<(usize, usize)> = feats
            .iter()
            .map(|f| {
                let [_, _, h, w] = f.shape().dims();
                (h, w)
            })
            .collect();
        let anchor_list = self.anchor_generator.grid_anchors::<B>(&featmap_sizes, &device);
        let valid_flag_list: Vec<Vec<Vec<bool>>> = img_metas
            .iter()
            .map(|m| self.anchor_generator.valid_flags(&featmap_sizes, m.pad_shape))
            .collect();

        let targets = self.target_engine.get_targets(
            &anchor_list,
            &valid_flag_list,
            ground_truths,
            img_metas,
            true,
        );
        let avg_factor = targets.num_total_pos as f32;
        debug!(num_total_pos = targets.num_total_pos, "assignment done");

        // Flatten predictions to [batch, total_anchors, channels].
        let num_cols = self.head.num_classes + 1;
        let all_cls = flatten_levels(&preds, |p| p.cls_score.clone(), num_cols);
        let all_bbox = flatten_levels(&preds, |p| p.bbox_pred.clone(), 4);
        let all_coeffs = flatten_levels(&preds, |p| p.coeff_pred.clone(), self.head.num_protos);

        let all_labels = Tensor::cat(targets.labels_list.clone(), 1);
        let all_label_weights = Tensor::cat(targets.label_weights_list.clone(), 1);
        let all_bbox_targets = Tensor::cat(targets.bbox_targets_list.clone(), 1);
        let all_bbox_weights = Tensor::cat(targets.bbox_weights_list.clone(), 1);
        let [_, total_anchors, _] = all_cls.shape().dims();

        // OHEM mines negatives per image, so the classification term stays
        // a per-image loop.
        let mut loss_cls = Tensor::<B, 1>::zeros([1], &device);
        for img in 0..num_imgs {
            loss_cls = loss_cls
                + ohem_classification_loss(
                    all_cls.clone().slice([img..img + 1]).reshape([total_anchors, num_cols]),
                    all_labels.clone().slice([img..img + 1]).reshape([total_anchors]),
                    all_label_weights
                        .clone()
                        .slice([img..img + 1])
                        .reshape([total_anchors]),
                    self.head.num_classes as i64,
                    self.train_cfg.neg_pos_ratio,
                    avg_factor,
                );
        }

        let loss_bbox = weighted_smooth_l1(
            all_bbox.clone().reshape([num_imgs * total_anchors, 4]),
            all_bbox_targets.reshape([num_imgs * total_anchors, 4]),
            all_bbox_weights.reshape([num_imgs * total_anchors, 4]),
            avg_factor,
        ) * self.train_cfg.loss_bbox_weight;

        let loss_mask = self.mask_loss_term(
            feats,
            &all_coeffs,
            &targets.sampling_results,
            ground_truths,
            img_metas,
        );

        let segm_pred = self.segm_head.forward(feats[0].clone());
        let loss_segm = self.segm_head.loss(segm_pred, ground_truths);

        Ok(YolactLosses {
            loss_cls,
            loss_bbox,
            loss_mask,
            loss_segm,
        })
    }

    /// The mask loss is normalized by the number of instances actually
    /// trained, summed across the batch *after* the `max_masks_to_train`
    /// subsample. A zero-positive image adds nothing to that count; the
    /// minimum of 1 applies to the batch total only.
    fn mask_loss_term(
        &self,
        feats: &[Tensor<B, 4>],
        all_coeffs: &Tensor<B, 3>,
        sampling_results: &[crate::assign::SamplingResult<B>],
        ground_truths: &[GroundTruth<B>],
        img_metas: &[ImageMeta],
    ) -> Tensor<B, 1> {
        let device = feats[0].device();
        let protos = self.protonet.forward(feats[0].clone());
        let [_, num_protos, ph, pw] = protos.shape().dims();

        let mut loss_mask = Tensor::<B, 1>::zeros([1], &device);
        let mut num_trained = 0usize;
        for (img, sampling) in sampling_results.iter().enumerate() {
            let num_pos = sampling.num_pos();
            let Some(gt_masks) = &ground_truths[img].masks else {
                continue;
            };
            if num_pos == 0 {
                continue;
            }

            let picked = pick_training_masks(num_pos, self.protonet.max_masks_to_train);
            num_trained += picked.len();
            let pos_inds: Vec<usize> = picked.iter().map(|&p| sampling.pos_inds[p]).collect();
            let gt_inds: Vec<usize> = picked
                .iter()
                .map(|&p| sampling.pos_assigned_gt_inds[p])
                .collect();
            let pos_gt_bboxes = sampling
                .pos_gt_bboxes
                .clone()
                .select(0, index_tensor::<B>(&picked, &device));

            let coeffs = all_coeffs
                .clone()
                .slice([img..img + 1])
                .reshape([all_coeffs.shape().dims::<3>()[1], num_protos])
                .select(0, index_tensor::<B>(&pos_inds, &device));
            let img_protos = protos
                .clone()
                .slice([img..img + 1])
                .reshape([num_protos, ph, pw]);

            let masks = synthesize_masks(img_protos, coeffs);

            let (img_h, img_w) = img_metas[img].img_shape;
            let scale = Tensor::<B, 1>::from_floats(
                [img_w as f32, img_h as f32, img_w as f32, img_h as f32],
                &device,
            )
            .reshape([1, 4])
            .expand([picked.len(), 4]);
            let boxes_norm = pos_gt_bboxes.clone() / scale;
            let cropped = crop_masks(masks, &boxes_norm, 1);

            let targets = mask_targets(gt_masks, &gt_inds, (ph, pw));
            loss_mask = loss_mask
                + mask_loss(
                    cropped,
                    targets,
                    &pos_gt_bboxes,
                    (img_h, img_w),
                    1.0,
                    self.protonet.loss_mask_weight,
                );
        }
        loss_mask / num_trained.max(1) as f32
    }

    /// Inference: decode, Fast NMS and mask rendering for every image.
    ///
    /// With `rescale`, boxes and masks come back in the original image frame
    /// (`ori_shape`); otherwise in the network input frame (`img_shape`).
    pub fn predict(
        &self,
        feats: &[Tensor<B, 4>],
        img_metas: &[ImageMeta],
        rescale: bool,
    ) -> CoreResult<Vec<DetectionResult<B>>> {
        let device = feats[0].device();
        let num_levels = self.anchor_generator.num_levels();
        if feats.len() != num_levels {
            return Err(CoreError::LevelCountMismatch {
                what: "feats",
                expected: num_levels,
                got: feats.len(),
            });
        }
        let [batch, _, _, _] = feats[0].shape().dims();
        if img_metas.len() != batch {
            return Err(CoreError::ImageCountMismatch {
                what: "img_metas",
                expected: batch,
                got: img_metas.len(),
            });
        }

        let preds = self.head.forward(feats);
        let featmap_sizes: Vec<(usize, usize)> = feats
            .iter()
            .map(|f| {
                let [_, _, h, w] = f.shape().dims();
                (h, w)
            })
            .collect();
        let anchor_list = self.anchor_generator.grid_anchors::<B>(&featmap_sizes, &device);

        let protos = self.protonet.forward(feats[0].clone());
        let [_, num_protos, ph, pw] = protos.shape().dims();

        let num_cols = self.head.num_classes + 1;
        let mut results = Vec::with_capacity(img_metas.len());

        for (img, meta) in img_metas.iter().enumerate() {
            let mut level_boxes = Vec::with_capacity(num_levels);
            let mut level_scores = Vec::with_capacity(num_levels);
            let mut level_coeffs = Vec::with_capacity(num_levels);

            for (level, p) in preds.iter().enumerate() {
                let cls = flatten_single(&p.cls_score, img, num_cols);
                let reg = flatten_single(&p.bbox_pred, img, 4);
                let coeff = flatten_single(&p.coeff_pred, img, self.head.num_protos);
                let scores = softmax(cls, 1);

                let anchors = anchor_list[level].clone();
                let (scores, reg, coeff, anchors) =
                    self.select_nms_pre(scores, reg, coeff, anchors);

                let boxes = self
                    .target_engine
                    .coder
                    .decode(anchors, reg, Some(meta.img_shape));
                level_boxes.push(boxes);
                level_scores.push(scores);
                level_coeffs.push(coeff);
            }

            let mut bboxes = Tensor::cat(level_boxes, 0);
            let scores = Tensor::cat(level_scores, 0);
            let coeffs = Tensor::cat(level_coeffs, 0);

            if rescale {
                let [n, _] = bboxes.shape().dims();
                let sf = Tensor::<B, 1>::from_floats(meta.scale_factor, &device)
                    .reshape([1, 4])
                    .expand([n, 4]);
                bboxes = bboxes / sf;
            }

            let detections = fast_nms(bboxes, scores, coeffs, &self.test_cfg);

            let out_shape = if rescale { meta.ori_shape } else { meta.img_shape };
            let img_protos = protos
                .clone()
                .slice([img..img + 1])
                .reshape([num_protos, ph, pw]);
            let masks =
                get_seg_masks(img_protos, &detections, out_shape, self.test_cfg.mask_thr);

            results.push(DetectionResult { detections, masks });
        }

        Ok(results)
    }

    /// Keeps only the `nms_pre` anchors with the best foreground score,
    /// ranked by each anchor's maximum non-background class probability.
    fn select_nms_pre(
        &self,
        scores: Tensor<B, 2>,
        reg: Tensor<B, 2>,
        coeff: Tensor<B, 2>,
        anchors: Tensor<B, 2>,
    ) -> (Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>) {
        let [n, num_cols] = scores.shape().dims();
        if self.test_cfg.nms_pre <= 0 || n <= self.test_cfg.nms_pre as usize {
            return (scores, reg, coeff, anchors);
        }

        let fg_max = scores
            .clone()
            .slice(s![.., 0..num_cols - 1])
            .max_dim(1)
            .reshape([n])
            .to_data()
            .to_vec::<f32>()
            .unwrap();
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| fg_max[b].total_cmp(&fg_max[a]));
        order.truncate(self.test_cfg.nms_pre as usize);

        let index = index_tensor::<B>(&order, &scores.device());
        (
            scores.select(0, index.clone()),
            reg.select(0, index.clone()),
            coeff.select(0, index.clone()),
            anchors.select(0, index),
        )
    }
}

/// `[batch, anchors*c, h, w]` per level -> `[batch, total_anchors, c]`,
/// anchors ordered level-major then row-major, matching the anchor grid.
fn flatten_levels<B: Backend>(
    preds: &[LevelPreds<B>],
    pick: impl Fn(&LevelPreds<B>) -> Tensor<B, 4>,
    channels: usize,
) -> Tensor<B, 3> {
    let per_level: Vec<Tensor<B, 3>> = preds
        .iter()
        .map(|p| {
            let t = pick(p);
            let [batch, c, h, w] = t.shape().dims();
            let per_cell = c / channels;
            t.permute([0, 2, 3, 1])
                .reshape([batch, h * w * per_cell, channels])
        })
        .collect();
    Tensor::cat(per_level, 1)
}

/// One image's level predictions as `[anchors, c]`.
fn flatten_single<B: Backend>(pred: &Tensor<B, 4>, img: usize, channels: usize) -> Tensor<B, 2> {
    let [_, c, h, w] = pred.shape().dims();
    let anchors = c / channels * h * w;
    pred.clone()
        .slice([img..img + 1])
        .permute([0, 2, 3, 1])
        .reshape([anchors, channels])
}
