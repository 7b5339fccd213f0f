use burn::config::Config;

/// Knobs for the target assignment engine and the OHEM loss head.
///
/// Defaults follow the YOLACT paper setup: anchors are never discarded at the
/// image border (`allowed_border = -1`), positives keep a unit label weight
/// (`pos_weight <= 0` means 1.0) and at most three hard negatives are mined
/// per positive.
#[derive(Config, Debug)]
pub struct TrainCfg {
    /// Border (in pixels) by which the valid image region is expanded when
    /// filtering anchors. Negative means "keep every anchor".
    #[config(default = -1)]
    pub allowed_border: i64,
    /// Label weight assigned to positive anchors; non-positive values fall
    /// back to 1.0.
    #[config(default = -1.0)]
    pub pos_weight: f32,
    /// Hard-negative budget per positive anchor.
    #[config(default = 3)]
    pub neg_pos_ratio: usize,
    /// Weight applied to the smooth-L1 box regression loss.
    #[config(default = 1.5)]
    pub loss_bbox_weight: f32,
}

/// Post-processing knobs consumed by the inference path and Fast NMS.
#[derive(Config, Debug)]
pub struct TestCfg {
    /// Per-level candidate cap applied before decoding; non-positive
    /// disables the pre-selection.
    #[config(default = 1000)]
    pub nms_pre: i64,
    /// Detections scoring below this are dropped.
    #[config(default = 0.05)]
    pub score_thr: f32,
    /// A candidate overlapping a higher-scoring kept candidate of the same
    /// class by more than this is suppressed.
    #[config(default = 0.5)]
    pub iou_thr: f32,
    /// Per-class candidate cap inside Fast NMS.
    #[config(default = 200)]
    pub top_k: usize,
    /// Global detection cap per image.
    #[config(default = 100)]
    pub max_per_img: usize,
    /// Binarization threshold for the final instance masks.
    #[config(default = 0.5)]
    pub mask_thr: f32,
}
