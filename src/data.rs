use burn::{prelude::Backend, tensor::Tensor};

/// Per-image geometry carried alongside predictions and ground truth.
///
/// All shapes are `(height, width)`. `img_shape` is the resized image the
/// network saw, `ori_shape` the originally requested output resolution, and
/// `scale_factor` the (w, h, w, h) ratio between them, matching the xyxy box
/// layout so boxes can be rescaled with one elementwise divide.
#[derive(Debug, Clone)]
pub struct ImageMeta {
    pub img_shape: (usize, usize),
    pub ori_shape: (usize, usize),
    pub pad_shape: (usize, usize),
    pub scale_factor: [f32; 4],
}

impl ImageMeta {
    /// Meta for an image used at its native resolution.
    pub fn unscaled(height: usize, width: usize) -> Self {
        ImageMeta {
            img_shape: (height, width),
            ori_shape: (height, width),
            pad_shape: (height, width),
            scale_factor: [1.0, 1.0, 1.0, 1.0],
        }
    }
}

/// One training image's annotations, owned by the caller for the duration of
/// a step. Boxes are `[num_instances, 4]` xyxy in image pixels; masks, when
/// present, are `[num_instances, height, width]` binary maps at image
/// resolution.
#[derive(Debug, Clone)]
pub struct GroundTruth<B: Backend> {
    pub bboxes: Tensor<B, 2>,
    pub labels: Vec<i64>,
    pub masks: Option<Tensor<B, 3>>,
}

impl<B: Backend> GroundTruth<B> {
    pub fn num_instances(&self) -> usize {
        self.labels.len()
    }
}
