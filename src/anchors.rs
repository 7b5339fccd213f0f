use burn::{config::Config, prelude::Backend, tensor::Tensor};

/// Configuration of the multi-level anchor grid.
///
/// One set of base anchors (all ratio/scale combinations) is tiled over every
/// cell of each feature-pyramid level, centered on the cell. The defaults are
/// the YOLACT setup: three aspect ratios, one scale per octave, five pyramid
/// levels with strides 8..128.
#[derive(Config, Debug)]
pub struct AnchorGeneratorConfig {
    #[config(default = "vec![8, 16, 32, 64, 128]")]
    pub strides: Vec<usize>,
    #[config(default = "vec![0.5, 1.0, 2.0]")]
    pub ratios: Vec<f32>,
    #[config(default = 3.0)]
    pub octave_base_scale: f32,
    #[config(default = 1)]
    pub scales_per_octave: usize,
}

impl AnchorGeneratorConfig {
    pub fn init(&self) -> AnchorGenerator {
        let scales = (0..self.scales_per_octave)
            .map(|i| self.octave_base_scale * 2f32.powf(i as f32 / self.scales_per_octave as f32))
            .collect();

        AnchorGenerator {
            strides: self.strides.clone(),
            ratios: self.ratios.clone(),
            scales,
        }
    }
}

/// Generates the fixed per-level anchor grids and their validity flags.
///
/// Anchors are immutable once generated for a given feature-map size; every
/// other component treats them as read-only data.
#[derive(Debug, Clone)]
pub struct AnchorGenerator {
    pub strides: Vec<usize>,
    pub ratios: Vec<f32>,
    pub scales: Vec<f32>,
}

impl AnchorGenerator {
    pub fn num_levels(&self) -> usize {
        self.strides.len()
    }

    /// Anchors per grid cell.
    pub fn num_base_anchors(&self) -> usize {
        self.ratios.len() * self.scales.len()
    }

    /// (width, height) of each base anchor for one level, before grid
    /// translation. A ratio r = h/w widens the anchor by 1/sqrt(r) and
    /// heightens it by sqrt(r), preserving area.
    fn base_sizes(&self, level: usize) -> Vec<(f32, f32)> {
        let base = self.strides[level] as f32;
        let mut sizes = Vec::with_capacity(self.num_base_anchors());

        for ratio in &self.ratios {
            let h_ratio = ratio.sqrt();
            for scale in &self.scales {
                let w = base * scale / h_ratio;
                let h = base * scale * h_ratio;
                sizes.push((w, h));
            }
        }

        sizes
    }

    /// Tiles the base anchors over every cell of every level, centering each
    /// anchor at `(i + 0.5) * stride`. Returns one `[num_anchors, 4]` xyxy
    /// tensor per level, in image pixel coordinates.
    pub fn grid_anchors<B: Backend>(
        &self,
        featmap_sizes: &[(usize, usize)],
        device: &B::Device,
    ) -> Vec<Tensor<B, 2>> {
        let mut levels = Vec::with_capacity(self.num_levels());

        for (level, &(feat_h, feat_w)) in featmap_sizes.iter().enumerate() {
            let stride = self.strides[level] as f32;
            let sizes = self.base_sizes(level);

            let mut coords: Vec<f32> = Vec::with_capacity(feat_h * feat_w * sizes.len() * 4);

            for iy in 0..feat_h {
                let cy = (iy as f32 + 0.5) * stride;
                for ix in 0..feat_w {
                    let cx = (ix as f32 + 0.5) * stride;
                    for (w, h) in &sizes {
                        coords.extend([
                            cx - w * 0.5,
                            cy - h * 0.5,
                            cx + w * 0.5,
                            cy + h * 0.5,
                        ]);
                    }
                }
            }

            let count = coords.len() / 4;
            let anchors = Tensor::<B, 1>::from_floats(coords.as_slice(), device);
            levels.push(anchors.reshape([count, 4]));
        }

        levels
    }

    /// Per-anchor validity flags for one image, per level. An anchor is valid
    /// when its grid cell falls inside the (possibly smaller than the padded
    /// feature map) image region.
    pub fn valid_flags(
        &self,
        featmap_sizes: &[(usize, usize)],
        pad_shape: (usize, usize),
    ) -> Vec<Vec<bool>> {
        let (pad_h, pad_w) = pad_shape;
        let mut levels = Vec::with_capacity(self.num_levels());

        for (level, &(feat_h, feat_w)) in featmap_sizes.iter().enumerate() {
            let stride = self.strides[level];
            let valid_h = pad_h.div_ceil(stride).min(feat_h);
            let valid_w = pad_w.div_ceil(stride).min(feat_w);
            let per_cell = self.num_base_anchors();

            let mut flags = Vec::with_capacity(feat_h * feat_w * per_cell);
            for iy in 0..feat_h {
                for ix in 0..feat_w {
                    let valid = iy < valid_h && ix < valid_w;
                    flags.extend(std::iter::repeat(valid).take(per_cell));
                }
            }
            levels.push(flags);
        }

        levels
    }
}
