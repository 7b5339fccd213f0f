use burn::{
    prelude::Backend,
    tensor::{Tensor, s},
};

/// Computes the Intersection over Union (IoU) between two sets of bounding
/// boxes in `xyxy` format.
///
/// Each box is represented by its `(x1, y1, x2, y2)` corners in image pixel
/// coordinates. IoU is calculated as:
///
/// `IoU = intersection_area / union_area`
///
/// The result is a matrix of shape `[num_a, num_b]` where entry `(i, j)` is
/// the IoU between box `i` of `a` and box `j` of `b`.
pub fn bbox_overlaps<B: Backend>(a: Tensor<B, 2>, b: Tensor<B, 2>) -> Tensor<B, 2> {
    let [num_a, _] = a.shape().dims();
    let [num_b, _] = b.shape().dims();

    let (ax1, ay1, ax2, ay2) = boxes_to_components(a);
    let (bx1, by1, bx2, by2) = boxes_to_components(b);

    // Broadcast the `a` components down the rows and the `b` components
    // across the columns, giving [num_a, num_b] grids to compare.
    let ax1 = ax1.expand([num_a, num_b]);
    let ay1 = ay1.expand([num_a, num_b]);
    let ax2 = ax2.expand([num_a, num_b]);
    let ay2 = ay2.expand([num_a, num_b]);

    let bx1 = bx1.reshape([1, num_b as i32]).expand([num_a, num_b]);
    let by1 = by1.reshape([1, num_b as i32]).expand([num_a, num_b]);
    let bx2 = bx2.reshape([1, num_b as i32]).expand([num_a, num_b]);
    let by2 = by2.reshape([1, num_b as i32]).expand([num_a, num_b]);

    // Intersection corners: max of the top-left, min of the bottom-right.
    let x1_max = ax1.clone().max_pair(bx1.clone());
    let y1_max = ay1.clone().max_pair(by1.clone());
    let x2_min = ax2.clone().min_pair(bx2.clone());
    let y2_min = ay2.clone().min_pair(by2.clone());

    // Width/height clamped at 0 so disjoint boxes produce no area.
    let intersection = (x2_min - x1_max).clamp_min(0.0) * (y2_min - y1_max).clamp_min(0.0);

    let area_a = (ax2 - ax1) * (ay2 - ay1);
    let area_b = (bx2 - bx1) * (by2 - by1);

    let union = area_a + area_b - intersection.clone();

    intersection / union.clamp_min(1e-6)
}

/// A fixed, reversible parameterization of the offset between an anchor and a
/// target box.
///
/// The regression formula, per anchor `P` and target `G` (both in center
/// form):
///
/// - dx = (Gx - Px) / Pw
/// - dy = (Gy - Py) / Ph
/// - dw = log(Gw / Pw)
/// - dh = log(Gh / Ph)
///
/// each then normalized by the configured means and standard deviations.
/// `decode` is the exact inverse, except that the exp arguments are clamped
/// to `ln(1000/16)` to keep runaway width/height predictions finite and the
/// resulting corners are optionally clamped to the image shape.
///
/// Logarithmic scaling for width and height measures how much a box's size
/// changes relative to its anchor, which keeps training stable across object
/// sizes.
#[derive(Debug, Clone)]
pub struct DeltaXywhCoder {
    pub target_means: [f32; 4],
    pub target_stds: [f32; 4],
}

impl Default for DeltaXywhCoder {
    fn default() -> Self {
        // The stds used by YOLACT (equivalent to the classic 10/10/5/5
        // multiplicative regression weights).
        DeltaXywhCoder {
            target_means: [0.0, 0.0, 0.0, 0.0],
            target_stds: [0.1, 0.1, 0.2, 0.2],
        }
    }
}

impl DeltaXywhCoder {
    /// Computes encoded regression targets mapping `anchors` onto `gt_boxes`.
    /// Both inputs are `[n, 4]` in xyxy format; the output is `[n, 4]`
    /// deltas.
    pub fn encode<B: Backend>(&self, anchors: Tensor<B, 2>, gt_boxes: Tensor<B, 2>) -> Tensor<B, 2> {
        let (gx, gy, gw, gh) = boxes_to_components(x1y1x2y2_to_cxcywh(gt_boxes));
        let (px, py, pw, ph) = boxes_to_components(x1y1x2y2_to_cxcywh(anchors));

        let dx = (gx - px) / pw.clone();
        let dy = (gy - py) / ph.clone();
        let dw = (gw / pw).clamp_min(1e-6).log();
        let dh = (gh / ph).clamp_min(1e-6).log();

        let [m0, m1, m2, m3] = self.target_means;
        let [s0, s1, s2, s3] = self.target_stds;

        Tensor::cat(
            vec![
                (dx - m0) / s0,
                (dy - m1) / s1,
                (dw - m2) / s2,
                (dh - m3) / s3,
            ],
            1,
        )
    }

    /// Applies predicted deltas to anchors, reconstructing boxes in xyxy
    /// format. When `max_shape = (height, width)` is given, the corners are
    /// clamped into the image.
    pub fn decode<B: Backend>(
        &self,
        anchors: Tensor<B, 2>,
        deltas: Tensor<B, 2>,
        max_shape: Option<(usize, usize)>,
    ) -> Tensor<B, 2> {
        let (px, py, pw, ph) = boxes_to_components(x1y1x2y2_to_cxcywh(anchors));
        let (dx, dy, dw, dh) = boxes_to_components(deltas);

        let [m0, m1, m2, m3] = self.target_means;
        let [s0, s1, s2, s3] = self.target_stds;

        let dx = dx * s0 + m0;
        let dy = dy * s1 + m1;

        // Cap the log-space size deltas so exp() cannot overflow on a
        // diverging prediction.
        let max_ratio = (1000.0f32 / 16.0).ln();
        let dw = (dw * s2 + m2).clamp(-max_ratio, max_ratio);
        let dh = (dh * s3 + m3).clamp(-max_ratio, max_ratio);

        let gx = dx * pw.clone() + px;
        let gy = dy * ph.clone() + py;
        let gw = dw.exp() * pw;
        let gh = dh.exp() * ph;

        let boxes = cxcywh_to_x1y1x2y2(Tensor::cat(vec![gx, gy, gw, gh], 1));

        match max_shape {
            Some((h, w)) => {
                let (x1, y1, x2, y2) = boxes_to_components(boxes);
                Tensor::cat(
                    vec![
                        x1.clamp(0.0, w as f32),
                        y1.clamp(0.0, h as f32),
                        x2.clamp(0.0, w as f32),
                        y2.clamp(0.0, h as f32),
                    ],
                    1,
                )
            }
            None => boxes,
        }
    }
}

/// Splits a `[num_boxes, 4]` tensor into its four `[num_boxes, 1]` component
/// columns.
pub fn boxes_to_components<B: Backend>(
    boxes: Tensor<B, 2>,
) -> (Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>) {
    let c1 = s![.., 0];
    let c2 = s![.., 1];
    let c3 = s![.., 2];
    let c4 = s![.., 3];
    (
        boxes.clone().slice(c1),
        boxes.clone().slice(c2),
        boxes.clone().slice(c3),
        boxes.slice(c4),
    )
}

/// Converts boxes from center format (cx, cy, w, h) to corner format
/// (x1, y1, x2, y2).
pub fn cxcywh_to_x1y1x2y2<B: Backend>(a: Tensor<B, 2>) -> Tensor<B, 2> {
    let (cx, cy, w, h) = boxes_to_components(a);

    Tensor::cat(
        vec![
            cx.clone() - w.clone() * 0.5,
            cy.clone() - h.clone() * 0.5,
            cx + w * 0.5,
            cy + h * 0.5,
        ],
        1,
    )
}

/// Converts boxes from corner format (x1, y1, x2, y2) to center format
/// (cx, cy, w, h).
pub fn x1y1x2y2_to_cxcywh<B: Backend>(a: Tensor<B, 2>) -> Tensor<B, 2> {
    let (x1, y1, x2, y2) = boxes_to_components(a);

    let w = x2 - x1.clone();
    let h = y2 - y1.clone();
    let cx = x1 + w.clone() * 0.5;
    let cy = y1 + h.clone() * 0.5;

    Tensor::cat(vec![cx, cy, w, h], 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::{NdArray, ndarray::NdArrayDevice},
        tensor::{Tolerance, ops::FloatElem},
    };

    type B = NdArray<f32>;
    type FT = FloatElem<B>;

    #[test]
    fn test_iou() {
        let device = &NdArrayDevice::default();

        let boxes1 = Tensor::<B, 2>::from_data(
            [
                [0.12, 0.15, 0.30, 0.40],
                [0.05, 0.05, 0.25, 0.20],
                [0.33, 0.20, 0.50, 0.45],
                [0.60, 0.10, 0.85, 0.35],
            ],
            device,
        );

        let boxes2 = Tensor::<B, 2>::from_data(
            [
                [0.10, 0.10, 0.30, 0.30],
                [0.20, 0.25, 0.40, 0.45],
                [0.60, 0.50, 0.80, 0.70],
                [0.35, 0.15, 0.55, 0.35],
                [0.50, 0.60, 0.70, 0.80],
                [0.25, 0.40, 0.45, 0.60],
            ],
            device,
        );

        let iou = bbox_overlaps(boxes1, boxes2);

        Tensor::<B, 2>::from_data(
            [
                [0.46551722, 0.21428573, 0.0, 0.0, 0.0, 0.0],
                [0.27272725, 0.0, 0.0, 0.0, 0.0, 0.0],
                [0.0, 0.20437954, 0.0, 0.375, 0.0, 0.07843133],
                [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            ],
            device,
        )
        .into_data()
        .assert_approx_eq::<FT>(&iou.to_data(), Tolerance::default());
    }

    #[test]
    fn test_iou_identity() {
        let device = &NdArrayDevice::default();
        let boxes = Tensor::<B, 2>::from_data([[10.0, 10.0, 50.0, 60.0]], device);

        let iou = bbox_overlaps(boxes.clone(), boxes);

        Tensor::<B, 2>::from_data([[1.0]], device)
            .into_data()
            .assert_approx_eq::<FT>(&iou.to_data(), Tolerance::absolute(1e-4));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let device = &NdArrayDevice::default();
        let coder = DeltaXywhCoder::default();

        let anchors = Tensor::<B, 2>::from_data(
            [
                [40.0, 40.0, 80.0, 90.0],
                [12.0, 30.0, 44.0, 70.0],
                [100.0, 8.0, 180.0, 96.0],
            ],
            device,
        );
        let gts = Tensor::<B, 2>::from_data(
            [
                [42.0, 38.0, 86.0, 95.0],
                [10.0, 28.0, 40.0, 66.0],
                [90.0, 10.0, 170.0, 100.0],
            ],
            device,
        );

        let deltas = coder.encode(anchors.clone(), gts.clone());
        let decoded = coder.decode(anchors, deltas, None);

        gts.into_data()
            .assert_approx_eq::<FT>(&decoded.to_data(), Tolerance::absolute(1e-3));
    }

    #[test]
    fn test_decode_clamps_to_image() {
        let device = &NdArrayDevice::default();
        let coder = DeltaXywhCoder::default();

        let anchors = Tensor::<B, 2>::from_data([[0.0, 0.0, 100.0, 100.0]], device);
        // A large positive size delta pushes the box far past the image.
        let deltas = Tensor::<B, 2>::from_data([[5.0, 5.0, 10.0, 10.0]], device);

        let decoded = coder.decode(anchors, deltas, Some((64, 48)));
        let vals = decoded.to_data().to_vec::<f32>().unwrap();

        assert!(vals[0] >= 0.0 && vals[2] <= 48.0);
        assert!(vals[1] >= 0.0 && vals[3] <= 64.0);
    }

    #[test]
    fn test_center_corner_conversions_invert() {
        let device = &NdArrayDevice::default();
        let boxes = Tensor::<B, 2>::from_data([[4.0, 6.0, 20.0, 18.0]], device);

        let back = cxcywh_to_x1y1x2y2(x1y1x2y2_to_cxcywh(boxes.clone()));

        boxes
            .into_data()
            .assert_approx_eq::<FT>(&back.to_data(), Tolerance::default());
    }
}
