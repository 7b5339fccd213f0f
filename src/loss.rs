use burn::{
    nn::loss::HuberLossConfig,
    prelude::Backend,
    tensor::{ElementConversion, Int, Tensor, activation::log_softmax, s},
};
use tracing::debug;

use crate::{
    assign::index_tensor,
    error::{CoreError, Result},
};

/// Unreduced cross-entropy over class logits.
///
/// `L_i = -log softmax(logits_i)[target_i]`
///
/// Returns one loss value per row; reduction is left to the caller because
/// OHEM sums a hand-picked subset rather than averaging everything.
pub fn cross_entropy_loss<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    let [num_rows, _] = logits.shape().dims();
    let log_probs = log_softmax(logits, 1);
    log_probs
        .gather(1, targets.reshape([num_rows, 1]))
        .reshape([num_rows])
        * -1.0
}

/// OHEM classification loss for one image.
///
/// Positives (label < `background_label`, nonzero weight) all contribute.
/// Negatives are mined: only the `neg_pos_ratio * num_pos` highest-loss
/// background anchors count (all of them when the image has no positives).
/// The summed loss is divided by `avg_factor`, the batch-wide positive
/// count, so per-image reductions stay comparable across batch sizes.
pub fn ohem_classification_loss<B: Backend>(
    cls_score: Tensor<B, 2>,
    labels: Tensor<B, 1, Int>,
    label_weights: Tensor<B, 1>,
    background_label: i64,
    neg_pos_ratio: usize,
    avg_factor: f32,
) -> Tensor<B, 1> {
    let device = cls_score.device();
    let loss_all = cross_entropy_loss(cls_score, labels.clone()) * label_weights.clone();

    let label_vals = labels.to_data().to_vec::<i64>().unwrap();
    let weight_vals = label_weights.to_data().to_vec::<f32>().unwrap();

    let mut pos_inds = Vec::new();
    let mut is_neg = vec![false; label_vals.len()];
    let mut num_neg = 0;
    for (i, (&l, &w)) in label_vals.iter().zip(&weight_vals).enumerate() {
        if w <= 0.0 {
            continue;
        }
        if l >= 0 && l < background_label {
            pos_inds.push(i);
        } else if l == background_label {
            is_neg[i] = true;
            num_neg += 1;
        }
    }

    let num_pos = pos_inds.len();
    let num_neg_samples = if num_pos == 0 {
        num_neg
    } else {
        (neg_pos_ratio * num_pos).min(num_neg)
    };
    debug!(num_pos, num_neg_samples, "ohem sample counts");

    let mut loss = Tensor::<B, 1>::zeros([1], &device);

    if num_pos > 0 {
        loss = loss
            + loss_all
                .clone()
                .select(0, index_tensor::<B>(&pos_inds, &device))
                .sum();
    }
    if num_neg_samples > 0 {
        // Everything that is not an eligible negative sinks to -inf, so a
        // descending sort floats the hardest negatives to the front and a
        // prefix slice is exactly the mined set.
        let not_neg: Tensor<B, 1, burn::tensor::Bool> = Tensor::from_data(
            is_neg.iter().map(|&n| !n).collect::<Vec<_>>().as_slice(),
            &device,
        );
        let mined = loss_all
            .mask_fill(not_neg, f32::NEG_INFINITY)
            .sort_descending(0)
            .slice(s![0..num_neg_samples]);
        loss = loss + mined.sum();
    }

    loss / avg_factor
}

/// Weighted smooth-L1 box regression loss for one image.
///
/// The transition point sits at 1.0, quadratic below and linear above.
/// `weights` zeroes out non-positive anchors (and any coordinate the target
/// engine marked invalid); the sum is divided by `avg_factor`.
pub fn weighted_smooth_l1<B: Backend>(
    bbox_pred: Tensor<B, 2>,
    bbox_targets: Tensor<B, 2>,
    bbox_weights: Tensor<B, 2>,
    avg_factor: f32,
) -> Tensor<B, 1> {
    let elementwise = HuberLossConfig::new(1.0)
        .init()
        .forward_no_reduction(bbox_pred, bbox_targets);
    (elementwise * bbox_weights).sum() / avg_factor
}

/// Rejects prediction tensors that went non-finite upstream. A NaN loss
/// silently poisons every weight on the next optimizer step, so diverging
/// inputs fail loudly here instead.
pub fn ensure_finite<B: Backend, const D: usize>(
    tensor: &Tensor<B, D>,
    err: CoreError,
) -> Result<()> {
    let total: f32 = tensor.clone().abs().sum().into_scalar().elem();
    if total.is_finite() { Ok(()) } else { Err(err) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::assert_approx_eq;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};
    use burn::tensor::{Tolerance, ops::FloatElem};

    type B = NdArray<f32>;
    type FT = FloatElem<B>;

    fn ce_row(logits: &[f32], target: usize) -> f32 {
        let denom: f32 = logits.iter().map(|&x| x.exp()).sum();
        -(logits[target].exp() / denom).ln()
    }

    #[test]
    fn test_cross_entropy_matches_reference() {
        let device = &NdArrayDevice::default();
        let rows = [[2.0f32, 0.5, -1.0], [0.0, 0.0, 0.0]];
        let logits = Tensor::<B, 2>::from_data(rows, device);
        let targets = Tensor::<B, 1, Int>::from_ints([0, 2], device);

        let loss = cross_entropy_loss(logits, targets);
        let expected = [ce_row(&rows[0], 0), ce_row(&rows[1], 2)];

        loss.into_data().assert_approx_eq::<FT>(
            &Tensor::<B, 1>::from_floats(expected, device).into_data(),
            Tolerance::default(),
        );
    }

    #[test]
    fn test_ohem_keeps_hardest_negatives() {
        let device = &NdArrayDevice::default();
        // One positive (row 0, class 0) and four negatives with increasingly
        // confident wrong predictions. Budget = 3 * 1, so the easiest
        // negative (row 1) must drop out.
        let rows = [
            [3.0f32, 0.0, 0.0], // positive, well classified
            [0.0, 0.0, 3.0],    // easy negative
            [1.5, 0.0, 0.0],    // hard negative
            [2.0, 0.0, 0.0],    // harder negative
            [2.5, 0.0, 0.0],    // hardest negative
        ];
        let logits = Tensor::<B, 2>::from_data(rows, device);
        let labels = Tensor::<B, 1, Int>::from_ints([0, 2, 2, 2, 2], device);
        let weights = Tensor::<B, 1>::ones([5], device);

        let loss = ohem_classification_loss(logits, labels, weights, 2, 3, 1.0)
            .into_scalar();

        let expected = ce_row(&rows[0], 0)
            + ce_row(&rows[2], 2)
            + ce_row(&rows[3], 2)
            + ce_row(&rows[4], 2);
        assert_approx_eq(&loss, &expected, 1e-4);
    }

    #[test]
    fn test_ohem_uses_all_negatives_without_positives() {
        let device = &NdArrayDevice::default();
        let rows = [[1.0f32, 0.0, 0.0], [0.5, 0.0, 0.0], [0.0, 0.0, 2.0]];
        let logits = Tensor::<B, 2>::from_data(rows, device);
        let labels = Tensor::<B, 1, Int>::from_ints([2, 2, 2], device);
        let weights = Tensor::<B, 1>::ones([3], device);

        let loss = ohem_classification_loss(logits, labels, weights, 2, 3, 1.0)
            .into_scalar();

        let expected: f32 = rows.iter().map(|r| ce_row(r, 2)).sum();
        assert_approx_eq(&loss, &expected, 1e-4);
    }

    #[test]
    fn test_ohem_respects_zero_weights() {
        let device = &NdArrayDevice::default();
        // The hardest negative has zero weight (invalid anchor) and must be
        // skipped even though its raw loss is the largest.
        let rows = [
            [3.0f32, 0.0, 0.0], // positive
            [5.0, 0.0, 0.0],    // zero-weight negative
            [1.0, 0.0, 0.0],    // eligible negative
        ];
        let logits = Tensor::<B, 2>::from_data(rows, device);
        let labels = Tensor::<B, 1, Int>::from_ints([0, 2, 2], device);
        let weights = Tensor::<B, 1>::from_floats([1.0, 0.0, 1.0], device);

        let loss = ohem_classification_loss(logits, labels, weights, 2, 3, 1.0)
            .into_scalar();

        let expected = ce_row(&rows[0], 0) + ce_row(&rows[2], 2);
        assert_approx_eq(&loss, &expected, 1e-4);
    }

    #[test]
    fn test_smooth_l1_regions() {
        let device = &NdArrayDevice::default();
        let pred = Tensor::<B, 2>::from_data([[0.5f32, 2.0, 0.0, 0.0]], device);
        let target = Tensor::<B, 2>::zeros([1, 4], device);
        let weights = Tensor::<B, 2>::from_data([[1.0f32, 1.0, 1.0, 0.0]], device);

        let loss = weighted_smooth_l1(pred, target, weights, 1.0).into_scalar();

        // |0.5| < 1 -> 0.5 * 0.5^2 = 0.125; |2.0| >= 1 -> 2.0 - 0.5 = 1.5.
        assert_approx_eq(&loss, &1.625, 1e-5);
    }

    #[test]
    fn test_ensure_finite() {
        let device = &NdArrayDevice::default();
        let ok = Tensor::<B, 2>::from_data([[1.0f32, -2.0]], device);
        assert!(ensure_finite(&ok, CoreError::NonFiniteClsScores).is_ok());

        let bad = Tensor::<B, 2>::from_data([[1.0f32, f32::NAN]], device);
        assert!(ensure_finite(&bad, CoreError::NonFiniteClsScores).is_err());
    }
}
