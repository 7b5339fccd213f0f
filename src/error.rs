use thiserror::Error;

/// Fatal failures of the detection core.
///
/// Degenerate-but-defined situations (an image with no valid anchors, zero
/// ground-truth instances, an empty NMS class) are *not* errors; they are
/// handled in place with sentinel values or zero-valued loss contributions.
/// Everything in this enum means the caller fed the core something it cannot
/// recover from.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Classification scores blew up upstream (diverging training).
    #[error("classification scores became infinite or NaN")]
    NonFiniteClsScores,

    /// Box regression predictions blew up upstream.
    #[error("bbox predictions became infinite or NaN")]
    NonFiniteBboxPreds,

    /// Per-level prediction lists do not line up with the anchor levels.
    #[error("expected {expected} prediction levels for `{what}`, got {got}")]
    LevelCountMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// Per-image lists (ground truth, metadata) disagree on the image count.
    #[error("expected {expected} images for `{what}`, got {got}")]
    ImageCountMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },
}

pub type Result<T> = std::result::Result<T, CoreError>;
