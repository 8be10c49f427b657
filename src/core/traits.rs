//! Traits defining the seams of the extraction pipeline.

use crate::core::batch::{Tensor2D, Tensor4D};
use crate::core::errors::ExtractError;

/// Maps a batch of pixel tensors to a batch of fixed-length feature vectors.
///
/// The driver only speaks this trait; the ONNX-backed implementation lives
/// in [`crate::core::inference`].
pub trait FeatureEncoder {
    /// Runs the frozen forward pass over `pixels` (shape `(batch, 3, h, w)`)
    /// and returns one feature vector per tile (shape `(batch, feature_dim)`).
    fn encode(&self, pixels: &Tensor4D) -> Result<Tensor2D, ExtractError>;

    /// The feature dimension, when known ahead of the first forward pass.
    fn feature_dim(&self) -> Option<usize> {
        None
    }
}
