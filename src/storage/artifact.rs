//! Consolidated per-slide feature artifact.
//!
//! After a slide's growable store is finalized, its `features` array is
//! persisted once more as a single safetensors file for downstream
//! consumers that want a one-shot load. The growable store stays on disk
//! as a secondary artifact.

use crate::core::errors::ExtractError;
use ndarray::Array2;
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use std::path::Path;

/// Tensor name used inside the artifact file.
pub const FEATURES_TENSOR: &str = "features";

/// File extension of the consolidated artifact.
pub const ARTIFACT_EXTENSION: &str = "safetensors";

/// Writes `features` as a consolidated artifact at `path`.
pub fn write_features_artifact(
    path: &Path,
    features: &Array2<f32>,
) -> Result<(), ExtractError> {
    let standard = features
        .as_standard_layout()
        .to_owned();
    let values = standard.as_slice().ok_or_else(|| {
        ExtractError::invalid_input("feature tensor is not contiguous")
    })?;

    let mut bytes = Vec::with_capacity(values.len() * std::mem::size_of::<f32>());
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }

    let view = TensorView::new(Dtype::F32, vec![features.nrows(), features.ncols()], &bytes)
        .map_err(|e| ExtractError::consolidation("failed to build tensor view", e))?;
    safetensors::serialize_to_file([(FEATURES_TENSOR, view)], &None, path)
        .map_err(|e| ExtractError::consolidation("failed to write artifact", e))
}

/// Reads a consolidated artifact back into a feature matrix.
pub fn read_features_artifact(path: &Path) -> Result<Array2<f32>, ExtractError> {
    let buffer = std::fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer)
        .map_err(|e| ExtractError::consolidation("failed to parse artifact", e))?;
    let view = tensors
        .tensor(FEATURES_TENSOR)
        .map_err(|e| ExtractError::consolidation("artifact is missing the features tensor", e))?;

    if view.dtype() != Dtype::F32 || view.shape().len() != 2 {
        return Err(ExtractError::invalid_input(format!(
            "unexpected artifact tensor: dtype {:?}, shape {:?}",
            view.dtype(),
            view.shape()
        )));
    }

    let rows = view.shape()[0];
    let cols = view.shape()[1];
    let values: Vec<f32> = view
        .data()
        .chunks_exact(std::mem::size_of::<f32>())
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Array2::from_shape_vec((rows, cols), values).map_err(ExtractError::Tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_artifact_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slide_001.safetensors");

        let features = array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]];
        write_features_artifact(&path, &features).unwrap();

        let loaded = read_features_artifact(&path).unwrap();
        assert_eq!(loaded, features);
    }

    #[test]
    fn test_missing_artifact_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.safetensors");
        assert!(matches!(
            read_features_artifact(&path),
            Err(ExtractError::Io(_))
        ));
    }
}
