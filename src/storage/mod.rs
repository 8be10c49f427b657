//! On-disk persistence for extracted features.

pub mod append;
pub mod artifact;

pub use append::{FeatureStore, COORDS_ARRAY, FEATURES_ARRAY};
pub use artifact::{
    read_features_artifact, write_features_artifact, ARTIFACT_EXTENSION, FEATURES_TENSOR,
};
