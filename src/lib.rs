//! # wsi-feat
//!
//! Batched tile feature extraction for whole-slide image bags.
//!
//! Each slide's pre-extracted tiles (a "bag") are pushed through a frozen
//! convolutional network; per-tile feature vectors and coordinates are
//! appended incrementally to a growable chunked array store and finally
//! consolidated into a single tensor artifact per slide.
//!
//! ## Modules
//!
//! * [`core`] - Tensor aliases, configuration, errors, and the inference engine
//! * [`dataset`] - Manifest parsing and tile bag loading
//! * [`processors`] - Tile normalization
//! * [`storage`] - The growable feature store and consolidated artifacts
//! * [`pipeline`] - The slide driver and run statistics

pub mod core;
pub mod dataset;
pub mod pipeline;
pub mod processors;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    // Error handling
    pub use crate::core::errors::{ExtractError, ExtractResult};

    // Configuration
    pub use crate::core::config::{Device, ExtractionConfig, OrtSessionConfig, ParallelPolicy};

    // Batching and inference
    pub use crate::core::batch::{TileBatch, Tensor2D, Tensor4D};
    pub use crate::core::inference::OrtFeatureExtractor;
    pub use crate::core::traits::FeatureEncoder;

    // Dataset access
    pub use crate::dataset::{BagLoader, BagManifest, TileBag};

    // Persistence
    pub use crate::storage::{FeatureStore, read_features_artifact, write_features_artifact};

    // Driving a run
    pub use crate::pipeline::{RunSummary, SlideDriver};
}
