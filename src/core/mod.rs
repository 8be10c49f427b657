//! The core module of the extraction pipeline.
//!
//! This module contains the fundamental components of the pipeline:
//! - Batching utilities and tensor aliases
//! - Configuration structs
//! - Error handling
//! - Inference engine integration
//! - Traits defining the pipeline seams

pub mod batch;
pub mod config;
pub mod errors;
pub mod inference;
pub mod traits;

pub use batch::{BatchSampler, Coords2D, Tensor2D, Tensor3D, Tensor4D, TileBatch};
pub use config::{Device, ExtractionConfig, OrtSessionConfig, ParallelPolicy};
pub use errors::{ExtractError, ExtractResult, ProcessingStage};
pub use inference::OrtFeatureExtractor;
pub use traits::FeatureEncoder;

/// Initializes the tracing subscriber for logging.
///
/// Sets up the tracing subscriber with environment filter and formatting
/// layer. Typically called at the start of an application to enable logging.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
}
