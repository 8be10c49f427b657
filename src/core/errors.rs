//! Error types for the feature extraction pipeline.
//!
//! This module defines the error types that can occur while reading tile
//! bags, running inference, and writing the growable feature store, along
//! with helper constructors for creating them with appropriate context.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Enum representing different stages of processing in the extraction pipeline.
///
/// Used to identify which stage of the pipeline an error occurred in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProcessingStage {
    /// Error occurred during tensor operations.
    TensorOperation,
    /// Error occurred during tile normalization.
    Normalization,
    /// Error occurred while assembling a tile batch.
    BatchAssembly,
    /// Error occurred while consolidating a slide's features.
    Consolidation,
    /// Generic processing error.
    Generic,
}

impl std::fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingStage::TensorOperation => write!(f, "tensor operation"),
            ProcessingStage::Normalization => write!(f, "normalization"),
            ProcessingStage::BatchAssembly => write!(f, "batch assembly"),
            ProcessingStage::Consolidation => write!(f, "consolidation"),
            ProcessingStage::Generic => write!(f, "processing"),
        }
    }
}

/// Errors that can occur in the feature extraction pipeline.
#[derive(Error, Debug)]
pub enum ExtractError {
    /// Error occurred during processing.
    #[error("{kind} failed: {context}")]
    Processing {
        /// The stage of processing where the error occurred.
        kind: ProcessingStage,
        /// Additional context about the error.
        context: String,
        /// The underlying error that caused this error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Error occurred during inference.
    #[error("inference: {context}")]
    Inference {
        /// Additional context about the error.
        context: String,
        /// The underlying error that caused this error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Error occurred while loading the frozen model.
    #[error("failed to load model at '{}'", path.display())]
    ModelLoad {
        /// Path of the model file.
        path: PathBuf,
        /// The underlying error that caused this error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Error from the growable array store.
    #[error("store: {context}")]
    Store {
        /// Additional context about the error.
        context: String,
        /// The underlying error that caused this error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Error indicating invalid input.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// A message describing the invalid input.
        message: String,
    },

    /// Error indicating a configuration problem.
    #[error("configuration: {message}")]
    ConfigError {
        /// A message describing the configuration error.
        message: String,
    },

    /// Error from the ONNX Runtime session.
    #[error(transparent)]
    Session(#[from] ort::Error),

    /// Error from tensor operations.
    #[error("tensor operation")]
    Tensor(#[from] ndarray::ShapeError),

    /// IO error.
    #[error("io")]
    Io(#[from] std::io::Error),
}

/// Convenient result alias for extraction operations.
pub type ExtractResult<T> = Result<T, ExtractError>;

impl ExtractError {
    /// Creates an ExtractError for processing operations.
    pub fn processing_error(
        kind: ProcessingStage,
        context: &str,
        error: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Processing {
            kind,
            context: context.to_string(),
            source: Box::new(error),
        }
    }

    /// Creates an ExtractError for tensor operations.
    pub fn tensor_operation(
        context: &str,
        error: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::processing_error(ProcessingStage::TensorOperation, context, error)
    }

    /// Creates an ExtractError for consolidation failures.
    pub fn consolidation(
        context: &str,
        error: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::processing_error(ProcessingStage::Consolidation, context, error)
    }

    /// Creates an ExtractError for inference failures with context.
    pub fn inference(
        context: impl Into<String>,
        error: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Inference {
            context: context.into(),
            source: Box::new(error),
        }
    }

    /// Creates an ExtractError for a model that failed to load.
    pub fn model_load(path: &Path, error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::ModelLoad {
            path: path.to_path_buf(),
            source: Box::new(error),
        }
    }

    /// Creates an ExtractError for store operations.
    pub fn store(
        context: impl Into<String>,
        error: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Store {
            context: context.into(),
            source: Box::new(error),
        }
    }

    /// Creates an ExtractError for invalid input.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Creates an ExtractError for configuration errors.
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }
}

/// A simple string error for wrapping failure descriptions that have no
/// underlying source error.
#[derive(Debug)]
pub struct SimpleError {
    message: String,
}

impl SimpleError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SimpleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SimpleError {}
