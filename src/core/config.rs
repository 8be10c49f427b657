//! Configuration types for the extraction pipeline.
//!
//! All runtime knobs live in explicit structs handed to the driver; nothing
//! is read from ambient global state.

use crate::core::errors::ExtractError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Compute device selection for the frozen extractor.
///
/// `Auto` prefers CUDA when the crate is built with the `cuda` feature and
/// falls back to CPU otherwise; ONNX Runtime performs the final fallback if
/// the accelerator is not usable at session creation time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Device {
    /// Probe for an accelerator, fall back to CPU.
    Auto,
    /// CPU execution provider only.
    Cpu,
    /// NVIDIA CUDA execution provider.
    Cuda {
        /// CUDA device ID.
        device_id: i32,
    },
}

impl Default for Device {
    fn default() -> Self {
        Self::Auto
    }
}

impl Device {
    /// True when this device selection targets an accelerator.
    ///
    /// The loader uses this to pick its parallelism profile, mirroring the
    /// larger worker pool a host feeding an accelerator can afford.
    pub fn is_accelerated(&self) -> bool {
        match self {
            Device::Cpu => false,
            Device::Cuda { .. } => true,
            Device::Auto => cfg!(feature = "cuda"),
        }
    }
}

impl FromStr for Device {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        match lower.as_str() {
            "auto" => Ok(Device::Auto),
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda { device_id: 0 }),
            other => {
                if let Some(id) = other.strip_prefix("cuda:") {
                    let device_id = id.parse::<i32>().map_err(|_| {
                        ExtractError::config_error(format!("invalid CUDA device id '{id}'"))
                    })?;
                    Ok(Device::Cuda { device_id })
                } else {
                    Err(ExtractError::config_error(format!(
                        "unknown device '{s}' (expected 'auto', 'cpu', 'cuda' or 'cuda:<id>')"
                    )))
                }
            }
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Auto => write!(f, "auto"),
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda { device_id } => write!(f, "cuda:{device_id}"),
        }
    }
}

/// Graph optimization levels for ONNX Runtime.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub enum OrtGraphOptimizationLevel {
    /// Disable all optimizations.
    DisableAll,
    /// Enable basic optimizations.
    #[default]
    Level1,
    /// Enable extended optimizations.
    Level2,
    /// Enable all optimizations.
    Level3,
}

/// Configuration for ONNX Runtime sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrtSessionConfig {
    /// Number of threads used to parallelize execution within nodes.
    pub intra_threads: Option<usize>,
    /// Number of threads used to parallelize execution across nodes.
    pub inter_threads: Option<usize>,
    /// Enable parallel execution mode.
    pub parallel_execution: Option<bool>,
    /// Graph optimization level.
    pub optimization_level: Option<OrtGraphOptimizationLevel>,
    /// Number of pooled sessions for concurrent inference.
    #[serde(default = "OrtSessionConfig::default_session_pool_size")]
    pub session_pool_size: usize,
}

impl OrtSessionConfig {
    fn default_session_pool_size() -> usize {
        1
    }

    /// Creates a config with default settings and a single pooled session.
    pub fn new() -> Self {
        Self {
            session_pool_size: 1,
            ..Default::default()
        }
    }
}

/// Parallelism policy for the tile loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelPolicy {
    /// Maximum number of threads for parallel tile normalization.
    /// If None, rayon's default thread pool size is used.
    #[serde(default)]
    pub max_threads: Option<usize>,

    /// Threshold for number of tiles to normalize sequentially (<= this uses
    /// sequential processing).
    #[serde(default = "ParallelPolicy::default_batch_threshold")]
    pub batch_threshold: usize,
}

impl ParallelPolicy {
    fn default_batch_threshold() -> usize {
        4
    }

    /// Profile for a host feeding an accelerator: keep the decode workers
    /// busy so the device never starves.
    pub fn for_accelerator() -> Self {
        Self {
            max_threads: None,
            batch_threshold: 1,
        }
    }
}

impl Default for ParallelPolicy {
    fn default() -> Self {
        Self {
            max_threads: None,
            batch_threshold: Self::default_batch_threshold(),
        }
    }
}

/// Configuration for one extraction run, passed into the slide driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Directory containing the tile bags named by the manifest.
    pub data_dir: PathBuf,
    /// Destination directory for feature stores and consolidated artifacts.
    pub feat_dir: PathBuf,
    /// Optional exact bag name; only the matching slide is processed.
    pub slide_filter: Option<String>,
    /// Number of tiles per extractor invocation.
    pub batch_size: usize,
    /// Skip slides whose output already exists in the destination.
    pub auto_skip: bool,
    /// Log batch progress every this many batches.
    pub log_every: usize,
    /// Compute device selection.
    pub device: Device,
    /// Loader parallelism policy.
    pub parallel: ParallelPolicy,
}

impl ExtractionConfig {
    /// Creates a config with defaults for everything but the directories.
    pub fn new(data_dir: impl Into<PathBuf>, feat_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            feat_dir: feat_dir.into(),
            slide_filter: None,
            batch_size: 256,
            auto_skip: true,
            log_every: 20,
            device: Device::Auto,
            parallel: ParallelPolicy::default(),
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ExtractError> {
        if self.batch_size == 0 {
            return Err(ExtractError::config_error("batch_size must be greater than 0"));
        }
        if self.log_every == 0 {
            return Err(ExtractError::config_error("log_every must be greater than 0"));
        }
        if let Some(threads) = self.parallel.max_threads {
            if threads == 0 {
                return Err(ExtractError::config_error(
                    "parallel.max_threads must be greater than 0 when set",
                ));
            }
        }
        Ok(())
    }
}
