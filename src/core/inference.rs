//! ONNX Runtime inference engine for the frozen feature extractor.
//!
//! Sessions are created once per run and reused read-only across all slides.
//! A small session pool guarded by mutexes allows concurrent forward passes;
//! selection is round-robin via an atomic counter.

use crate::core::batch::{Tensor2D, Tensor4D};
use crate::core::config::{Device, OrtGraphOptimizationLevel, OrtSessionConfig};
use crate::core::errors::{ExtractError, SimpleError};
use crate::core::traits::FeatureEncoder;
use ndarray::ArrayView2;
use ort::execution_providers::ExecutionProviderDispatch;
use ort::logging::LogLevel;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use ort::value::{TensorRef, ValueType};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Frozen convolutional feature extractor backed by ONNX Runtime.
pub struct OrtFeatureExtractor {
    sessions: Vec<Mutex<Session>>,
    next_idx: AtomicUsize,
    input_name: String,
    output_name: String,
    feature_dim: Option<usize>,
    model_path: PathBuf,
    model_name: String,
}

impl std::fmt::Debug for OrtFeatureExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrtFeatureExtractor")
            .field("sessions", &self.sessions.len())
            .field("input_name", &self.input_name)
            .field("output_name", &self.output_name)
            .field("feature_dim", &self.feature_dim)
            .field("model_path", &self.model_path)
            .field("model_name", &self.model_name)
            .finish()
    }
}

impl OrtFeatureExtractor {
    /// Loads the frozen model and builds the session pool.
    ///
    /// Input and output tensor names are discovered from the first session's
    /// metadata; the feature dimension is taken from the output shape when
    /// the model declares it statically.
    pub fn load(
        model_path: impl AsRef<Path>,
        device: Device,
        config: &OrtSessionConfig,
    ) -> Result<Self, ExtractError> {
        let path = model_path.as_ref();
        let pool_size = config.session_pool_size.max(1);

        let mut sessions = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let builder = Self::configured_builder(device, config)?;
            let session = builder
                .commit_from_file(path)
                .map_err(|e| ExtractError::model_load(path, e))?;
            sessions.push(session);
        }

        let first = sessions
            .first()
            .ok_or_else(|| ExtractError::invalid_input("session pool is empty"))?;
        let input_name = first
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| {
                ExtractError::invalid_input("model declares no inputs - file may be corrupted")
            })?;
        let output = first.outputs.first().ok_or_else(|| {
            ExtractError::invalid_input("model declares no outputs - file may be corrupted")
        })?;
        let output_name = output.name.clone();
        let feature_dim = match &output.output_type {
            ValueType::Tensor { shape, .. } => shape
                .last()
                .copied()
                .filter(|&dim| dim > 0)
                .map(|dim| dim as usize),
            _ => None,
        };

        let model_name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown_model")
            .to_string();

        Ok(Self {
            sessions: sessions.into_iter().map(Mutex::new).collect(),
            next_idx: AtomicUsize::new(0),
            input_name,
            output_name,
            feature_dim,
            model_path: path.to_path_buf(),
            model_name,
        })
    }

    fn configured_builder(
        device: Device,
        config: &OrtSessionConfig,
    ) -> Result<SessionBuilder, ExtractError> {
        let mut builder = Session::builder()?.with_log_level(LogLevel::Error)?;
        if let Some(intra) = config.intra_threads {
            builder = builder.with_intra_threads(intra)?;
        }
        if let Some(inter) = config.inter_threads {
            builder = builder.with_inter_threads(inter)?;
        }
        if let Some(parallel) = config.parallel_execution {
            builder = builder.with_parallel_execution(parallel)?;
        }
        if let Some(level) = config.optimization_level {
            let mapped = match level {
                OrtGraphOptimizationLevel::DisableAll => GraphOptimizationLevel::Disable,
                OrtGraphOptimizationLevel::Level1 => GraphOptimizationLevel::Level1,
                OrtGraphOptimizationLevel::Level2 => GraphOptimizationLevel::Level2,
                OrtGraphOptimizationLevel::Level3 => GraphOptimizationLevel::Level3,
            };
            builder = builder.with_optimization_level(mapped)?;
        }
        let providers = Self::execution_providers(device)?;
        builder = builder.with_execution_providers(providers)?;
        Ok(builder)
    }

    /// Builds the execution provider list for the requested device.
    ///
    /// The CPU provider always terminates the list so ONNX Runtime can fall
    /// back when the accelerator is unavailable at session creation time.
    fn execution_providers(device: Device) -> Result<Vec<ExecutionProviderDispatch>, ExtractError> {
        match device {
            Device::Cpu => Ok(vec![
                ort::execution_providers::CPUExecutionProvider::default().build(),
            ]),
            #[cfg(feature = "cuda")]
            Device::Cuda { device_id } => Ok(vec![
                ort::execution_providers::CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                ort::execution_providers::CPUExecutionProvider::default().build(),
            ]),
            #[cfg(not(feature = "cuda"))]
            Device::Cuda { .. } => Err(ExtractError::config_error(
                "CUDA device requested but wsi-feat was built without the 'cuda' feature",
            )),
            #[cfg(feature = "cuda")]
            Device::Auto => Ok(vec![
                ort::execution_providers::CUDAExecutionProvider::default().build(),
                ort::execution_providers::CPUExecutionProvider::default().build(),
            ]),
            #[cfg(not(feature = "cuda"))]
            Device::Auto => Ok(vec![
                ort::execution_providers::CPUExecutionProvider::default().build(),
            ]),
        }
    }

    /// Returns the model path associated with this extractor.
    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    /// Returns the model name associated with this extractor.
    pub fn model_name(&self) -> &str {
        &self.model_name
    }
}

impl FeatureEncoder for OrtFeatureExtractor {
    fn encode(&self, pixels: &Tensor4D) -> Result<Tensor2D, ExtractError> {
        let batch_size = pixels.shape()[0];
        let input_shape = pixels.shape().to_vec();

        let input_tensor = TensorRef::from_array_view(pixels.view()).map_err(|e| {
            ExtractError::inference(
                format!(
                    "model '{}': failed to convert input tensor with shape {:?}",
                    self.model_name, input_shape
                ),
                e,
            )
        })?;
        let inputs = ort::inputs![self.input_name.as_str() => input_tensor];

        let idx = self.next_idx.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        let mut session_guard = self.sessions[idx].lock().map_err(|_| {
            ExtractError::inference(
                format!(
                    "model '{}': failed to acquire session lock {}/{}",
                    self.model_name,
                    idx,
                    self.sessions.len()
                ),
                SimpleError::new("session lock poisoned"),
            )
        })?;

        let outputs = session_guard.run(inputs).map_err(|e| {
            ExtractError::inference(
                format!(
                    "model '{}': forward pass failed with input '{}' -> output '{}'",
                    self.model_name, self.input_name, self.output_name
                ),
                e,
            )
        })?;

        let (output_shape, output_data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| {
                ExtractError::inference(
                    format!(
                        "model '{}': failed to extract output tensor '{}' as f32",
                        self.model_name, self.output_name
                    ),
                    e,
                )
            })?;

        if output_shape.len() != 2 {
            return Err(ExtractError::invalid_input(format!(
                "model '{}': expected 2D feature output, got {}D with shape {:?}",
                self.model_name,
                output_shape.len(),
                output_shape
            )));
        }

        let rows = output_shape[0] as usize;
        let feature_dim = output_shape[1] as usize;
        if rows != batch_size {
            return Err(ExtractError::invalid_input(format!(
                "model '{}': output rows {} do not match batch size {}",
                self.model_name, rows, batch_size
            )));
        }
        if output_data.len() != rows * feature_dim {
            return Err(ExtractError::invalid_input(format!(
                "model '{}': output data size mismatch, expected {}, got {}",
                self.model_name,
                rows * feature_dim,
                output_data.len()
            )));
        }

        let view = ArrayView2::from_shape((rows, feature_dim), output_data)
            .map_err(ExtractError::Tensor)?;
        Ok(view.to_owned())
    }

    fn feature_dim(&self) -> Option<usize> {
        self.feature_dim
    }
}
