//! The slide driver: walks the manifest and turns each tile bag into a
//! growable feature store plus a consolidated artifact.
//!
//! Slides move through PENDING -> SKIPPED | PROCESSING -> DONE | FAILED.
//! The model is loaded once and shared read-only across slides; slides are
//! handled strictly one at a time, so the destination directory needs no
//! locking. A failure in one slide is caught at slide granularity, recorded
//! in the run summary, and does not stop the remaining slides.

pub mod stats;

use crate::core::config::ExtractionConfig;
use crate::core::errors::ExtractError;
use crate::core::traits::FeatureEncoder;
use crate::dataset::bag::{BagLoader, TileBag, BAG_SUFFIX};
use crate::dataset::manifest::BagManifest;
use crate::processors::normalize::NormalizeTile;
use crate::storage::append::FeatureStore;
use crate::storage::artifact::{write_features_artifact, ARTIFACT_EXTENSION};
use self::stats::ExtractionStats;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

/// One slide that could not be processed.
#[derive(Debug)]
pub struct SlideFailure {
    /// The bag name from the manifest.
    pub bag_name: String,
    /// The error that stopped the slide.
    pub error: ExtractError,
}

/// Outcome of a completed run.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Aggregate counters for the run.
    pub stats: ExtractionStats,
    /// Slides that failed, in manifest order.
    pub failures: Vec<SlideFailure>,
}

impl RunSummary {
    /// True when at least one slide failed.
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.stats)?;
        if self.has_failures() {
            writeln!(f, "Failed slides:")?;
            for failure in &self.failures {
                writeln!(f, "  {}: {}", failure.bag_name, failure.error)?;
            }
        }
        Ok(())
    }
}

/// Per-slide result used for logging and stats.
struct SlideReport {
    tiles: usize,
    feature_dim: usize,
}

/// Drives feature extraction over every slide in a manifest.
pub struct SlideDriver<'a, E> {
    encoder: &'a E,
    config: &'a ExtractionConfig,
    normalize: NormalizeTile,
}

impl<'a, E: FeatureEncoder> SlideDriver<'a, E> {
    /// Creates a driver for `encoder` with the given configuration.
    pub fn new(encoder: &'a E, config: &'a ExtractionConfig) -> Result<Self, ExtractError> {
        config.validate()?;
        Ok(Self {
            encoder,
            config,
            normalize: NormalizeTile::imagenet()?,
        })
    }

    /// Processes every eligible slide in the manifest.
    ///
    /// Returns the run summary; per-slide errors are recorded there rather
    /// than propagated, so a bad slide never aborts the run.
    pub fn run(&self, manifest: &BagManifest) -> Result<RunSummary, ExtractError> {
        std::fs::create_dir_all(&self.config.feat_dir)?;
        let existing: HashSet<String> = std::fs::read_dir(&self.config.feat_dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();

        let mut summary = RunSummary::default();
        let total = manifest.len();
        for (index, bag_name) in manifest.entries().iter().enumerate() {
            if !bag_name.ends_with(BAG_SUFFIX) {
                continue;
            }
            if let Some(filter) = &self.config.slide_filter {
                if filter != bag_name {
                    continue;
                }
            }

            info!("progress: {}/{} - {}", index + 1, total, bag_name);
            if self.config.auto_skip && existing.contains(bag_name) {
                info!("skipped {bag_name}");
                summary.stats.record_skipped();
                continue;
            }

            let started = Instant::now();
            match self.process_slide(bag_name) {
                Ok(report) => {
                    let elapsed = started.elapsed();
                    info!(
                        "computing features for {} took {:.2} s ({} tiles, dim {})",
                        bag_name,
                        elapsed.as_secs_f64(),
                        report.tiles,
                        report.feature_dim
                    );
                    summary.stats.record_processed(report.tiles, elapsed);
                }
                Err(error) => {
                    warn!("failure {bag_name}: {error}");
                    summary.stats.record_failed();
                    summary.failures.push(SlideFailure {
                        bag_name: bag_name.clone(),
                        error,
                    });
                }
            }
        }
        Ok(summary)
    }

    /// Runs one slide start to finish: load, extract, append, consolidate.
    fn process_slide(&self, bag_name: &str) -> Result<SlideReport, ExtractError> {
        let bag_path = self.config.data_dir.join(bag_name);
        let out_path = self.config.feat_dir.join(bag_name);

        let bag = TileBag::open(&bag_path)?;
        let loader = BagLoader::new(
            &bag,
            self.config.batch_size,
            &self.normalize,
            &self.config.parallel,
        );
        let num_batches = loader.num_batches();
        info!("processing {}: total of {} batches", bag_name, num_batches);

        // The store is created at the first batch, truncating any stale
        // output from a previous run, and held open for the whole slide.
        let mut store: Option<FeatureStore> = None;
        for (count, batch) in loader.batches().enumerate() {
            let batch = batch?;
            if count % self.config.log_every == 0 {
                info!(
                    "batch {}/{}, {} tiles processed",
                    count,
                    num_batches,
                    count * self.config.batch_size
                );
            }
            let features = self.encoder.encode(&batch.pixels)?;
            if store.is_none() {
                store = Some(FeatureStore::create(&out_path)?);
            }
            let target = store.as_mut().ok_or_else(|| {
                ExtractError::invalid_input(format!("store for '{bag_name}' was not created"))
            })?;
            target.append(features.view(), batch.coords.view())?;
        }

        let store = store.ok_or_else(|| {
            ExtractError::invalid_input(format!("bag '{bag_name}' produced no batches"))
        })?;
        let tiles = store.rows() as usize;
        drop(store);

        // Reopen read-only and consolidate the features into one artifact.
        let finalized = FeatureStore::open(&out_path)?;
        let features = finalized.read_features()?;
        let coords = finalized.read_coords()?;
        info!("features size: {:?}", features.dim());
        info!("coordinates size: {:?}", coords.dim());

        let artifact_path = artifact_path(&self.config.feat_dir, bag_name);
        write_features_artifact(&artifact_path, &features)?;

        Ok(SlideReport {
            tiles,
            feature_dim: features.ncols(),
        })
    }
}

/// Location of the consolidated artifact for a bag name.
pub fn artifact_path(feat_dir: &Path, bag_name: &str) -> PathBuf {
    let stem = Path::new(bag_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(bag_name);
    feat_dir.join(format!("{stem}.{ARTIFACT_EXTENSION}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::batch::{Tensor2D, Tensor4D};
    use crate::dataset::testutil::write_bag;
    use crate::storage::artifact::read_features_artifact;
    use ndarray::{Array2, Array4, Axis};
    use std::sync::Mutex;

    /// Encoder stub: per-channel spatial mean, records every batch size.
    struct StubEncoder {
        calls: Mutex<Vec<usize>>,
    }

    impl StubEncoder {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }

        fn batch_sizes(&self) -> Vec<usize> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl FeatureEncoder for StubEncoder {
        fn encode(&self, pixels: &Tensor4D) -> Result<Tensor2D, ExtractError> {
            let batch = pixels.shape()[0];
            self.calls.lock().unwrap().push(batch);

            let mut out = Tensor2D::zeros((batch, 3));
            for i in 0..batch {
                for c in 0..3 {
                    let channel = pixels.index_axis(Axis(0), i);
                    let channel = channel.index_axis(Axis(0), c);
                    out[[i, c]] = channel.mean().unwrap_or(0.0);
                }
            }
            Ok(out)
        }

        fn feature_dim(&self) -> Option<usize> {
            Some(3)
        }
    }

    fn write_sample_bag(data_dir: &Path, name: &str, tiles: usize) {
        let pixels = Array4::<u8>::from_shape_fn((tiles, 4, 4, 3), |(n, y, x, c)| {
            (n * 13 + y * 7 + x * 3 + c) as u8
        });
        let coords = Array2::<i64>::from_shape_fn((tiles, 2), |(n, i)| (n * 128 + i * 4) as i64);
        write_bag(&data_dir.join(name), &pixels, &coords);
    }

    fn test_config(data_dir: &Path, feat_dir: &Path, batch_size: usize) -> ExtractionConfig {
        let mut config = ExtractionConfig::new(data_dir, feat_dir);
        config.batch_size = batch_size;
        config
    }

    #[test]
    fn test_seventeen_tiles_batch_size_eight() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("bags");
        let feat_dir = dir.path().join("features");
        std::fs::create_dir_all(&data_dir).unwrap();
        write_sample_bag(&data_dir, "slide_001.zarr", 17);

        let manifest = BagManifest::from_entries(vec!["slide_001.zarr".to_string()]);
        let config = test_config(&data_dir, &feat_dir, 8);
        let encoder = StubEncoder::new();
        let driver = SlideDriver::new(&encoder, &config).unwrap();
        let summary = driver.run(&manifest).unwrap();

        assert_eq!(encoder.batch_sizes(), vec![8, 8, 1]);
        assert_eq!(summary.stats.slides_processed, 1);
        assert_eq!(summary.stats.tiles_processed, 17);
        assert!(!summary.has_failures());

        let store = FeatureStore::open(feat_dir.join("slide_001.zarr")).unwrap();
        assert_eq!(store.rows(), 17);
        assert_eq!(store.read_features().unwrap().dim(), (17, 3));
        assert_eq!(store.read_coords().unwrap().dim(), (17, 2));

        let artifact = read_features_artifact(&artifact_path(&feat_dir, "slide_001.zarr")).unwrap();
        assert_eq!(artifact.dim(), (17, 3));
    }

    #[test]
    fn test_features_stay_aligned_with_tile_order() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("bags");
        let feat_dir = dir.path().join("features");
        std::fs::create_dir_all(&data_dir).unwrap();
        write_sample_bag(&data_dir, "slide_001.zarr", 10);

        let manifest = BagManifest::from_entries(vec!["slide_001.zarr".to_string()]);
        let config = test_config(&data_dir, &feat_dir, 3);
        let encoder = StubEncoder::new();
        let driver = SlideDriver::new(&encoder, &config).unwrap();
        driver.run(&manifest).unwrap();

        let store = FeatureStore::open(feat_dir.join("slide_001.zarr")).unwrap();
        let coords = store.read_coords().unwrap();
        for row in 0..10 {
            assert_eq!(coords[[row, 0]], (row * 128) as i64);
            assert_eq!(coords[[row, 1]], (row * 128 + 4) as i64);
        }
    }

    #[test]
    fn test_skip_existing_leaves_output_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("bags");
        let feat_dir = dir.path().join("features");
        std::fs::create_dir_all(&data_dir).unwrap();
        write_sample_bag(&data_dir, "slide_001.zarr", 9);

        let manifest = BagManifest::from_entries(vec!["slide_001.zarr".to_string()]);
        let config = test_config(&data_dir, &feat_dir, 4);
        let encoder = StubEncoder::new();
        let driver = SlideDriver::new(&encoder, &config).unwrap();
        driver.run(&manifest).unwrap();

        let artifact = artifact_path(&feat_dir, "slide_001.zarr");
        let bytes_before = std::fs::read(&artifact).unwrap();
        let calls_before = encoder.batch_sizes().len();

        let summary = driver.run(&manifest).unwrap();
        assert_eq!(summary.stats.slides_skipped, 1);
        assert_eq!(summary.stats.slides_processed, 0);
        // The extractor was never invoked and the artifact is byte-identical.
        assert_eq!(encoder.batch_sizes().len(), calls_before);
        assert_eq!(std::fs::read(&artifact).unwrap(), bytes_before);
    }

    #[test]
    fn test_rerun_without_skip_truncates_stale_output() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("bags");
        let feat_dir = dir.path().join("features");
        std::fs::create_dir_all(&data_dir).unwrap();
        write_sample_bag(&data_dir, "slide_001.zarr", 9);

        let manifest = BagManifest::from_entries(vec!["slide_001.zarr".to_string()]);
        let mut config = test_config(&data_dir, &feat_dir, 4);
        let encoder = StubEncoder::new();
        let driver = SlideDriver::new(&encoder, &config).unwrap();
        driver.run(&manifest).unwrap();

        config.auto_skip = false;
        let driver = SlideDriver::new(&encoder, &config).unwrap();
        let summary = driver.run(&manifest).unwrap();
        assert_eq!(summary.stats.slides_processed, 1);

        // A rerun replaces the stale rows instead of extending them.
        let store = FeatureStore::open(feat_dir.join("slide_001.zarr")).unwrap();
        assert_eq!(store.rows(), 9);
    }

    #[test]
    fn test_empty_manifest_produces_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("bags");
        let feat_dir = dir.path().join("features");
        std::fs::create_dir_all(&data_dir).unwrap();

        let manifest = BagManifest::from_entries(Vec::new());
        let config = test_config(&data_dir, &feat_dir, 8);
        let encoder = StubEncoder::new();
        let driver = SlideDriver::new(&encoder, &config).unwrap();
        let summary = driver.run(&manifest).unwrap();

        assert_eq!(summary.stats.total_slides(), 0);
        assert_eq!(std::fs::read_dir(&feat_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_filter_matching_nothing_processes_no_slides() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("bags");
        let feat_dir = dir.path().join("features");
        std::fs::create_dir_all(&data_dir).unwrap();
        write_sample_bag(&data_dir, "slide_001.zarr", 5);

        let manifest = BagManifest::from_entries(vec!["slide_001.zarr".to_string()]);
        let mut config = test_config(&data_dir, &feat_dir, 8);
        config.slide_filter = Some("slide_999.zarr".to_string());
        let encoder = StubEncoder::new();
        let driver = SlideDriver::new(&encoder, &config).unwrap();
        let summary = driver.run(&manifest).unwrap();

        assert_eq!(summary.stats.total_slides(), 0);
        assert!(encoder.batch_sizes().is_empty());
        assert_eq!(std::fs::read_dir(&feat_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_failing_slide_does_not_stop_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("bags");
        let feat_dir = dir.path().join("features");
        std::fs::create_dir_all(&data_dir).unwrap();
        // "slide_missing.zarr" is listed but never written to disk.
        write_sample_bag(&data_dir, "slide_002.zarr", 6);

        let manifest = BagManifest::from_entries(vec![
            "slide_missing.zarr".to_string(),
            "slide_002.zarr".to_string(),
        ]);
        let config = test_config(&data_dir, &feat_dir, 4);
        let encoder = StubEncoder::new();
        let driver = SlideDriver::new(&encoder, &config).unwrap();
        let summary = driver.run(&manifest).unwrap();

        assert_eq!(summary.stats.slides_failed, 1);
        assert_eq!(summary.stats.slides_processed, 1);
        assert!(summary.has_failures());
        assert_eq!(summary.failures[0].bag_name, "slide_missing.zarr");

        let store = FeatureStore::open(feat_dir.join("slide_002.zarr")).unwrap();
        assert_eq!(store.rows(), 6);
    }

    #[test]
    fn test_entries_without_bag_suffix_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("bags");
        let feat_dir = dir.path().join("features");
        std::fs::create_dir_all(&data_dir).unwrap();

        let manifest = BagManifest::from_entries(vec!["notes.txt".to_string()]);
        let config = test_config(&data_dir, &feat_dir, 8);
        let encoder = StubEncoder::new();
        let driver = SlideDriver::new(&encoder, &config).unwrap();
        let summary = driver.run(&manifest).unwrap();

        assert_eq!(summary.stats.total_slides(), 0);
        assert!(encoder.batch_sizes().is_empty());
    }
}
