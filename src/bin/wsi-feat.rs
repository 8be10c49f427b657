//! Feature Extraction CLI
//!
//! Runs every tile bag listed in a manifest through a frozen ONNX feature
//! extractor and writes one growable feature store plus one consolidated
//! tensor artifact per slide.
//!
//! # Usage
//!
//! ```bash
//! wsi-feat --manifest slides.csv --data-dir bags/ --feat-dir features/ \
//!     --model resnet50.onnx [--slide slide_001.zarr] [--batch-size 256] \
//!     [--no-auto-skip] [--device auto]
//! ```

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use wsi_feat::core::config::{Device, ExtractionConfig, OrtSessionConfig, ParallelPolicy};
use wsi_feat::core::inference::OrtFeatureExtractor;
use wsi_feat::core::traits::FeatureEncoder;
use wsi_feat::core::init_tracing;
use wsi_feat::dataset::manifest::BagManifest;
use wsi_feat::pipeline::SlideDriver;

/// Command-line arguments for feature extraction.
#[derive(Parser)]
#[command(name = "wsi-feat")]
#[command(about = "Extract tile features from whole-slide image bags")]
struct Args {
    /// Path to the slide manifest (CSV with a header row; first column is
    /// the bag file name)
    #[arg(long)]
    manifest: PathBuf,

    /// Directory containing the tile bags
    #[arg(long)]
    data_dir: PathBuf,

    /// Destination directory for feature stores and artifacts
    #[arg(long)]
    feat_dir: PathBuf,

    /// Path to the frozen feature extractor (ONNX)
    #[arg(long)]
    model: PathBuf,

    /// Process only the bag with this exact name
    #[arg(long)]
    slide: Option<String>,

    /// Number of tiles per extractor invocation
    #[arg(long, default_value_t = 256)]
    batch_size: usize,

    /// Do not skip slides whose output already exists
    #[arg(long)]
    no_auto_skip: bool,

    /// Compute device: 'auto', 'cpu', 'cuda' or 'cuda:<id>'
    #[arg(long, default_value = "auto")]
    device: Device,

    /// Log batch progress every this many batches
    #[arg(long, default_value_t = 20)]
    log_every: usize,

    /// Number of pooled inference sessions
    #[arg(long, default_value_t = 1)]
    session_pool_size: usize,

    /// Cap the loader's normalization worker threads
    #[arg(long)]
    max_threads: Option<usize>,
}

fn main() {
    init_tracing();
    let args = Args::parse();

    // The manifest is the one input validated up front; a missing manifest
    // aborts before anything is touched.
    if !args.manifest.is_file() {
        error!("manifest '{}' does not exist", args.manifest.display());
        std::process::exit(2);
    }

    let mut parallel = if args.device.is_accelerated() {
        ParallelPolicy::for_accelerator()
    } else {
        ParallelPolicy::default()
    };
    parallel.max_threads = args.max_threads;

    let config = ExtractionConfig {
        data_dir: args.data_dir,
        feat_dir: args.feat_dir,
        slide_filter: args.slide,
        batch_size: args.batch_size,
        auto_skip: !args.no_auto_skip,
        log_every: args.log_every,
        device: args.device,
        parallel,
    };

    if let Some(threads) = config.parallel.max_threads {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
        {
            error!("failed to configure worker pool: {e}");
            std::process::exit(2);
        }
    }

    info!("initializing dataset from '{}'", args.manifest.display());
    let manifest = match BagManifest::from_csv_file(&args.manifest) {
        Ok(manifest) => manifest,
        Err(e) => {
            error!("failed to read manifest: {e}");
            std::process::exit(2);
        }
    };
    info!("{} slides listed", manifest.len());

    info!("loading model checkpoint '{}'", args.model.display());
    let session_config = OrtSessionConfig {
        session_pool_size: args.session_pool_size,
        ..OrtSessionConfig::new()
    };
    let extractor = match OrtFeatureExtractor::load(&args.model, config.device, &session_config) {
        Ok(extractor) => extractor,
        Err(e) => {
            error!("failed to load model: {e}");
            std::process::exit(2);
        }
    };
    if let Some(dim) = extractor.feature_dim() {
        info!("model '{}' ready, feature dim {}", extractor.model_name(), dim);
    } else {
        info!("model '{}' ready", extractor.model_name());
    }

    let summary = match SlideDriver::new(&extractor, &config) {
        Ok(driver) => match driver.run(&manifest) {
            Ok(summary) => summary,
            Err(e) => {
                error!("run failed: {e}");
                std::process::exit(1);
            }
        },
        Err(e) => {
            error!("invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    println!("{summary}");
    if summary.has_failures() {
        std::process::exit(1);
    }
}
