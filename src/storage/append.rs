//! Incremental writer for the per-slide growable feature store.
//!
//! Each slide's output is a chunked array hierarchy with two named arrays,
//! `features` (N x feature_dim, f32) and `coords` (N x 2, i64), whose
//! leading dimension grows as batches are appended. Chunks are one row
//! along the growing dimension times the batch's remaining dimensions, so
//! every append writes whole chunks at the tail.
//!
//! Growing works by re-emitting the array metadata with the enlarged
//! leading dimension and then writing only the new tail rows; the chunk
//! grid, data type and fill value never change, so chunks written by
//! earlier appends remain valid. The store handle is held open for the
//! whole slide and released on drop on every exit path.

use crate::core::errors::ExtractError;
use ndarray::{Array2, ArrayView2, Ix2};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zarrs::array::{Array, ArrayBuilder, ChunkShape, DataType, FillValue};
use zarrs::filesystem::FilesystemStore;
use zarrs::group::GroupBuilder;

/// Node path of the per-tile feature vectors array.
pub const FEATURES_ARRAY: &str = "/features";

/// Node path of the per-tile coordinates array.
pub const COORDS_ARRAY: &str = "/coords";

/// Growable on-disk store for one slide's features and coordinates.
///
/// Invariant: `features` and `coords` hold the same number of rows after
/// every append; a batch with mismatched row counts is rejected before any
/// write happens.
pub struct FeatureStore {
    store: Arc<FilesystemStore>,
    path: PathBuf,
    rows: u64,
    feature_dim: Option<u64>,
    coord_dim: Option<u64>,
}

impl FeatureStore {
    /// Creates a fresh store at `path`, truncating any prior content.
    ///
    /// Called on the first batch of a slide; a rerun with skipping disabled
    /// therefore replaces stale data instead of extending it.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, ExtractError> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        std::fs::create_dir_all(path)?;

        let store = Arc::new(
            FilesystemStore::new(path)
                .map_err(|e| ExtractError::store(format!("failed to create store at '{}'", path.display()), e))?,
        );
        GroupBuilder::new()
            .build(store.clone(), "/")
            .map_err(|e| ExtractError::store("failed to define root group", e))?
            .store_metadata()
            .map_err(|e| ExtractError::store("failed to write root group metadata", e))?;

        Ok(Self {
            store,
            path: path.to_path_buf(),
            rows: 0,
            feature_dim: None,
            coord_dim: None,
        })
    }

    /// Opens a finalized store read-only and loads its row bookkeeping.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ExtractError> {
        let path = path.as_ref();
        let store = Arc::new(
            FilesystemStore::new(path)
                .map_err(|e| ExtractError::store(format!("failed to open store at '{}'", path.display()), e))?,
        );

        let features = Self::open_array(&store, FEATURES_ARRAY)?;
        let coords = Self::open_array(&store, COORDS_ARRAY)?;
        let feature_shape = features.shape().to_vec();
        let coord_shape = coords.shape().to_vec();
        if feature_shape.first() != coord_shape.first() {
            return Err(ExtractError::invalid_input(format!(
                "store at '{}' has misaligned fields: {} feature rows vs {} coord rows",
                path.display(),
                feature_shape.first().copied().unwrap_or(0),
                coord_shape.first().copied().unwrap_or(0),
            )));
        }

        Ok(Self {
            store,
            path: path.to_path_buf(),
            rows: feature_shape.first().copied().unwrap_or(0),
            feature_dim: feature_shape.get(1).copied(),
            coord_dim: coord_shape.get(1).copied(),
        })
    }

    /// Appends one co-indexed batch of feature vectors and coordinates.
    ///
    /// On the first append each array is created shaped exactly as the
    /// batch with an unlimited-growth leading dimension; later appends
    /// extend the leading dimension by the batch's row count and write the
    /// batch into the newly added trailing rows.
    pub fn append(
        &mut self,
        features: ArrayView2<'_, f32>,
        coords: ArrayView2<'_, i64>,
    ) -> Result<(), ExtractError> {
        let (feature_rows, feature_dim) = features.dim();
        let (coord_rows, coord_dim) = coords.dim();
        if feature_rows != coord_rows {
            return Err(ExtractError::invalid_input(format!(
                "feature batch has {feature_rows} rows but coordinate batch has {coord_rows}"
            )));
        }
        if feature_rows == 0 {
            return Ok(());
        }
        Self::check_width("features", self.feature_dim, feature_dim as u64)?;
        Self::check_width("coords", self.coord_dim, coord_dim as u64)?;

        self.grow_f32(FEATURES_ARRAY, features)?;
        self.grow_i64(COORDS_ARRAY, coords)?;

        self.feature_dim = Some(feature_dim as u64);
        self.coord_dim = Some(coord_dim as u64);
        self.rows += feature_rows as u64;
        Ok(())
    }

    /// Returns the number of rows appended so far (equal in both arrays).
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Returns the store's location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the full `features` array.
    pub fn read_features(&self) -> Result<Array2<f32>, ExtractError> {
        let array = Self::open_array(&self.store, FEATURES_ARRAY)?;
        let data = array
            .retrieve_array_subset_ndarray::<f32>(&array.subset_all())
            .map_err(|e| ExtractError::store("failed to read features", e))?;
        data.into_dimensionality::<Ix2>().map_err(ExtractError::Tensor)
    }

    /// Reads the full `coords` array.
    pub fn read_coords(&self) -> Result<Array2<i64>, ExtractError> {
        let array = Self::open_array(&self.store, COORDS_ARRAY)?;
        let data = array
            .retrieve_array_subset_ndarray::<i64>(&array.subset_all())
            .map_err(|e| ExtractError::store("failed to read coords", e))?;
        data.into_dimensionality::<Ix2>().map_err(ExtractError::Tensor)
    }

    fn open_array(
        store: &Arc<FilesystemStore>,
        node: &str,
    ) -> Result<Array<FilesystemStore>, ExtractError> {
        Array::open(store.clone(), node)
            .map_err(|e| ExtractError::store(format!("failed to open array '{node}'"), e))
    }

    fn check_width(field: &str, established: Option<u64>, width: u64) -> Result<(), ExtractError> {
        if width == 0 {
            return Err(ExtractError::invalid_input(format!(
                "{field} batch has zero-width rows"
            )));
        }
        if let Some(expected) = established {
            if expected != width {
                return Err(ExtractError::invalid_input(format!(
                    "{field} batch width {width} does not match established width {expected}"
                )));
            }
        }
        Ok(())
    }

    fn row_chunk(width: u64) -> Result<ChunkShape, ExtractError> {
        vec![1, width].try_into().map_err(|_| {
            ExtractError::invalid_input(format!("invalid chunk width {width}"))
        })
    }

    fn grow_f32(&self, node: &str, rows: ArrayView2<'_, f32>) -> Result<(), ExtractError> {
        let (n, width) = rows.dim();
        let array = ArrayBuilder::new(
            vec![self.rows + n as u64, width as u64],
            DataType::Float32,
            Self::row_chunk(width as u64)?,
            FillValue::from(0.0f32),
        )
        .dimension_names(["tile", "feature"].into())
        .build(self.store.clone(), node)
        .map_err(|e| ExtractError::store(format!("failed to define array '{node}'"), e))?;
        array
            .store_metadata()
            .map_err(|e| ExtractError::store(format!("failed to grow array '{node}'"), e))?;
        array
            .store_array_subset_ndarray(&[self.rows, 0], rows.to_owned())
            .map_err(|e| ExtractError::store(format!("failed to append to array '{node}'"), e))
    }

    fn grow_i64(&self, node: &str, rows: ArrayView2<'_, i64>) -> Result<(), ExtractError> {
        let (n, width) = rows.dim();
        let array = ArrayBuilder::new(
            vec![self.rows + n as u64, width as u64],
            DataType::Int64,
            Self::row_chunk(width as u64)?,
            FillValue::from(0i64),
        )
        .dimension_names(["tile", "coord"].into())
        .build(self.store.clone(), node)
        .map_err(|e| ExtractError::store(format!("failed to define array '{node}'"), e))?;
        array
            .store_metadata()
            .map_err(|e| ExtractError::store(format!("failed to grow array '{node}'"), e))?;
        array
            .store_array_subset_ndarray(&[self.rows, 0], rows.to_owned())
            .map_err(|e| ExtractError::store(format!("failed to append to array '{node}'"), e))
    }
}
