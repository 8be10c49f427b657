//! Tile bag reading and batched loading.
//!
//! A bag is one slide's worth of pre-extracted tiles: an `imgs` array of
//! shape `(tiles, height, width, 3)` in u8 RGB and a co-indexed `coords`
//! array of shape `(tiles, 2)`. The loader walks the bag in tile order and
//! yields normalized batches; tile normalization fans out over rayon once
//! the batch is large enough to be worth it.

use crate::core::batch::{BatchSampler, Coords2D, Tensor3D, Tensor4D, TileBatch};
use crate::core::config::ParallelPolicy;
use crate::core::errors::ExtractError;
use crate::processors::normalize::{NormalizeTile, TILE_CHANNELS};
use ndarray::{Axis, Ix2, Ix4};
use rayon::prelude::*;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zarrs::array::Array;
use zarrs::array_subset::ArraySubset;
use zarrs::filesystem::FilesystemStore;

/// Node path of the tile pixel array inside a bag.
pub const IMAGES_ARRAY: &str = "/imgs";

/// Node path of the tile coordinate array inside a bag.
pub const BAG_COORDS_ARRAY: &str = "/coords";

/// File suffix of bag stores eligible for processing.
pub const BAG_SUFFIX: &str = ".zarr";

/// One slide's tile bag, opened read-only.
pub struct TileBag {
    imgs: Array<FilesystemStore>,
    coords: Array<FilesystemStore>,
    tiles: usize,
    tile_shape: (usize, usize, usize),
    path: PathBuf,
}

impl TileBag {
    /// Opens a bag and validates the shapes of its arrays.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ExtractError> {
        let path = path.as_ref();
        let store = Arc::new(FilesystemStore::new(path).map_err(|e| {
            ExtractError::store(format!("failed to open bag at '{}'", path.display()), e)
        })?);

        let imgs = Array::open(store.clone(), IMAGES_ARRAY).map_err(|e| {
            ExtractError::store(
                format!("bag '{}' has no readable tile array", path.display()),
                e,
            )
        })?;
        let coords = Array::open(store.clone(), BAG_COORDS_ARRAY).map_err(|e| {
            ExtractError::store(
                format!("bag '{}' has no readable coordinate array", path.display()),
                e,
            )
        })?;

        let img_shape = imgs.shape().to_vec();
        let coord_shape = coords.shape().to_vec();
        if img_shape.len() != 4 {
            return Err(ExtractError::invalid_input(format!(
                "bag '{}': tile array must be 4D (tiles, h, w, c), got shape {:?}",
                path.display(),
                img_shape
            )));
        }
        if img_shape[3] as usize != TILE_CHANNELS {
            return Err(ExtractError::invalid_input(format!(
                "bag '{}': expected {TILE_CHANNELS}-channel tiles, got {}",
                path.display(),
                img_shape[3]
            )));
        }
        if coord_shape.len() != 2 || coord_shape[1] != 2 {
            return Err(ExtractError::invalid_input(format!(
                "bag '{}': coordinate array must be (tiles, 2), got shape {:?}",
                path.display(),
                coord_shape
            )));
        }
        if img_shape[0] != coord_shape[0] {
            return Err(ExtractError::invalid_input(format!(
                "bag '{}': {} tiles but {} coordinate rows",
                path.display(),
                img_shape[0],
                coord_shape[0]
            )));
        }

        Ok(Self {
            imgs,
            coords,
            tiles: img_shape[0] as usize,
            tile_shape: (
                img_shape[1] as usize,
                img_shape[2] as usize,
                img_shape[3] as usize,
            ),
            path: path.to_path_buf(),
        })
    }

    /// Returns the number of tiles in the bag.
    pub fn len(&self) -> usize {
        self.tiles
    }

    /// Checks if the bag holds no tiles.
    pub fn is_empty(&self) -> bool {
        self.tiles == 0
    }

    /// Returns the `(height, width, channels)` shape of one tile.
    pub fn tile_shape(&self) -> (usize, usize, usize) {
        self.tile_shape
    }

    /// Returns the bag's location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and normalizes one batch of tiles by index range.
    ///
    /// Tiles are normalized in parallel when the batch is larger than
    /// `parallel_threshold`, sequentially otherwise.
    pub fn read_batch(
        &self,
        range: Range<usize>,
        normalize: &NormalizeTile,
        parallel_threshold: usize,
    ) -> Result<TileBatch, ExtractError> {
        let (height, width, channels) = self.tile_shape;
        let count = range.len();
        if count == 0 {
            return Ok(TileBatch {
                pixels: Tensor4D::zeros((0, TILE_CHANNELS, height, width)),
                coords: Coords2D::zeros((0, 2)),
            });
        }

        let tile_subset = ArraySubset::new_with_ranges(&[
            range.start as u64..range.end as u64,
            0..height as u64,
            0..width as u64,
            0..channels as u64,
        ]);
        let raw = self
            .imgs
            .retrieve_array_subset_ndarray::<u8>(&tile_subset)
            .map_err(|e| {
                ExtractError::store(
                    format!("failed to read tiles {:?} from '{}'", range, self.path.display()),
                    e,
                )
            })?
            .into_dimensionality::<Ix4>()
            .map_err(ExtractError::Tensor)?;

        let normalized: Vec<Tensor3D> = if count > parallel_threshold {
            (0..count)
                .into_par_iter()
                .map(|i| normalize.apply(raw.index_axis(Axis(0), i)))
                .collect::<Result<_, _>>()?
        } else {
            (0..count)
                .map(|i| normalize.apply(raw.index_axis(Axis(0), i)))
                .collect::<Result<_, _>>()?
        };
        let views: Vec<_> = normalized.iter().map(|tile| tile.view()).collect();
        let pixels = ndarray::stack(Axis(0), &views).map_err(ExtractError::Tensor)?;

        let coord_subset =
            ArraySubset::new_with_ranges(&[range.start as u64..range.end as u64, 0..2]);
        let coords = self
            .coords
            .retrieve_array_subset_ndarray::<i64>(&coord_subset)
            .map_err(|e| {
                ExtractError::store(
                    format!(
                        "failed to read coordinates {:?} from '{}'",
                        range,
                        self.path.display()
                    ),
                    e,
                )
            })?
            .into_dimensionality::<Ix2>()
            .map_err(ExtractError::Tensor)?;

        Ok(TileBatch { pixels, coords })
    }
}

/// Sequential batch iterator over one bag.
///
/// Yield order is tile order; downstream appends therefore keep the on-disk
/// arrays row-aligned with the bag.
pub struct BagLoader<'a> {
    bag: &'a TileBag,
    sampler: BatchSampler,
    normalize: &'a NormalizeTile,
    parallel_threshold: usize,
}

impl<'a> BagLoader<'a> {
    /// Creates a loader over `bag` with the given batch size and policy.
    pub fn new(
        bag: &'a TileBag,
        batch_size: usize,
        normalize: &'a NormalizeTile,
        policy: &ParallelPolicy,
    ) -> Self {
        Self {
            bag,
            sampler: BatchSampler::new(batch_size),
            normalize,
            parallel_threshold: policy.batch_threshold,
        }
    }

    /// Returns the number of batches the loader will yield.
    pub fn num_batches(&self) -> usize {
        self.sampler.num_batches(self.bag.len())
    }

    /// Iterates over the bag's batches in tile order.
    pub fn batches(&self) -> impl Iterator<Item = Result<TileBatch, ExtractError>> + '_ {
        self.sampler
            .ranges(self.bag.len())
            .map(move |range| self.bag.read_batch(range, self.normalize, self.parallel_threshold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::testutil::write_bag;
    use ndarray::{Array2, Array4};

    fn sample_bag(dir: &Path, tiles: usize) -> PathBuf {
        let path = dir.join("slide_001.zarr");
        let pixels = Array4::<u8>::from_shape_fn((tiles, 4, 4, 3), |(n, y, x, c)| {
            (n * 11 + y * 5 + x * 3 + c) as u8
        });
        let coords = Array2::<i64>::from_shape_fn((tiles, 2), |(n, i)| (n * 256 + i) as i64);
        write_bag(&path, &pixels, &coords);
        path
    }

    #[test]
    fn test_open_validates_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_bag(dir.path(), 5);

        let bag = TileBag::open(&path).unwrap();
        assert_eq!(bag.len(), 5);
        assert_eq!(bag.tile_shape(), (4, 4, 3));
    }

    #[test]
    fn test_open_missing_bag_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TileBag::open(dir.path().join("absent.zarr")).is_err());
    }

    #[test]
    fn test_loader_yields_ragged_tail_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_bag(dir.path(), 17);
        let bag = TileBag::open(&path).unwrap();
        let normalize = NormalizeTile::imagenet().unwrap();
        let policy = ParallelPolicy::default();

        let loader = BagLoader::new(&bag, 8, &normalize, &policy);
        assert_eq!(loader.num_batches(), 3);

        let batches: Vec<_> = loader
            .batches()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            batches.iter().map(TileBatch::len).collect::<Vec<_>>(),
            vec![8, 8, 1]
        );
        assert_eq!(batches[0].pixels.dim(), (8, 3, 4, 4));

        // Coordinates stay aligned with tile order across batches.
        assert_eq!(batches[0].coords[[0, 0]], 0);
        assert_eq!(batches[1].coords[[0, 0]], 8 * 256);
        assert_eq!(batches[2].coords[[0, 0]], 16 * 256);
    }

    #[test]
    fn test_read_batch_normalizes_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slide_002.zarr");
        let pixels = Array4::<u8>::from_elem((2, 2, 2, 3), 255);
        let coords = Array2::<i64>::zeros((2, 2));
        write_bag(&path, &pixels, &coords);

        let bag = TileBag::open(&path).unwrap();
        let normalize = NormalizeTile::imagenet().unwrap();
        let batch = bag.read_batch(0..2, &normalize, 0).unwrap();

        // Channel 0 of a white pixel under ImageNet statistics.
        let expected = (1.0 - 0.485) / 0.229;
        assert!((batch.pixels[[0, 0, 0, 0]] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_parallel_and_sequential_paths_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_bag(dir.path(), 9);
        let bag = TileBag::open(&path).unwrap();
        let normalize = NormalizeTile::imagenet().unwrap();

        let sequential = bag.read_batch(0..9, &normalize, usize::MAX).unwrap();
        let parallel = bag.read_batch(0..9, &normalize, 0).unwrap();
        assert_eq!(sequential.pixels, parallel.pixels);
        assert_eq!(sequential.coords, parallel.coords);
    }
}
