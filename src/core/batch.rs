//! Batching utilities for the extraction pipeline.
//!
//! This module provides the tensor aliases used throughout the pipeline,
//! the `TileBatch` pairing of pixel tensors with tile coordinates, and a
//! sampler that splits a bag's tiles into sequential fixed-size batches.

use std::ops::Range;

/// A 2-dimensional tensor represented as a 2D array of f32 values.
pub type Tensor2D = ndarray::Array2<f32>;

/// A 3-dimensional tensor represented as a 3D array of f32 values.
pub type Tensor3D = ndarray::Array3<f32>;

/// A 4-dimensional tensor represented as a 4D array of f32 values.
pub type Tensor4D = ndarray::Array4<f32>;

/// Tile coordinates in slide space, one `(x, y)` row per tile.
pub type Coords2D = ndarray::Array2<i64>;

/// One batch of tiles ready for the extractor.
///
/// `pixels` holds normalized tiles in NCHW layout; `coords` holds the
/// matching slide-space coordinates, co-indexed row for row.
pub struct TileBatch {
    /// Normalized pixel data, shape `(batch, 3, height, width)`.
    pub pixels: Tensor4D,
    /// Tile coordinates, shape `(batch, 2)`.
    pub coords: Coords2D,
}

impl TileBatch {
    /// Returns the number of tiles in the batch.
    pub fn len(&self) -> usize {
        self.pixels.shape()[0]
    }

    /// Checks if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A sampler that splits a tile count into sequential index ranges of a
/// fixed batch size, the last range possibly shorter.
///
/// Ranges are yielded in tile order; no shuffling is performed, so batch
/// order matches on-disk tile order.
#[derive(Debug, Clone, Copy)]
pub struct BatchSampler {
    batch_size: usize,
}

impl BatchSampler {
    /// Creates a new BatchSampler with the specified batch size.
    pub fn new(batch_size: usize) -> Self {
        Self { batch_size }
    }

    /// Returns the batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Returns the number of batches needed to cover `total` tiles.
    pub fn num_batches(&self, total: usize) -> usize {
        if self.batch_size == 0 {
            0
        } else {
            total.div_ceil(self.batch_size)
        }
    }

    /// Creates an iterator over sequential index ranges covering `total` tiles.
    ///
    /// A batch size of zero yields no ranges.
    pub fn ranges(&self, total: usize) -> impl Iterator<Item = Range<usize>> {
        let batch_size = self.batch_size.max(1);
        let count = self.num_batches(total);
        (0..count).map(move |i| {
            let start = i * batch_size;
            start..(start + batch_size).min(total)
        })
    }
}
