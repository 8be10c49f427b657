//! Tile normalization for the frozen extractor.
//!
//! Tiles arrive as 8-bit RGB in HWC layout and leave as f32 CHW tensors
//! normalized with per-channel mean and standard deviation. The scale and
//! std are folded into a single multiply-add per pixel (alpha = scale / std,
//! beta = -mean / std).

use crate::core::batch::Tensor3D;
use crate::core::errors::ExtractError;
use ndarray::ArrayView3;

/// Number of color channels expected in a tile.
pub const TILE_CHANNELS: usize = 3;

/// Normalizes 8-bit RGB tiles into CHW f32 tensors.
#[derive(Debug, Clone)]
pub struct NormalizeTile {
    /// Scaling factors for each channel (alpha = scale / std).
    alpha: [f32; TILE_CHANNELS],
    /// Offset values for each channel (beta = -mean / std).
    beta: [f32; TILE_CHANNELS],
}

impl NormalizeTile {
    /// Creates a new NormalizeTile with the specified parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if scale is not greater than 0 or any standard
    /// deviation value is not greater than 0.
    pub fn new(
        scale: f32,
        mean: [f32; TILE_CHANNELS],
        std: [f32; TILE_CHANNELS],
    ) -> Result<Self, ExtractError> {
        if scale <= 0.0 {
            return Err(ExtractError::config_error(
                "normalization scale must be greater than 0",
            ));
        }
        for (i, &s) in std.iter().enumerate() {
            if s <= 0.0 {
                return Err(ExtractError::config_error(format!(
                    "standard deviation at index {i} must be greater than 0, got {s}"
                )));
            }
        }

        let mut alpha = [0.0; TILE_CHANNELS];
        let mut beta = [0.0; TILE_CHANNELS];
        for ch in 0..TILE_CHANNELS {
            alpha[ch] = scale / std[ch];
            beta[ch] = -mean[ch] / std[ch];
        }
        Ok(Self { alpha, beta })
    }

    /// Creates a NormalizeTile with ImageNet statistics, matching the
    /// preprocessing the extractor was trained with.
    pub fn imagenet() -> Result<Self, ExtractError> {
        Self::new(
            1.0 / 255.0,
            [0.485, 0.456, 0.406],
            [0.229, 0.224, 0.225],
        )
    }

    /// Normalizes one HWC u8 tile into a CHW f32 tensor.
    ///
    /// # Errors
    ///
    /// Returns an error if the tile does not have exactly
    /// [`TILE_CHANNELS`] channels.
    pub fn apply(&self, tile: ArrayView3<'_, u8>) -> Result<Tensor3D, ExtractError> {
        let (height, width, channels) = tile.dim();
        if channels != TILE_CHANNELS {
            return Err(ExtractError::invalid_input(format!(
                "expected {TILE_CHANNELS}-channel tile, got {channels} channels"
            )));
        }

        let mut out = Tensor3D::zeros((TILE_CHANNELS, height, width));
        for ch in 0..TILE_CHANNELS {
            let alpha = self.alpha[ch];
            let beta = self.beta[ch];
            for y in 0..height {
                for x in 0..width {
                    out[[ch, y, x]] = f32::from(tile[[y, x, ch]]) * alpha + beta;
                }
            }
        }
        Ok(out)
    }
}
