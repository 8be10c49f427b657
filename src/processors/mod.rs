//! Tile processing utilities.

pub mod normalize;

pub use normalize::{NormalizeTile, TILE_CHANNELS};
