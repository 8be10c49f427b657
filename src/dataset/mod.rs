//! Dataset discovery and tile bag loading.

pub mod bag;
pub mod manifest;

pub use bag::{BagLoader, TileBag, BAG_COORDS_ARRAY, BAG_SUFFIX, IMAGES_ARRAY};
pub use manifest::BagManifest;

#[cfg(test)]
pub(crate) mod testutil {
    use ndarray::{Array2, Array4};
    use std::path::Path;
    use std::sync::Arc;
    use zarrs::array::{ArrayBuilder, DataType, FillValue};
    use zarrs::filesystem::FilesystemStore;
    use zarrs::group::GroupBuilder;

    /// Writes a tile bag fixture with the given pixels and coordinates.
    pub(crate) fn write_bag(path: &Path, tiles: &Array4<u8>, coords: &Array2<i64>) {
        std::fs::create_dir_all(path).unwrap();
        let store = Arc::new(FilesystemStore::new(path).unwrap());
        GroupBuilder::new()
            .build(store.clone(), "/")
            .unwrap()
            .store_metadata()
            .unwrap();

        let (n, h, w, c) = tiles.dim();
        let imgs = ArrayBuilder::new(
            vec![n as u64, h as u64, w as u64, c as u64],
            DataType::UInt8,
            vec![(n as u64).max(1), h as u64, w as u64, c as u64]
                .try_into()
                .unwrap(),
            FillValue::from(0u8),
        )
        .build(store.clone(), super::IMAGES_ARRAY)
        .unwrap();
        imgs.store_metadata().unwrap();
        if n > 0 {
            imgs.store_array_subset_ndarray(&[0, 0, 0, 0], tiles.clone())
                .unwrap();
        }

        let coord_rows = coords.nrows();
        let coord_array = ArrayBuilder::new(
            vec![coord_rows as u64, 2],
            DataType::Int64,
            vec![(coord_rows as u64).max(1), 2].try_into().unwrap(),
            FillValue::from(0i64),
        )
        .build(store.clone(), super::BAG_COORDS_ARRAY)
        .unwrap();
        coord_array.store_metadata().unwrap();
        if coord_rows > 0 {
            coord_array
                .store_array_subset_ndarray(&[0, 0], coords.clone())
                .unwrap();
        }
    }
}
