//! Slide manifest parsing.
//!
//! The manifest is a small CSV-style listing consumed once at startup: a
//! header row followed by one bag file name per line (first column). It
//! only identifies which bags to process; everything about a bag's content
//! is read from the bag itself.

use crate::core::errors::ExtractError;
use std::io::BufRead;
use std::path::Path;

/// Immutable listing of the slide bags to process.
#[derive(Debug, Clone)]
pub struct BagManifest {
    entries: Vec<String>,
}

impl BagManifest {
    /// Reads a manifest from a CSV file.
    ///
    /// The first non-empty line is treated as the header and skipped. For
    /// each following line the first comma-separated column is the bag file
    /// name; blank lines are ignored. An empty manifest (header only, or a
    /// fully blank file) is valid and yields zero slides.
    pub fn from_csv_file(path: impl AsRef<Path>) -> Result<Self, ExtractError> {
        let file = std::fs::File::open(path.as_ref())?;
        let reader = std::io::BufReader::new(file);

        let mut entries = Vec::new();
        let mut header_seen = false;
        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if !header_seen {
                header_seen = true;
                continue;
            }
            let name = trimmed.split(',').next().unwrap_or("").trim();
            if !name.is_empty() {
                entries.push(name.to_string());
            }
        }

        Ok(Self { entries })
    }

    /// Creates a manifest directly from bag names.
    pub fn from_entries(entries: Vec<String>) -> Self {
        Self { entries }
    }

    /// Returns the number of listed bags.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Checks if the manifest lists no bags.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the listed bag file names in manifest order.
    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_reads_first_column_after_header() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "slide_id,label").unwrap();
        writeln!(file, "slide_001.zarr,tumor").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "slide_002.zarr,normal").unwrap();

        let manifest = BagManifest::from_csv_file(file.path()).unwrap();
        assert_eq!(
            manifest.entries(),
            &["slide_001.zarr".to_string(), "slide_002.zarr".to_string()]
        );
    }

    #[test]
    fn test_header_only_manifest_is_empty() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "slide_id").unwrap();

        let manifest = BagManifest::from_csv_file(file.path()).unwrap();
        assert!(manifest.is_empty());
    }

    #[test]
    fn test_missing_manifest_is_an_io_error() {
        let result = BagManifest::from_csv_file("/nonexistent/manifest.csv");
        assert!(matches!(result, Err(ExtractError::Io(_))));
    }
}
