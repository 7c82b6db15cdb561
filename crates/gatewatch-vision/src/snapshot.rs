//! Evidence snapshots written when an alert fires.

use chrono::NaiveDateTime;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const JPEG_QUALITY: u8 = 95;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("failed to create snapshot directory {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to write snapshot {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] image::ImageError),
}

/// Persists an annotated frame and returns where it went.
pub trait SnapshotWriter: Send + Sync {
    fn write(&self, image: &RgbImage, filename: &str) -> Result<PathBuf, SnapshotError>;
}

/// Writes JPEG files into one directory.
#[derive(Debug, Clone)]
pub struct DiskSnapshotWriter {
    dir: PathBuf,
    quality: u8,
}

impl DiskSnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            quality: JPEG_QUALITY,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SnapshotWriter for DiskSnapshotWriter {
    fn write(&self, image: &RgbImage, filename: &str) -> Result<PathBuf, SnapshotError> {
        // `filename` may carry a per-stream subdirectory.
        let path = self.dir.join(filename);
        let parent = path.parent().unwrap_or(&self.dir);
        std::fs::create_dir_all(parent).map_err(|source| SnapshotError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;

        let file = File::create(&path).map_err(|source| SnapshotError::Write {
            path: path.display().to_string(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        JpegEncoder::new_with_quality(&mut writer, self.quality).encode_image(image)?;
        writer.flush().map_err(|source| SnapshotError::Write {
            path: path.display().to_string(),
            source,
        })?;

        tracing::debug!(path = %path.display(), "snapshot written");
        Ok(path)
    }
}

/// `<label>_<YYYYmmdd_HHMMSS>_<sequence>.jpg`. The frame sequence keeps two
/// alerts in the same second apart.
pub fn snapshot_filename(label: &str, at: NaiveDateTime, sequence: u64) -> String {
    format!("{label}_{}_{sequence}.jpg", at.format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use image::Rgb;

    #[test]
    fn test_snapshot_filename() {
        let at = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(9, 3, 7)
            .unwrap();
        assert_eq!(snapshot_filename("Unknown_2", at, 41), "Unknown_2_20240501_090307_41.jpg");
    }

    #[test]
    fn test_writes_jpeg_and_creates_dir() {
        let root = tempfile::tempdir().unwrap();
        let writer = DiskSnapshotWriter::new(root.path().join("snapshots"));
        let image = RgbImage::from_pixel(8, 8, Rgb([10, 200, 30]));

        let path = writer.write(&image, "Unknown_1_x.jpg").unwrap();
        assert_eq!(path, root.path().join("snapshots/Unknown_1_x.jpg"));
        let decoded = image::open(&path).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 8));
    }

    #[test]
    fn test_nested_filename_creates_subdir() {
        let root = tempfile::tempdir().unwrap();
        let writer = DiskSnapshotWriter::new(root.path());
        let image = RgbImage::new(4, 4);

        let path = writer.write(&image, "lobby/Unknown_1_x.jpg").unwrap();
        assert!(path.exists());
        assert_eq!(path.parent().unwrap(), root.path().join("lobby"));
    }
}
