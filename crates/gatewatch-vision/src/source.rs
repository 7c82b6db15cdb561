//! Frame sources.
//!
//! Anything that can hand over RGB frames implements [`FrameSource`].
//! [`DirectorySource`] replays a directory of still images, which is also how
//! recorded clips are fed in. Live V4L2 capture is in [`crate::camera`].

use crate::frame::Frame;
use chrono::Local;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    /// The frame could not be read this tick. The caller retries later.
    #[error("frame unavailable: {0}")]
    Unavailable(String),
    /// The source cannot be opened at all.
    #[error("source not found: {0}")]
    NotFound(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Unavailable(_))
    }
}

/// Producer of frames for one stream.
pub trait FrameSource: Send {
    /// Next frame in arrival order. `Ok(None)` means the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "webp", "tiff"];

/// Replays image files from a directory in lexicographic filename order.
pub struct DirectorySource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    cursor: usize,
    sequence: u64,
}

impl DirectorySource {
    pub fn open(dir: &Path) -> Result<Self, SourceError> {
        if !dir.is_dir() {
            return Err(SourceError::NotFound(dir.display().to_string()));
        }
        let files = list_images(dir)?;
        tracing::info!(dir = %dir.display(), frames = files.len(), "directory source opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            files,
            cursor: 0,
            sequence: 0,
        })
    }

    pub fn remaining(&self) -> usize {
        self.files.len() - self.cursor
    }
}

impl FrameSource for DirectorySource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(path) = self.files.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;

        let image = image::open(path)
            .map_err(|e| SourceError::Unavailable(format!("{}: {e}", path.display())))?
            .to_rgb8();
        let frame = Frame::new(image, Local::now().naive_local(), self.sequence);
        self.sequence += 1;
        Ok(Some(frame))
    }

    fn describe(&self) -> String {
        format!("dir:{}", self.dir.display())
    }
}

/// Image files directly inside `dir`, sorted by path.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_image(path))
        .collect();
    files.sort();
    Ok(files)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_replays_in_filename_order() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(4, 4, Rgb([255, 0, 0]))
            .save(dir.path().join("b.png"))
            .unwrap();
        RgbImage::from_pixel(4, 4, Rgb([0, 0, 255]))
            .save(dir.path().join("a.png"))
            .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut source = DirectorySource::open(dir.path()).unwrap();
        assert_eq!(source.remaining(), 2);

        let first = source.next_frame().unwrap().unwrap();
        assert_eq!(first.image.get_pixel(0, 0), &Rgb([0, 0, 255]));
        assert_eq!(first.sequence, 0);
        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(second.sequence, 1);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.jpg"), b"not a jpeg").unwrap();
        RgbImage::new(2, 2).save(dir.path().join("ok.png")).unwrap();

        let mut source = DirectorySource::open(dir.path()).unwrap();
        let err = source.next_frame().unwrap_err();
        assert!(err.is_transient());
        // Source keeps going after a bad frame.
        assert!(source.next_frame().unwrap().is_some());
    }

    #[test]
    fn test_missing_directory() {
        let result = DirectorySource::open(Path::new("/nonexistent/gatewatch-frames"));
        assert!(matches!(result, Err(SourceError::NotFound(_))));
    }
}
