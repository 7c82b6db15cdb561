//! Face detection / embedding extraction boundary.
//!
//! The model itself is external. [`CommandExtractor`] drives it as a child
//! process: the frame goes in on stdin as PNG, a JSON array of detections
//! comes back on stdout:
//!
//! ```json
//! [{"embedding": [0.01, ...], "bbox": {"x": 10, "y": 20, "width": 80, "height": 80}}]
//! ```

use crate::frame::Frame;
use crate::source::list_images;
use chrono::Local;
use gatewatch_core::{Detection, Gallery, GalleryError, KnownIdentity};
use image::ImageFormat;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default upper bound on one extractor run.
pub const DEFAULT_EXTRACT_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),
    #[error("failed to run extractor '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("extractor exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("extractor '{program}' killed after {after:?}")]
    Timeout { program: String, after: Duration },
    #[error("malformed extractor output: {0}")]
    Output(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Turns one frame into zero or more face detections.
pub trait EmbeddingExtractor: Send {
    fn extract(&mut self, frame: &Frame) -> Result<Vec<Detection>, ExtractError>;
}

/// Runs an external program once per frame. A run that outlives `timeout`
/// is killed.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandExtractor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: DEFAULT_EXTRACT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Split a shell-style command line on whitespace: program then arguments.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_owned);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

impl EmbeddingExtractor for CommandExtractor {
    fn extract(&mut self, frame: &Frame) -> Result<Vec<Detection>, ExtractError> {
        let mut png = Vec::new();
        frame.image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExtractError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Feed stdin and drain both pipes on their own threads so a chatty
        // child can't deadlock us while we wait.
        let writer = child.stdin.take().map(|mut stdin| {
            std::thread::spawn(move || stdin.write_all(&png))
        });
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                if let Err(e) = child.kill() {
                    tracing::debug!(error = %e, "extractor exited before kill");
                }
                child.wait()?;
                tracing::warn!(program = %self.program, timeout = ?self.timeout, "extractor timed out; killed");
                return Err(ExtractError::Timeout {
                    program: self.program.clone(),
                    after: self.timeout,
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        if let Some(handle) = writer {
            if let Ok(Err(e)) = handle.join() {
                tracing::debug!(error = %e, "extractor closed stdin early");
            }
        }
        let stdout = collect(stdout)?;
        let stderr = collect(stderr)?;

        if !status.success() {
            return Err(ExtractError::Failed {
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }

        parse_detections(&stdout)
    }
}

fn drain(mut pipe: impl Read + Send + 'static) -> JoinHandle<std::io::Result<Vec<u8>>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

fn collect(reader: Option<JoinHandle<std::io::Result<Vec<u8>>>>) -> Result<Vec<u8>, ExtractError> {
    match reader.map(JoinHandle::join) {
        Some(Ok(result)) => Ok(result?),
        Some(Err(_)) => Err(ExtractError::Io(std::io::Error::other("pipe reader panicked"))),
        None => Ok(Vec::new()),
    }
}

/// Parse the extractor's JSON output. Empty output means no faces.
pub fn parse_detections(stdout: &[u8]) -> Result<Vec<Detection>, ExtractError> {
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_slice(stdout)?)
}

#[derive(Error, Debug)]
pub enum GalleryImportError {
    #[error("failed to list {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to extract {path}: {source}")]
    Extract { path: String, source: ExtractError },
    #[error(transparent)]
    Gallery(#[from] GalleryError),
}

/// Build a gallery from a directory of reference photos.
///
/// Each file stem becomes an identity name and the first detected face its
/// embedding. Photos with no face are skipped with a warning.
pub fn gallery_from_images(
    dir: &Path,
    extractor: &mut dyn EmbeddingExtractor,
    dim: usize,
) -> Result<Gallery, GalleryImportError> {
    let files = list_images(dir).map_err(|source| GalleryImportError::Io {
        path: dir.display().to_string(),
        source,
    })?;

    let mut identities = Vec::with_capacity(files.len());
    for (i, path) in files.iter().enumerate() {
        let Some(name) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };
        let image = match image::open(path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable reference image");
                continue;
            }
        };
        let frame = Frame::new(image, Local::now().naive_local(), i as u64);
        let detections = extractor
            .extract(&frame)
            .map_err(|source| GalleryImportError::Extract {
                path: path.display().to_string(),
                source,
            })?;

        match detections.into_iter().next() {
            Some(detection) => identities.push(KnownIdentity {
                name,
                embedding: detection.embedding,
            }),
            None => {
                tracing::warn!(path = %path.display(), "no face in reference image; skipping");
            }
        }
    }

    let gallery = Gallery::new(identities, dim)?;
    tracing::info!(dir = %dir.display(), identities = gallery.len(), "gallery built from images");
    Ok(gallery)
}
