//! gatewatch-vision — Frame handling around the recognition pipeline.
//!
//! Provides the frame type, the motion gate that decides when recognition
//! runs, V4L2 capture, and the boundaries to the external embedding
//! extractor and snapshot storage.

pub mod camera;
pub mod extractor;
pub mod frame;
pub mod motion;
pub mod snapshot;
pub mod source;

pub use camera::V4l2Source;
pub use extractor::{
    gallery_from_images, parse_detections, CommandExtractor, EmbeddingExtractor, ExtractError,
    GalleryImportError, DEFAULT_EXTRACT_TIMEOUT,
};
pub use frame::{Frame, FrameError};
pub use motion::MotionGate;
pub use snapshot::{snapshot_filename, DiskSnapshotWriter, SnapshotError, SnapshotWriter};
pub use source::{DirectorySource, FrameSource, SourceError};
