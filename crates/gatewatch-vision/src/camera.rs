//! Live V4L2 capture via the `v4l` crate.

use crate::frame::Frame;
use crate::source::{FrameSource, SourceError};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::time::Duration;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Requested capture size. Drivers may negotiate something else.
const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const BUFFER_COUNT: u32 = 4;
/// How long a dequeue may block before the tick counts as unavailable.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Negotiated pixel layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, two pixels per four bytes.
    Yuyv,
    /// Packed RGB8.
    Rgb3,
    /// 8-bit grayscale.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"RGB3" => Some(Self::Rgb3),
            b"GREY" => Some(Self::Grey),
            _ => None,
        }
    }
}

struct Session {
    stream: MmapStream<'static>,
    width: u32,
    height: u32,
    format: PixelFormat,
    // Keeps the file descriptor alive for the stream.
    _device: Device,
}

/// Frames from a V4L2 capture device such as `/dev/video0`.
///
/// The device is opened lazily. When opening or dequeuing fails the session
/// is dropped and the tick reports [`SourceError::Unavailable`]; the next call
/// reopens the device, so an unplugged camera recovers on its own.
pub struct V4l2Source {
    path: PathBuf,
    session: Option<Session>,
    sequence: u64,
}

impl V4l2Source {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            session: None,
            sequence: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    fn open(&self) -> Result<Session, SourceError> {
        if !self.path.exists() {
            return Err(SourceError::Unavailable(format!(
                "{}: device not present",
                self.path.display()
            )));
        }
        let unavailable =
            |what: &str, e: std::io::Error| SourceError::Unavailable(format!("{}: {what}: {e}", self.path.display()));

        let device = Device::with_path(&self.path).map_err(|e| unavailable("open failed", e))?;
        let caps = device.query_caps().map_err(|e| unavailable("failed to query capabilities", e))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(SourceError::NotFound(format!(
                "{}: not a video capture device",
                self.path.display()
            )));
        }

        let mut fmt = device.format().map_err(|e| unavailable("failed to get format", e))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;
        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| unavailable("failed to set format", e))?;
        let format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            SourceError::NotFound(format!(
                "{}: unsupported pixel format {:?} (need YUYV, RGB3 or GREY)",
                self.path.display(),
                negotiated.fourcc
            ))
        })?;

        let mut stream = MmapStream::with_buffers(&device, BufType::VideoCapture, BUFFER_COUNT)
            .map_err(|e| unavailable("failed to create mmap stream", e))?;
        stream.set_timeout(DEQUEUE_TIMEOUT);

        tracing::info!(
            device = %self.path.display(),
            driver = %caps.driver,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "camera opened"
        );

        Ok(Session {
            stream,
            width: negotiated.width,
            height: negotiated.height,
            format,
            _device: device,
        })
    }
}

impl FrameSource for V4l2Source {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.session.is_none() {
            self.session = Some(self.open()?);
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(None);
        };

        let (width, height, format) = (session.width, session.height, session.format);
        let captured = session
            .stream
            .next()
            .map_err(|e| e.to_string())
            .and_then(|(buf, _meta)| to_rgb(buf, width, height, format));
        let rgb = match captured {
            Ok(rgb) => rgb,
            Err(reason) => {
                tracing::warn!(device = %self.path.display(), error = %reason, "capture failed; closing device");
                self.session = None;
                return Err(SourceError::Unavailable(format!("{}: {reason}", self.path.display())));
            }
        };

        let frame = Frame::from_rgb(rgb, width, height, Local::now().naive_local(), self.sequence)
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;
        self.sequence += 1;
        Ok(Some(frame))
    }

    fn describe(&self) -> String {
        format!("v4l2:{}", self.path.display())
    }
}

/// Convert one raw buffer to packed RGB8.
pub fn to_rgb(buf: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<Vec<u8>, String> {
    let pixels = (width as usize) * (height as usize);
    match format {
        PixelFormat::Rgb3 => {
            let expected = pixels * 3;
            if buf.len() < expected {
                return Err(format!("RGB3 buffer too short: expected {expected}, got {}", buf.len()));
            }
            Ok(buf[..expected].to_vec())
        }
        PixelFormat::Grey => {
            if buf.len() < pixels {
                return Err(format!("GREY buffer too short: expected {pixels}, got {}", buf.len()));
            }
            Ok(buf[..pixels].iter().flat_map(|&y| [y, y, y]).collect())
        }
        PixelFormat::Yuyv => yuyv_to_rgb(buf, width, height),
    }
}

/// BT.601 YUYV 4:2:2 to packed RGB8.
pub fn yuyv_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, String> {
    let pixels = (width as usize) * (height as usize);
    if pixels % 2 != 0 {
        return Err(format!("YUYV needs an even pixel count, got {width}x{height}"));
    }
    let expected = pixels * 2;
    if buf.len() < expected {
        return Err(format!("YUYV buffer too short: expected {expected}, got {}", buf.len()));
    }

    let mut rgb = Vec::with_capacity(pixels * 3);
    for chunk in buf[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_pixel(y0, u, v));
        rgb.extend_from_slice(&yuv_pixel(y1, u, v));
    }
    Ok(rgb)
}

fn yuv_pixel(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    let clamp = |c: f32| c.round().clamp(0.0, 255.0) as u8;
    [
        clamp(y + 1.402 * v),
        clamp(y - 0.344_136 * u - 0.714_136 * v),
        clamp(y + 1.772 * u),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_neutral_chroma_is_gray() {
        let rgb = yuyv_to_rgb(&[16, 128, 235, 128], 2, 1).unwrap();
        assert_eq!(rgb, vec![16, 16, 16, 235, 235, 235]);
    }

    #[test]
    fn test_yuyv_red_chroma() {
        let rgb = yuyv_to_rgb(&[128, 128, 128, 255], 2, 1).unwrap();
        // Strong V pushes red up and green down.
        assert_eq!(rgb[0], 255);
        assert!(rgb[1] < 128);
        assert_eq!(rgb[2], 128);
    }

    #[test]
    fn test_short_buffers_rejected() {
        assert!(yuyv_to_rgb(&[0; 3], 2, 1).is_err());
        assert!(to_rgb(&[0; 5], 2, 1, PixelFormat::Rgb3).is_err());
        assert!(to_rgb(&[0; 1], 2, 1, PixelFormat::Grey).is_err());
    }

    #[test]
    fn test_grey_expands_to_rgb() {
        let rgb = to_rgb(&[7, 200], 2, 1, PixelFormat::Grey).unwrap();
        assert_eq!(rgb, vec![7, 7, 7, 200, 200, 200]);
        let frame = Frame::from_rgb(rgb, 2, 1, Local::now().naive_local(), 0).unwrap();
        assert_eq!(frame.width(), 2);
    }

    #[test]
    fn test_fourcc_mapping() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), None);
    }

    #[test]
    fn test_missing_device_is_transient_and_retried() {
        let mut source = V4l2Source::new("/dev/gatewatch-no-such-video");
        let err = source.next_frame().unwrap_err();
        assert!(err.is_transient());
        assert!(!source.is_open());
        // Each tick tries again rather than giving up.
        assert!(source.next_frame().unwrap_err().is_transient());
        assert_eq!(source.describe(), "v4l2:/dev/gatewatch-no-such-video");
    }
}
