//! Colour frames plus the grayscale and annotation helpers the pipeline needs.

use chrono::NaiveDateTime;
use gatewatch_core::BoundingBox;
use image::{GrayImage, Rgb, RgbImage};

/// Box outline colour used when annotating detections.
pub const ANNOTATION_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const ANNOTATION_THICKNESS: u32 = 2;

/// A captured colour frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    /// Local wall-clock time the frame was captured.
    pub captured_at: NaiveDateTime,
    pub sequence: u64,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at: NaiveDateTime, sequence: u64) -> Self {
        Self {
            image,
            captured_at,
            sequence,
        }
    }

    /// Build a frame from packed RGB8 bytes.
    pub fn from_rgb(
        data: Vec<u8>,
        width: u32,
        height: u32,
        captured_at: NaiveDateTime,
        sequence: u64,
    ) -> Result<Self, FrameError> {
        let expected = (width as usize) * (height as usize) * 3;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        let image = RgbImage::from_raw(width, height, data).ok_or(FrameError::InvalidLength {
            expected,
            actual: 0,
        })?;
        Ok(Self::new(image, captured_at, sequence))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Grayscale copy smoothed with a Gaussian of the given sigma.
    pub fn blurred_gray(&self, sigma: f32) -> GrayImage {
        let gray = image::imageops::grayscale(&self.image);
        if sigma > 0.0 {
            image::imageops::blur(&gray, sigma)
        } else {
            gray
        }
    }

    /// Copy of the frame with a box outline drawn around every detection.
    pub fn annotated<'a>(&self, boxes: impl IntoIterator<Item = &'a BoundingBox>) -> RgbImage {
        let mut out = self.image.clone();
        for bbox in boxes {
            draw_box(&mut out, bbox, ANNOTATION_COLOR, ANNOTATION_THICKNESS);
        }
        out
    }
}

/// Draw a rectangle outline, clipped to the image bounds.
pub fn draw_box(image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>, thickness: u32) {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 || bbox.width <= 0.0 || bbox.height <= 0.0 {
        return;
    }

    let clamp_x = |v: f32| (v.round().max(0.0) as u32).min(w - 1);
    let clamp_y = |v: f32| (v.round().max(0.0) as u32).min(h - 1);
    let x0 = clamp_x(bbox.x);
    let y0 = clamp_y(bbox.y);
    let x1 = clamp_x(bbox.x + bbox.width - 1.0);
    let y1 = clamp_y(bbox.y + bbox.height - 1.0);

    for t in 0..thickness {
        for x in x0..=x1 {
            if y0 + t <= y1 {
                image.put_pixel(x, y0 + t, color);
            }
            if y1 >= y0 + t {
                image.put_pixel(x, y1 - t, color);
            }
        }
        for y in y0..=y1 {
            if x0 + t <= x1 {
                image.put_pixel(x0 + t, y, color);
            }
            if x1 >= x0 + t {
                image.put_pixel(x1 - t, y, color);
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("frame has zero width or height")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_from_rgb_valid() {
        let frame = Frame::from_rgb(vec![0; 4 * 2 * 3], 4, 2, ts(), 0).unwrap();
        assert_eq!((frame.width(), frame.height()), (4, 2));
    }

    #[test]
    fn test_from_rgb_invalid_length() {
        let result = Frame::from_rgb(vec![0; 10], 4, 2, ts(), 0);
        assert!(matches!(
            result,
            Err(FrameError::InvalidLength { expected: 24, actual: 10 })
        ));
    }

    #[test]
    fn test_blurred_gray_uniform_stays_uniform() {
        let frame = Frame::new(RgbImage::from_pixel(16, 16, Rgb([100, 100, 100])), ts(), 0);
        let gray = frame.blurred_gray(3.5);
        assert_eq!(gray.dimensions(), (16, 16));
        assert!(gray.pixels().all(|p| p.0[0].abs_diff(100) <= 1));
    }

    #[test]
    fn test_annotated_draws_outline_only() {
        let frame = Frame::new(RgbImage::new(20, 20), ts(), 0);
        let bbox = BoundingBox { x: 5.0, y: 5.0, width: 10.0, height: 10.0 };
        let out = frame.annotated([&bbox]);
        assert_eq!(out.get_pixel(5, 5), &ANNOTATION_COLOR);
        assert_eq!(out.get_pixel(14, 14), &ANNOTATION_COLOR);
        assert_eq!(out.get_pixel(10, 10), &Rgb([0, 0, 0]));
        // Source frame untouched.
        assert_eq!(frame.image.get_pixel(5, 5), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_draw_box_clips_to_bounds() {
        let mut img = RgbImage::new(8, 8);
        let bbox = BoundingBox { x: -4.0, y: 6.0, width: 50.0, height: 50.0 };
        draw_box(&mut img, &bbox, ANNOTATION_COLOR, 2);
        assert_eq!(img.get_pixel(0, 7), &ANNOTATION_COLOR);
    }
}
