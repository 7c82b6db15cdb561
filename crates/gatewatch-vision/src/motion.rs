//! Frame-to-frame motion gate.
//!
//! Cheap test that decides whether the expensive embedding step runs. Each
//! frame is reduced to a blurred grayscale image and compared pixel by pixel
//! against the previous one.

use crate::frame::{Frame, FrameError};
use image::GrayImage;

/// Gaussian sigma roughly equivalent to a 21x21 kernel.
pub const DEFAULT_BLUR_SIGMA: f32 = 3.5;
/// Per-pixel absolute difference above which a pixel counts as changed.
pub const DEFAULT_PIXEL_THRESHOLD: u8 = 25;
/// Changed pixels needed to report motion.
pub const DEFAULT_MIN_CHANGED_PIXELS: usize = 1;

/// Stateful motion detector, one instance per stream.
#[derive(Debug)]
pub struct MotionGate {
    previous: Option<GrayImage>,
    blur_sigma: f32,
    pixel_threshold: u8,
    min_changed_pixels: usize,
}

impl Default for MotionGate {
    fn default() -> Self {
        Self::new(DEFAULT_PIXEL_THRESHOLD, DEFAULT_MIN_CHANGED_PIXELS)
    }
}

impl MotionGate {
    pub fn new(pixel_threshold: u8, min_changed_pixels: usize) -> Self {
        Self {
            previous: None,
            blur_sigma: DEFAULT_BLUR_SIGMA,
            pixel_threshold,
            min_changed_pixels: min_changed_pixels.max(1),
        }
    }

    pub fn with_blur_sigma(mut self, sigma: f32) -> Self {
        self.blur_sigma = sigma;
        self
    }

    /// Compare `frame` against the stored baseline and replace the baseline.
    ///
    /// The first frame (or the first after a resolution change) only seeds the
    /// baseline and reports no motion. The baseline is replaced on every
    /// successful call whatever the outcome. An empty frame is an error and
    /// leaves the baseline untouched.
    pub fn detect(&mut self, frame: &Frame) -> Result<bool, FrameError> {
        if frame.is_empty() {
            return Err(FrameError::Empty);
        }

        let current = frame.blurred_gray(self.blur_sigma);
        let changed = match &self.previous {
            Some(prev) if prev.dimensions() == current.dimensions() => {
                Some(count_changed(prev, &current, self.pixel_threshold))
            }
            Some(prev) => {
                tracing::debug!(
                    from = ?prev.dimensions(),
                    to = ?current.dimensions(),
                    "frame size changed; reseeding motion baseline"
                );
                None
            }
            None => None,
        };
        self.previous = Some(current);

        Ok(match changed {
            Some(n) => {
                tracing::trace!(changed = n, sequence = frame.sequence, "motion check");
                n >= self.min_changed_pixels
            }
            None => false,
        })
    }

    /// Forget the baseline; the next frame seeds it again.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub fn is_seeded(&self) -> bool {
        self.previous.is_some()
    }
}

/// Number of pixels whose absolute difference exceeds `threshold`.
fn count_changed(a: &GrayImage, b: &GrayImage, threshold: u8) -> usize {
    a.as_raw()
        .iter()
        .zip(b.as_raw().iter())
        .filter(|(&p, &q)| p.abs_diff(q) > threshold)
        .count()
}
