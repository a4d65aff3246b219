mod v4l_capture;

pub use v4l_capture::WebcamCapture;

use anyhow::Result;
use image::RgbImage;

/// Trait for camera capture sources
///
/// Frame size may change between calls; the pipeline picks that up per frame.
pub trait CaptureSource {
    /// Capture a single frame
    fn capture_frame(&mut self) -> Result<RgbImage>;

    /// Size of the most recent frame, or the requested size before the first one
    fn resolution(&self) -> (u32, u32);
}
