use super::CaptureSource;
use anyhow::{Context, Result};
use image::RgbImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::Camera;

pub struct WebcamCapture {
    camera: Camera,
    resolution: (u32, u32),
}

impl WebcamCapture {
    /// Open camera `device_index`, asking for the fastest mode at `width x height`.
    pub fn new(device_index: u32, width: u32, height: u32) -> Result<Self> {
        tracing::info!(
            "Initializing webcam {} at {}x{}",
            device_index,
            width,
            height
        );

        let index = CameraIndex::Index(device_index);
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::HighestResolution(
            Resolution::new(width, height),
        ));

        let mut camera = Camera::new(index, requested).context("Failed to open camera")?;
        camera
            .open_stream()
            .context("Failed to open camera stream")?;

        let actual = camera.resolution();
        tracing::info!(
            "Webcam streaming at {}x{}",
            actual.width(),
            actual.height()
        );

        Ok(Self {
            camera,
            resolution: (actual.width(), actual.height()),
        })
    }
}

impl CaptureSource for WebcamCapture {
    fn capture_frame(&mut self) -> Result<RgbImage> {
        let frame = self.camera.frame().context("Failed to capture frame")?;
        let decoded = frame
            .decode_image::<RgbFormat>()
            .context("Failed to decode frame")?;

        if decoded.dimensions() != self.resolution {
            tracing::info!(
                "Camera resolution changed from {:?} to {:?}",
                self.resolution,
                decoded.dimensions()
            );
            self.resolution = decoded.dimensions();
        }
        Ok(decoded)
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }
}
