use super::OutputSink;
use anyhow::{Context, Result};
use image::{imageops, RgbaImage};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use v4l::video::Output;
use v4l::{Device, Format, FourCC};

/// Writes frames as YUYV to a v4l2loopback device.
///
/// Alpha is dropped, so layered output shows the bare foreground colour.
pub struct V4L2Output {
    file: File,
    width: u32,
    height: u32,
}

impl V4L2Output {
    pub fn new<P: AsRef<Path>>(device_path: P, width: u32, height: u32) -> Result<Self> {
        let path = device_path.as_ref();
        tracing::info!(
            "Opening v4l2loopback device at {} ({}x{})",
            path.display(),
            width,
            height
        );

        let device = Device::with_path(path)
            .with_context(|| format!("Failed to open v4l2loopback device at {}", path.display()))?;
        let format = Output::set_format(&device, &Format::new(width, height, FourCC::new(b"YUYV")))
            .context("Failed to set YUYV output format")?;
        if (format.width, format.height) != (width, height) {
            tracing::warn!(
                "Loopback accepted {}x{} instead of {}x{}",
                format.width,
                format.height,
                width,
                height
            );
        }

        let file = File::options()
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open v4l2loopback device at {}", path.display()))?;

        tracing::info!("v4l2loopback device opened successfully");

        Ok(Self {
            file,
            width: format.width,
            height: format.height,
        })
    }
}

/// Pack RGBA pixels as YUYV 4:2:2, averaging chroma over each pixel pair.
fn rgba_to_yuyv(image: &RgbaImage) -> Vec<u8> {
    let (width, height) = image.dimensions();
    let mut yuyv = Vec::with_capacity((width.div_ceil(2) * 4 * height) as usize);

    for row in image.rows() {
        let row: Vec<_> = row.collect();
        for pair in row.chunks(2) {
            let first = pair[0];
            let second = pair.get(1).copied().unwrap_or(first);

            let (y1, u1, v1) = rgb_to_yuv(first[0], first[1], first[2]);
            let (y2, u2, v2) = rgb_to_yuv(second[0], second[1], second[2]);

            yuyv.extend_from_slice(&[
                y1,
                ((u1 as u16 + u2 as u16) / 2) as u8,
                y2,
                ((v1 as u16 + v2 as u16) / 2) as u8,
            ]);
        }
    }

    yuyv
}

/// BT.601 RGB to YUV
fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as f32, g as f32, b as f32);

    let y = (0.299 * r + 0.587 * g + 0.114 * b).round().clamp(0.0, 255.0) as u8;
    let u = (-0.147 * r - 0.289 * g + 0.436 * b + 128.0).round().clamp(0.0, 255.0) as u8;
    let v = (0.615 * r - 0.515 * g - 0.100 * b + 128.0).round().clamp(0.0, 255.0) as u8;

    (y, u, v)
}

impl OutputSink for V4L2Output {
    fn write_frame(&mut self, frame: &RgbaImage) -> Result<()> {
        let yuyv = if frame.dimensions() != (self.width, self.height) {
            let resized = imageops::resize(
                frame,
                self.width,
                self.height,
                imageops::FilterType::Triangle,
            );
            rgba_to_yuyv(&resized)
        } else {
            rgba_to_yuyv(frame)
        };

        self.file
            .write_all(&yuyv)
            .context("Failed to write frame to v4l2loopback device")?;

        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn grey_has_neutral_chroma() {
        assert_eq!(rgb_to_yuv(128, 128, 128), (128, 128, 128));
        assert_eq!(rgb_to_yuv(0, 0, 0), (0, 128, 128));
    }

    #[test]
    fn packs_two_bytes_per_pixel_and_pads_odd_rows() {
        let even = RgbaImage::from_pixel(4, 2, Rgba([255, 255, 255, 255]));
        assert_eq!(rgba_to_yuyv(&even).len(), 4 * 2 * 2);

        let odd = RgbaImage::from_pixel(3, 1, Rgba([0, 0, 0, 0]));
        assert_eq!(rgba_to_yuyv(&odd), vec![0, 128, 0, 128, 0, 128, 0, 128]);
    }
}
