use anyhow::{Context, Result};
use image::{imageops, Rgb, RgbImage};
use std::path::Path;

/// Placeholder gradient endpoints (top-left, bottom-right).
const GRADIENT_START: [u8; 3] = [0x1a, 0x1a, 0x2e];
const GRADIENT_END: [u8; 3] = [0x16, 0x21, 0x3e];

/// Where the background pixels come from.
#[derive(Debug, Clone)]
pub enum BackgroundSource {
    /// Deterministic diagonal gradient.
    Gradient,
    /// Still image, cover-fit to the frame.
    Image(RgbImage),
    /// The live frame itself, optionally blurred.
    LiveFeed,
}

impl BackgroundSource {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let image = image::open(path)
            .with_context(|| format!("Failed to open background image {}", path.display()))?
            .into_rgb8();
        tracing::info!(
            "Loaded background {} ({}x{})",
            path.display(),
            image.width(),
            image.height()
        );
        Ok(BackgroundSource::Image(image))
    }
}

/// Owns the background buffer and keeps it sized to the current frame.
pub struct BackgroundManager {
    source: BackgroundSource,
    blur_px: f32,
    buffer: Option<RgbImage>,
    dirty: bool,
}

impl BackgroundManager {
    pub fn new(source: BackgroundSource, blur_px: f32) -> Self {
        Self {
            source,
            blur_px,
            buffer: None,
            dirty: true,
        }
    }

    pub fn set_source(&mut self, source: BackgroundSource) {
        self.source = source;
        self.dirty = true;
    }

    pub fn set_blur(&mut self, blur_px: f32) {
        if blur_px != self.blur_px {
            self.blur_px = blur_px;
            self.dirty = true;
        }
    }

    /// Last prepared buffer, if any frame has been seen.
    pub fn current(&self) -> Option<&RgbImage> {
        self.buffer.as_ref()
    }

    /// Background matching `frame`'s dimensions, regenerated when stale.
    pub fn prepare(&mut self, frame: &RgbImage) -> &RgbImage {
        let (width, height) = frame.dimensions();
        let resized = self
            .buffer
            .as_ref()
            .map_or(true, |b| b.dimensions() != (width, height));
        let live = matches!(self.source, BackgroundSource::LiveFeed);

        if live || self.dirty || resized {
            let _span = tracing::debug_span!("background").entered();
            let base = match &self.source {
                BackgroundSource::LiveFeed => frame.clone(),
                BackgroundSource::Image(image) if image.width() > 0 && image.height() > 0 => {
                    cover_fit(image, width, height)
                }
                BackgroundSource::Image(_) | BackgroundSource::Gradient => placeholder(width, height),
            };
            let buffer = if self.blur_px > 0.0 {
                imageops::blur(&base, self.blur_px)
            } else {
                base
            };
            if !live {
                tracing::debug!("Background regenerated at {}x{}", width, height);
            }
            self.dirty = false;
            self.buffer = Some(buffer);
        }

        self.buffer.get_or_insert_with(|| placeholder(width, height))
    }
}

/// Diagonal gradient from `#1a1a2e` to `#16213e`.
pub fn placeholder(width: u32, height: u32) -> RgbImage {
    let span = (width + height).saturating_sub(2).max(1) as f32;
    RgbImage::from_fn(width, height, |x, y| {
        let t = (x + y) as f32 / span;
        Rgb(std::array::from_fn(|c| {
            let (a, b) = (GRADIENT_START[c] as f32, GRADIENT_END[c] as f32);
            (a + (b - a) * t).round() as u8
        }))
    })
}

/// Scale `image` to cover `width x height` keeping its aspect ratio, then crop centred.
pub fn cover_fit(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    let (iw, ih) = image.dimensions();
    let scale = (width as f32 / iw as f32).max(height as f32 / ih as f32);
    let sw = ((iw as f32 * scale).round() as u32).max(width);
    let sh = ((ih as f32 * scale).round() as u32).max(height);

    let scaled = if (sw, sh) == (iw, ih) {
        image.clone()
    } else {
        imageops::resize(image, sw, sh, imageops::FilterType::Triangle)
    };
    let x = (sw - width) / 2;
    let y = (sh - height) / 2;
    imageops::crop_imm(&scaled, x, y, width, height).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_runs_between_gradient_stops() {
        let bg = placeholder(64, 48);
        assert_eq!(bg.get_pixel(0, 0).0, GRADIENT_START);
        assert_eq!(bg.get_pixel(63, 47).0, GRADIENT_END);
        assert_eq!(placeholder(64, 48), bg);
    }

    #[test]
    fn cover_fit_crops_the_long_side() {
        // Left half red, right half blue, 4:1 aspect into a square.
        let image = RgbImage::from_fn(40, 10, |x, _| {
            if x < 20 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 0, 255])
            }
        });
        let fitted = cover_fit(&image, 10, 10);
        assert_eq!(fitted.dimensions(), (10, 10));
        // The centre crop straddles the red/blue seam.
        assert_eq!(fitted.get_pixel(0, 5).0, [255, 0, 0]);
        assert_eq!(fitted.get_pixel(9, 5).0, [0, 0, 255]);
    }

    #[test]
    fn cover_fit_upscales_small_images() {
        let image = RgbImage::from_pixel(4, 3, Rgb([9, 8, 7]));
        let fitted = cover_fit(&image, 100, 50);
        assert_eq!(fitted.dimensions(), (100, 50));
        assert_eq!(fitted.get_pixel(50, 25).0, [9, 8, 7]);
    }

    #[test]
    fn follows_frame_dimensions() {
        let mut manager = BackgroundManager::new(BackgroundSource::Gradient, 0.0);
        assert!(manager.current().is_none());

        let small = RgbImage::new(8, 6);
        assert_eq!(manager.prepare(&small).dimensions(), (8, 6));
        let large = RgbImage::new(20, 10);
        assert_eq!(manager.prepare(&large).dimensions(), (20, 10));
    }

    #[test]
    fn live_feed_tracks_each_frame() {
        let mut manager = BackgroundManager::new(BackgroundSource::LiveFeed, 0.0);
        let a = RgbImage::from_pixel(4, 4, Rgb([10, 20, 30]));
        let b = RgbImage::from_pixel(4, 4, Rgb([40, 50, 60]));
        assert_eq!(manager.prepare(&a), &a);
        assert_eq!(manager.prepare(&b), &b);
    }

    #[test]
    fn blur_change_regenerates() {
        let image = RgbImage::from_fn(16, 16, |x, _| if x < 8 { Rgb([0, 0, 0]) } else { Rgb([255, 255, 255]) });
        let mut manager = BackgroundManager::new(BackgroundSource::Image(image.clone()), 0.0);
        let frame = RgbImage::new(16, 16);
        assert_eq!(manager.prepare(&frame), &image);

        manager.set_blur(3.0);
        let blurred = manager.prepare(&frame).clone();
        assert_ne!(blurred, image);
        let edge = blurred.get_pixel(8, 8)[0];
        assert!(edge > 0 && edge < 255);
    }

    #[test]
    fn loads_image_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bg.png");
        RgbImage::from_pixel(3, 2, Rgb([1, 2, 3])).save(&path).unwrap();

        let BackgroundSource::Image(image) = BackgroundSource::from_path(&path).unwrap() else {
            panic!("expected an image source");
        };
        assert_eq!(image.dimensions(), (3, 2));
        assert!(BackgroundSource::from_path(dir.path().join("missing.png")).is_err());
    }
}
