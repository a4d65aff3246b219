use image::{imageops, Rgb, RgbImage, RgbaImage};

use super::types::{DownsampledTensor, Matte};

/// Window radius of the bilateral pass.
const BILATERAL_RADIUS: i64 = 2;
const BILATERAL_SIGMA_SPACE: f32 = 2.0;
const BILATERAL_SIGMA_COLOR: f32 = 24.0;

/// Converts frames into model input tensors and mattes back into pixels.
pub struct Preprocessor {
    gamma_lut: Option<[u8; 256]>,
    bilateral: bool,
}

impl Preprocessor {
    /// `gamma` of `None` or `1.0` disables gamma correction.
    pub fn new(gamma: Option<f32>, bilateral: bool) -> Self {
        let gamma_lut = gamma.filter(|&g| g != 1.0).map(gamma_lut);
        Self {
            gamma_lut,
            bilateral,
        }
    }

    /// Preprocess an RGB frame into a normalized planar tensor.
    ///
    /// Steps:
    /// 1. Bilinear resize to `width x height`
    /// 2. Optional gamma correction and bilateral smoothing
    /// 3. Normalize to [0, 1] and lay out as `[1, 3, height, width]`
    pub fn preprocess(&self, frame: &RgbImage, width: u32, height: u32) -> DownsampledTensor {
        let _span = tracing::debug_span!("preprocess").entered();

        let mut resized = if frame.dimensions() != (width, height) {
            imageops::resize(frame, width, height, imageops::FilterType::Triangle)
        } else {
            frame.clone()
        };

        if let Some(lut) = &self.gamma_lut {
            for pixel in resized.pixels_mut() {
                for c in pixel.0.iter_mut() {
                    *c = lut[*c as usize];
                }
            }
        }

        if self.bilateral {
            resized = bilateral(&resized);
        }

        let mut tensor = DownsampledTensor::zeros((1, 3, height as usize, width as usize));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            tensor[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
            tensor[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
            tensor[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
        }

        tensor
    }

    /// Matte as an opaque grayscale image for visualization.
    pub fn matte_to_rgba(matte: &Matte) -> RgbaImage {
        let (height, width) = matte.dim();
        RgbaImage::from_fn(width as u32, height as u32, |x, y| {
            let v = to_u8(matte[[y as usize, x as usize]]);
            image::Rgba([v, v, v, 255])
        })
    }
}

fn to_u8(v: f32) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Lookup table mapping `v -> 255 * (v / 255)^(1 / gamma)`.
pub fn gamma_lut(gamma: f32) -> [u8; 256] {
    let inv = 1.0 / gamma;
    let mut lut = [0u8; 256];
    for (i, out) in lut.iter_mut().enumerate() {
        *out = (255.0 * (i as f32 / 255.0).powf(inv)).round().clamp(0.0, 255.0) as u8;
    }
    lut
}

/// Edge-preserving smoothing; range weights use the summed channel distance.
fn bilateral(image: &RgbImage) -> RgbImage {
    let (width, height) = image.dimensions();
    let space = -0.5 / (BILATERAL_SIGMA_SPACE * BILATERAL_SIGMA_SPACE);
    let color = -0.5 / (BILATERAL_SIGMA_COLOR * BILATERAL_SIGMA_COLOR);

    RgbImage::from_fn(width, height, |x, y| {
        let center = image.get_pixel(x, y);
        let mut acc = [0.0f32; 3];
        let mut total = 0.0f32;

        for dy in -BILATERAL_RADIUS..=BILATERAL_RADIUS {
            for dx in -BILATERAL_RADIUS..=BILATERAL_RADIUS {
                let sx = (x as i64 + dx).clamp(0, width as i64 - 1) as u32;
                let sy = (y as i64 + dy).clamp(0, height as i64 - 1) as u32;
                let sample = image.get_pixel(sx, sy);

                let diff: f32 = (0..3)
                    .map(|c| (sample[c] as f32 - center[c] as f32).abs())
                    .sum();
                let weight = ((dx * dx + dy * dy) as f32 * space + diff * diff * color).exp();

                for c in 0..3 {
                    acc[c] += sample[c] as f32 * weight;
                }
                total += weight;
            }
        }

        Rgb(acc.map(|v| (v / total).round().clamp(0.0, 255.0) as u8))
    })
}
