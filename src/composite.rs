use image::buffer::ConvertBuffer;
use image::{Rgba, RgbImage, RgbaImage};

use crate::config::CompositingMode;
use crate::error::PipelineError;
use crate::segmentation::FullMatte;

/// Blend `frame` over `background` using a full-resolution matte.
///
/// None of the inputs are modified. The output always has the frame's size.
pub fn composite(
    frame: &RgbImage,
    matte: &FullMatte,
    background: &RgbImage,
    mode: CompositingMode,
) -> Result<RgbaImage, PipelineError> {
    let _span = tracing::debug_span!("composite").entered();

    let (width, height) = frame.dimensions();
    if matte.dim() != (height as usize, width as usize) {
        return Err(PipelineError::ShapeMismatch(format!(
            "matte {:?} does not match frame {}x{}",
            matte.dim(),
            width,
            height
        )));
    }
    if mode == CompositingMode::Opaque && background.dimensions() != (width, height) {
        return Err(PipelineError::ShapeMismatch(format!(
            "background {:?} does not match frame {}x{}",
            background.dimensions(),
            width,
            height
        )));
    }

    let mut out = RgbaImage::new(width, height);
    match mode {
        CompositingMode::Opaque => {
            for ((dst, (fg, bg)), &a) in out
                .pixels_mut()
                .zip(frame.pixels().zip(background.pixels()))
                .zip(matte.iter())
            {
                let inv = 1.0 - a;
                let blend = |c: usize| {
                    (fg[c] as f32 * a + bg[c] as f32 * inv).round().clamp(0.0, 255.0) as u8
                };
                *dst = Rgba([blend(0), blend(1), blend(2), 255]);
            }
        }
        CompositingMode::Layered => {
            for ((dst, fg), &a) in out.pixels_mut().zip(frame.pixels()).zip(matte.iter()) {
                let alpha = (a * 255.0).round().clamp(0.0, 255.0) as u8;
                *dst = Rgba([fg[0], fg[1], fg[2], alpha]);
            }
        }
    }
    Ok(out)
}

/// Straight copy of the frame with no matte work.
pub fn bypass(frame: &RgbImage) -> RgbaImage {
    frame.convert()
}
