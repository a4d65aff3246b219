//! Matte cleanup between inference and compositing.
//!
//! Stages run in a fixed order on the model-resolution matte: temporal
//! smoothing, morphological opening then closing, blur. The result is then
//! upsampled to frame resolution. The upsample is the step that decides how
//! soft subject edges look in the composite, so it always uses a bilinear
//! filter rather than nearest-neighbour.

use image::{imageops, ImageBuffer, Luma};

use crate::config::{MatteConfig, SmoothingConfig};
use crate::error::PipelineError;
use crate::segmentation::{FullMatte, Matte};

/// Stateful post-processor; keeps the previous processed matte.
#[derive(Debug, Default)]
pub struct MattePostProcessor {
    previous: Option<Matte>,
}

impl MattePostProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the previous matte, e.g. after a resolution or scale change.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub fn previous(&self) -> Option<&Matte> {
        self.previous.as_ref()
    }

    /// Run every enabled stage and upsample to `width x height`.
    ///
    /// The previous matte is only replaced when the whole run succeeds.
    pub fn process(
        &mut self,
        mut matte: Matte,
        config: &MatteConfig,
        width: u32,
        height: u32,
    ) -> Result<FullMatte, PipelineError> {
        let _span = tracing::debug_span!("postprocess").entered();

        if matte.is_empty() || width == 0 || height == 0 {
            return Err(PipelineError::ShapeMismatch(format!(
                "cannot upsample {:?} matte to {}x{}",
                matte.dim(),
                width,
                height
            )));
        }

        clamp_unit(&mut matte);

        let previous = self
            .previous
            .as_ref()
            .filter(|prev| prev.dim() == matte.dim());
        if config.smoothing.enabled {
            if let Some(prev) = previous {
                let alpha = temporal_smooth(&mut matte, prev, &config.smoothing);
                tracing::trace!("temporal smoothing alpha={:.3}", alpha);
            }
        }
        let smoothed = matte.clone();

        if config.morphology_radius > 0 {
            matte = close(&open(&matte, config.morphology_radius), config.morphology_radius);
        }

        if config.blur_radius > 0 {
            gaussian_blur(&mut matte, config.blur_radius);
        }

        let full = upsample(&matte, width, height)?;
        self.previous = Some(smoothed);
        Ok(full)
    }
}

/// Clamp to [0, 1]; NaN becomes 0.
pub fn clamp_unit(matte: &mut Matte) {
    matte.mapv_inplace(|v| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) });
}

/// Mean absolute difference between two mattes of equal shape.
pub fn mean_abs_diff(a: &Matte, b: &Matte) -> f32 {
    if a.is_empty() {
        return 0.0;
    }
    let sum: f32 = a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum();
    sum / a.len() as f32
}

/// Weight of the current matte for a given inter-frame difference.
///
/// `min_alpha` only bounds the adaptive weight; a fixed weight is used as given.
pub fn effective_alpha(mean_diff: f32, config: &SmoothingConfig) -> f32 {
    if config.adaptive {
        (config.alpha + mean_diff * config.sensitivity)
            .max(config.min_alpha)
            .min(1.0)
    } else {
        config.alpha.clamp(0.0, 1.0)
    }
}

/// `matte = matte * a + prev * (1 - a)`, written as `prev + a * (matte - prev)`
/// so identical inputs come back bit-for-bit. Results are kept in [0, 1].
/// Returns the alpha used.
pub fn temporal_smooth(matte: &mut Matte, prev: &Matte, config: &SmoothingConfig) -> f32 {
    let alpha = effective_alpha(mean_abs_diff(matte, prev), config);
    matte.zip_mut_with(prev, |m, &p| *m = (p + alpha * (*m - p)).clamp(0.0, 1.0));
    alpha
}

#[derive(Clone, Copy)]
enum Extremum {
    Min,
    Max,
}

impl Extremum {
    fn pick(self, a: f32, b: f32) -> f32 {
        match self {
            Extremum::Min => a.min(b),
            Extremum::Max => a.max(b),
        }
    }
}

/// Square min/max filter of side `2r + 1`. Pixels within `r` of an edge are copied.
fn rank_filter(matte: &Matte, radius: usize, op: Extremum) -> Matte {
    let (h, w) = matte.dim();
    let mut out = matte.clone();
    if radius == 0 || h <= 2 * radius || w <= 2 * radius {
        return out;
    }

    // Separable: a square window is a row window followed by a column window.
    let mut rows = matte.clone();
    for y in 0..h {
        for x in radius..w - radius {
            rows[[y, x]] = (x - radius..=x + radius)
                .map(|sx| matte[[y, sx]])
                .fold(matte[[y, x]], |acc, v| op.pick(acc, v));
        }
    }
    for y in radius..h - radius {
        for x in radius..w - radius {
            out[[y, x]] = (y - radius..=y + radius)
                .map(|sy| rows[[sy, x]])
                .fold(rows[[y, x]], |acc, v| op.pick(acc, v));
        }
    }
    out
}

pub fn erode(matte: &Matte, radius: usize) -> Matte {
    rank_filter(matte, radius, Extremum::Min)
}

pub fn dilate(matte: &Matte, radius: usize) -> Matte {
    rank_filter(matte, radius, Extremum::Max)
}

/// Erosion then dilation; removes isolated bright speckle.
pub fn open(matte: &Matte, radius: usize) -> Matte {
    dilate(&erode(matte, radius), radius)
}

/// Dilation then erosion; fills small dark holes.
pub fn close(matte: &Matte, radius: usize) -> Matte {
    erode(&dilate(matte, radius), radius)
}

fn gaussian_kernel(radius: usize) -> Vec<f32> {
    let sigma = (radius as f32 / 2.0).max(0.5);
    let denom = 2.0 * sigma * sigma;
    let r = radius as i64;
    let kernel: Vec<f32> = (-r..=r)
        .map(|i| (-((i * i) as f32) / denom).exp())
        .collect();
    let total: f32 = kernel.iter().sum();
    kernel.into_iter().map(|k| k / total).collect()
}

/// Separable Gaussian blur with edge clamping. Radius 0 leaves the matte alone.
/// Rounding in the weighted sums is clamped back into [0, 1].
pub fn gaussian_blur(matte: &mut Matte, radius: usize) {
    if radius == 0 {
        return;
    }
    let kernel = gaussian_kernel(radius);
    let (h, w) = matte.dim();
    let r = radius as i64;

    let src = matte.clone();
    let mut tmp = Matte::zeros((h, w));
    for y in 0..h {
        for x in 0..w {
            tmp[[y, x]] = kernel
                .iter()
                .enumerate()
                .map(|(k, weight)| {
                    let sx = (x as i64 + k as i64 - r).clamp(0, w as i64 - 1) as usize;
                    src[[y, sx]] * weight
                })
                .sum();
        }
    }
    for y in 0..h {
        for x in 0..w {
            matte[[y, x]] = kernel
                .iter()
                .enumerate()
                .map(|(k, weight)| {
                    let sy = (y as i64 + k as i64 - r).clamp(0, h as i64 - 1) as usize;
                    tmp[[sy, x]] * weight
                })
                .sum::<f32>()
                .clamp(0.0, 1.0);
        }
    }
}

/// Bilinear resize of a matte to `width x height`.
pub fn upsample(matte: &Matte, width: u32, height: u32) -> Result<FullMatte, PipelineError> {
    let (h, w) = matte.dim();
    if (w as u32, h as u32) == (width, height) {
        return Ok(matte.clone());
    }

    let data: Vec<f32> = matte.iter().copied().collect();
    let small: ImageBuffer<Luma<f32>, Vec<f32>> = ImageBuffer::from_raw(w as u32, h as u32, data)
        .ok_or_else(|| PipelineError::ShapeMismatch(format!("matte buffer {w}x{h} is inconsistent")))?;
    let large = imageops::resize(&small, width, height, imageops::FilterType::Triangle);

    let mut full = FullMatte::from_shape_vec((height as usize, width as usize), large.into_raw())
        .map_err(|e| PipelineError::ShapeMismatch(e.to_string()))?;
    clamp_unit(&mut full);
    Ok(full)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_unit(m: &Matte) -> bool {
        m.iter().all(|v| (0.0..=1.0).contains(v))
    }

    fn constant(h: usize, w: usize, v: f32) -> Matte {
        Matte::from_elem((h, w), v)
    }

    #[test]
    fn clamp_handles_out_of_range_and_nan() {
        let mut m = Matte::from_shape_vec((1, 4), vec![-0.5, 0.3, 1.7, f32::NAN]).unwrap();
        clamp_unit(&mut m);
        assert_eq!(m.as_slice().unwrap(), &[0.0, 0.3, 1.0, 0.0]);
    }

    #[test]
    fn smoothing_is_identity_on_static_scene() {
        let m = Matte::from_shape_fn((5, 7), |(y, x)| ((y * 7 + x) as f32 * 0.037) % 1.0);
        for alpha in [0.0, 0.13, 0.5, 0.99, 1.0] {
            let config = SmoothingConfig {
                alpha,
                min_alpha: 0.0,
                ..SmoothingConfig::default()
            };
            let mut current = m.clone();
            temporal_smooth(&mut current, &m, &config);
            assert_eq!(current, m);
        }
    }

    #[test]
    fn adaptive_alpha_rises_with_motion_and_respects_floor() {
        let config = SmoothingConfig {
            alpha: 0.1,
            adaptive: true,
            min_alpha: 0.3,
            sensitivity: 4.0,
            enabled: true,
        };
        assert_eq!(effective_alpha(0.0, &config), 0.3);
        assert!(effective_alpha(0.1, &config) > effective_alpha(0.05, &config));
        assert_eq!(effective_alpha(0.9, &config), 1.0);

        let fixed = SmoothingConfig {
            adaptive: false,
            alpha: 0.5,
            ..config
        };
        assert_eq!(effective_alpha(0.9, &fixed), 0.5);
    }

    #[test]
    fn fixed_alpha_below_floor_is_used_as_given() {
        let config = SmoothingConfig {
            alpha: 0.1,
            adaptive: false,
            min_alpha: 0.3,
            ..SmoothingConfig::default()
        };
        assert_eq!(effective_alpha(0.0, &config), 0.1);
        assert_eq!(effective_alpha(0.8, &config), 0.1);

        let mut current = constant(2, 3, 1.0);
        let used = temporal_smooth(&mut current, &constant(2, 3, 0.0), &config);
        assert_eq!(used, 0.1);
        assert!(current.iter().all(|&v| v == 0.1));
    }

    #[test]
    fn each_stage_stays_in_unit_range() {
        let mut raw = Matte::from_shape_fn((9, 9), |(y, x)| ((x * 5 + y * 3) % 7) as f32 / 2.0 - 1.0);
        raw[[4, 4]] = f32::NAN;
        clamp_unit(&mut raw);
        assert!(in_unit(&raw));

        let opened = open(&raw, 1);
        assert!(in_unit(&opened));
        let mut closed = close(&opened, 1);
        assert!(in_unit(&closed));

        gaussian_blur(&mut closed, 2);
        assert!(in_unit(&closed));

        // Endpoint weights with a clamped previous matte never leave [0, 1].
        let prev = Matte::from_shape_fn((9, 9), |(y, x)| if (x + y) % 2 == 0 { 0.0 } else { 1.0 });
        for alpha in [0.0, 0.3, 1.0] {
            let config = SmoothingConfig {
                alpha,
                adaptive: false,
                ..SmoothingConfig::default()
            };
            let mut current = closed.clone();
            temporal_smooth(&mut current, &prev, &config);
            assert!(in_unit(&current));
        }

        let adaptive = SmoothingConfig::default();
        let mut current = closed.clone();
        temporal_smooth(&mut current, &prev, &adaptive);
        assert!(in_unit(&current));
    }

    #[test]
    fn smoothing_blends_toward_previous() {
        let config = SmoothingConfig {
            alpha: 0.5,
            adaptive: false,
            min_alpha: 0.0,
            ..SmoothingConfig::default()
        };
        let mut current = constant(2, 2, 1.0);
        let prev = constant(2, 2, 0.0);
        temporal_smooth(&mut current, &prev, &config);
        assert!(current.iter().all(|&v| v == 0.5));
    }

    #[test]
    fn morphology_radius_zero_is_bit_identical() {
        let m = Matte::from_shape_fn((6, 6), |(y, x)| ((x * 31 + y * 17) % 11) as f32 / 10.0);
        assert_eq!(erode(&m, 0), m);
        assert_eq!(dilate(&m, 0), m);
        assert_eq!(close(&open(&m, 0), 0), m);
    }

    #[test]
    fn opening_removes_speckle() {
        let mut m = constant(7, 7, 0.0);
        m[[3, 3]] = 1.0;
        let opened = open(&m, 1);
        assert!(opened.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn closing_fills_holes() {
        let mut m = constant(7, 7, 1.0);
        m[[3, 3]] = 0.0;
        let closed = close(&m, 1);
        assert!(closed.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn morphology_leaves_border_untouched() {
        let mut m = constant(5, 5, 0.0);
        m[[0, 0]] = 1.0;
        m[[4, 2]] = 1.0;
        let eroded = erode(&m, 1);
        assert_eq!(eroded[[0, 0]], 1.0);
        assert_eq!(eroded[[4, 2]], 1.0);

        let dilated = dilate(&m, 1);
        // (1, 1) sees (0, 0) in its window.
        assert_eq!(dilated[[1, 1]], 1.0);
        assert_eq!(dilated[[0, 1]], 0.0);
    }

    #[test]
    fn blur_radius_zero_is_noop_and_constant_is_preserved() {
        let mut m = Matte::from_shape_fn((4, 4), |(y, x)| (x + y) as f32 / 6.0);
        let before = m.clone();
        gaussian_blur(&mut m, 0);
        assert_eq!(m, before);

        let mut flat = constant(6, 6, 0.4);
        gaussian_blur(&mut flat, 2);
        assert!(flat.iter().all(|&v| (v - 0.4).abs() < 1e-5));
    }

    #[test]
    fn upsample_reaches_frame_size() {
        let m = constant(3, 4, 0.75);
        let full = upsample(&m, 40, 30).unwrap();
        assert_eq!(full.dim(), (30, 40));
        assert!(full.iter().all(|&v| (v - 0.75).abs() < 1e-5));
    }

    #[test]
    fn every_stage_stays_in_unit_range() {
        let mut processor = MattePostProcessor::new();
        let config = MatteConfig {
            smoothing: SmoothingConfig::default(),
            morphology_radius: 1,
            blur_radius: 2,
        };
        for seed in 0..3u32 {
            let raw = Matte::from_shape_fn((8, 10), |(y, x)| {
                ((x as u32 * 7 + y as u32 * 13 + seed * 5) % 9) as f32 / 4.0 - 0.5
            });
            let full = processor.process(raw, &config, 20, 16).unwrap();
            assert_eq!(full.dim(), (16, 20));
            assert!(in_unit(&full));
            assert!(in_unit(processor.previous().unwrap()));
        }
    }

    #[test]
    fn first_matte_becomes_previous() {
        let mut processor = MattePostProcessor::new();
        let raw = constant(4, 4, 0.2);
        processor
            .process(raw.clone(), &MatteConfig::default(), 4, 4)
            .unwrap();
        assert_eq!(processor.previous(), Some(&raw));

        processor.reset();
        assert!(processor.previous().is_none());
    }

    #[test]
    fn empty_matte_is_rejected_without_touching_previous() {
        let mut processor = MattePostProcessor::new();
        processor
            .process(constant(2, 2, 1.0), &MatteConfig::default(), 2, 2)
            .unwrap();
        let err = processor.process(Matte::zeros((0, 0)), &MatteConfig::default(), 2, 2);
        assert!(matches!(err, Err(PipelineError::ShapeMismatch(_))));
        assert_eq!(processor.previous(), Some(&constant(2, 2, 1.0)));
    }
}
