use thiserror::Error;

/// How the compositor combines foreground and background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompositingMode {
    /// `out = fg * a + bg * (1 - a)`, alpha forced opaque.
    #[default]
    Opaque,
    /// `out.rgb = fg`, `out.a = a * 255`; the background is drawn as a separate layer.
    Layered,
}

/// Execution backend for the inference session.
///
/// Chosen once when the session is built. Changing it means building a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Cpu { threads: usize },
    Cuda { device_id: i32 },
    TensorRt { device_id: i32 },
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Cpu { threads: 4 }
    }
}

impl Backend {
    pub fn label(&self) -> String {
        match self {
            Backend::Cpu { threads } => format!("CPU ({threads} threads)"),
            Backend::Cuda { device_id } => format!("CUDA (device {device_id})"),
            Backend::TensorRt { device_id } => format!("TensorRT (device {device_id})"),
        }
    }
}

/// Temporal smoothing knobs for the matte post-processor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothingConfig {
    pub enabled: bool,
    /// Weight of the current matte in the moving average.
    pub alpha: f32,
    /// Raise `alpha` with the mean inter-frame difference.
    pub adaptive: bool,
    /// Lower bound on the effective alpha.
    pub min_alpha: f32,
    /// How strongly the mean difference raises alpha.
    pub sensitivity: f32,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            alpha: 0.6,
            adaptive: true,
            min_alpha: 0.3,
            sensitivity: 4.0,
        }
    }
}

/// Matte post-processing stages. A radius of zero disables the stage.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MatteConfig {
    pub smoothing: SmoothingConfig,
    pub morphology_radius: usize,
    pub blur_radius: usize,
}

impl MatteConfig {
    /// Every stage switched off; the matte is only clamped and upsampled.
    pub fn passthrough() -> Self {
        Self {
            smoothing: SmoothingConfig {
                enabled: false,
                ..SmoothingConfig::default()
            },
            morphology_radius: 0,
            blur_radius: 0,
        }
    }
}

/// Snapshot of everything the pipeline reads during a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub model_scale: f32,
    pub downsample_ratio: f32,
    pub background_blur_px: f32,
    pub frame_skip: u32,
    pub raw_mode: bool,
    pub show_matte: bool,
    pub gamma: Option<f32>,
    pub bilateral: bool,
    pub matte: MatteConfig,
    pub compositing: CompositingMode,
    pub backend: Backend,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_scale: 0.5,
            downsample_ratio: 0.25,
            background_blur_px: 0.0,
            frame_skip: 0,
            raw_mode: false,
            show_matte: false,
            gamma: None,
            bilateral: false,
            matte: MatteConfig {
                morphology_radius: 1,
                blur_radius: 1,
                ..MatteConfig::default()
            },
            compositing: CompositingMode::Opaque,
            backend: Backend::default(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("model scale must be in (0, 1], got {0}")]
    ModelScale(f32),
    #[error("downsample ratio must be in (0, 1], got {0}")]
    DownsampleRatio(f32),
    #[error("background blur must be non-negative, got {0}")]
    BackgroundBlur(f32),
    #[error("smoothing coefficient must be in [0, 1], got {0}")]
    Smoothing(f32),
    #[error("gamma must be positive, got {0}")]
    Gamma(f32),
    #[error("at least one inference thread is required")]
    Threads,
}

/// What a config change requires from the running pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigDelta {
    /// Backend or thread count changed.
    pub restart_required: bool,
    /// Tensor shapes changed; recurrent state and previous matte are stale.
    pub shapes_changed: bool,
    pub background_changed: bool,
    pub adapter_changed: bool,
}

fn in_unit_interval(v: f32) -> bool {
    v > 0.0 && v <= 1.0
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !in_unit_interval(self.model_scale) {
            return Err(ConfigError::ModelScale(self.model_scale));
        }
        if !in_unit_interval(self.downsample_ratio) {
            return Err(ConfigError::DownsampleRatio(self.downsample_ratio));
        }
        if !(self.background_blur_px >= 0.0) {
            return Err(ConfigError::BackgroundBlur(self.background_blur_px));
        }
        let smoothing = &self.matte.smoothing;
        for v in [smoothing.alpha, smoothing.min_alpha] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError::Smoothing(v));
            }
        }
        if let Some(gamma) = self.gamma {
            if !(gamma > 0.0) {
                return Err(ConfigError::Gamma(gamma));
            }
        }
        if let Backend::Cpu { threads: 0 } = self.backend {
            return Err(ConfigError::Threads);
        }
        Ok(())
    }

    /// Model input size for a frame, `round(dim * model_scale)`, at least 1.
    pub fn model_input_size(&self, width: u32, height: u32) -> (u32, u32) {
        let scale = |v: u32| ((v as f32 * self.model_scale).round() as u32).max(1);
        (scale(width), scale(height))
    }

    pub fn delta(&self, next: &PipelineConfig) -> ConfigDelta {
        ConfigDelta {
            restart_required: self.backend != next.backend,
            shapes_changed: self.model_scale != next.model_scale
                || self.downsample_ratio != next.downsample_ratio,
            background_changed: self.background_blur_px != next.background_blur_px,
            adapter_changed: self.gamma != next.gamma || self.bilateral != next.bilateral,
        }
    }
}
