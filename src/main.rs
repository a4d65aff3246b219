use anyhow::{Context, Result};
use backdrop::background::BackgroundSource;
use backdrop::capture::WebcamCapture;
use backdrop::config::{Backend, CompositingMode, MatteConfig, PipelineConfig, SmoothingConfig};
use backdrop::metrics::LogObserver;
use backdrop::output::V4L2Output;
use backdrop::segmentation;
use backdrop::Pipeline;
use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    Cpu,
    Cuda,
    Tensorrt,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input webcam device index
    #[arg(short, long, default_value_t = 0)]
    input_device: u32,

    /// Output v4l2loopback device path
    #[arg(short, long, default_value = "/dev/video10")]
    output_device: String,

    /// Capture resolution width
    #[arg(long, default_value_t = 1280)]
    capture_width: u32,

    /// Capture resolution height
    #[arg(long, default_value_t = 720)]
    capture_height: u32,

    /// Output resolution width
    #[arg(long, default_value_t = 1280)]
    output_width: u32,

    /// Output resolution height
    #[arg(long, default_value_t = 720)]
    output_height: u32,

    /// Target frames per second
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Path to the RVM matting model (ONNX file)
    /// If not provided, frames pass through untouched
    #[arg(long)]
    model: Option<String>,

    /// Model input size as a fraction of the frame size
    #[arg(long, default_value_t = 0.5)]
    model_scale: f32,

    /// Downsample ratio passed to the model
    #[arg(long, default_value_t = 0.25)]
    downsample_ratio: f32,

    /// Background image; defaults to a dark gradient
    #[arg(long, conflicts_with = "live_background")]
    background: Option<String>,

    /// Use the blurred camera feed as the background
    #[arg(long)]
    live_background: bool,

    /// Background blur in pixels
    #[arg(long, default_value_t = 0.0)]
    background_blur: f32,

    /// Reuse each matte for this many extra frames
    #[arg(long, default_value_t = 0)]
    frame_skip: u32,

    /// Skip matting entirely and forward the camera frames
    #[arg(long)]
    raw: bool,

    /// Gamma correction applied before inference
    #[arg(long)]
    gamma: Option<f32>,

    /// Edge-preserving smoothing before inference
    #[arg(long)]
    bilateral: bool,

    /// Temporal smoothing weight of the current matte (1.0 disables smoothing)
    #[arg(long, default_value_t = 0.6)]
    smoothing: f32,

    /// Lower bound on the adaptive smoothing weight
    #[arg(long, default_value_t = 0.3)]
    min_smoothing: f32,

    /// Keep the smoothing weight fixed regardless of motion
    #[arg(long)]
    no_adaptive_smoothing: bool,

    /// Radius of the matte opening/closing (0 disables)
    #[arg(long, default_value_t = 1)]
    morphology_radius: usize,

    /// Radius of the matte blur (0 disables)
    #[arg(long, default_value_t = 1)]
    matte_blur: usize,

    /// Emit foreground with alpha instead of an opaque composite
    #[arg(long)]
    layered: bool,

    /// Show matte visualization (grayscale silhouette) instead of the composite
    #[arg(long)]
    show_matte: bool,

    /// Inference backend
    #[arg(long, value_enum, default_value_t = BackendArg::Cpu)]
    backend: BackendArg,

    /// Intra-op threads for the CPU backend
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// GPU device for CUDA/TensorRT
    #[arg(long, default_value_t = 0)]
    device_id: i32,
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        let backend = match self.backend {
            BackendArg::Cpu => Backend::Cpu {
                threads: self.threads,
            },
            BackendArg::Cuda => Backend::Cuda {
                device_id: self.device_id,
            },
            BackendArg::Tensorrt => Backend::TensorRt {
                device_id: self.device_id,
            },
        };

        PipelineConfig {
            model_scale: self.model_scale,
            downsample_ratio: self.downsample_ratio,
            background_blur_px: self.background_blur,
            frame_skip: self.frame_skip,
            raw_mode: self.raw,
            show_matte: self.show_matte,
            gamma: self.gamma,
            bilateral: self.bilateral,
            matte: MatteConfig {
                smoothing: SmoothingConfig {
                    enabled: self.smoothing < 1.0,
                    alpha: self.smoothing,
                    adaptive: !self.no_adaptive_smoothing,
                    min_alpha: self.min_smoothing,
                    ..SmoothingConfig::default()
                },
                morphology_radius: self.morphology_radius,
                blur_radius: self.matte_blur,
            },
            compositing: if self.layered {
                CompositingMode::Layered
            } else {
                CompositingMode::Opaque
            },
            backend,
        }
    }

    fn background_source(&self) -> BackgroundSource {
        if self.live_background {
            return BackgroundSource::LiveFeed;
        }
        match &self.background {
            Some(path) => BackgroundSource::from_path(path).unwrap_or_else(|e| {
                tracing::warn!("{:#}; using gradient background", e);
                BackgroundSource::Gradient
            }),
            None => BackgroundSource::Gradient,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("Backdrop starting");
    tracing::info!("Capture: {}x{}", args.capture_width, args.capture_height);
    tracing::info!("Output: {}x{}", args.output_width, args.output_height);
    tracing::info!("Target FPS: {}", args.fps);

    let config = args.pipeline_config();
    let backend = config.backend;
    let mut pipeline = Pipeline::new(config, args.background_source())
        .context("Invalid pipeline configuration")?;

    let liveness = pipeline.liveness();
    ctrlc::set_handler(move || liveness.teardown()).context("Failed to install Ctrl+C handler")?;

    // Initialize capture
    let mut capture = WebcamCapture::new(
        args.input_device,
        args.capture_width,
        args.capture_height,
    )
    .context("Failed to initialize webcam capture")?;

    // Initialize output
    let mut output = V4L2Output::new(&args.output_device, args.output_width, args.output_height)
        .context("Failed to initialize v4l2loopback output")?;

    if args.layered {
        tracing::warn!("Loopback output has no alpha; layered frames show the foreground only");
    }

    // A missing or broken model leaves the pipeline in bypass
    if let Some(model_path) = &args.model {
        match segmentation::create_default_session(model_path, backend) {
            Ok(session) => pipeline.attach_session(session),
            Err(e) => tracing::error!("Failed to load matting model: {:#}; running in passthrough", e),
        }
    } else {
        tracing::info!("Running in passthrough mode (no matting model)");
    }

    pipeline.run(&mut capture, &mut output, &mut LogObserver, args.fps)
}
