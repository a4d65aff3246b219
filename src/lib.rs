//! Real-time background replacement for a live video stream.
//!
//! Each frame is downsampled for a recurrent matting model, the returned matte
//! is cleaned up and upsampled, and the subject is blended over a background.

pub mod background;
pub mod capture;
pub mod composite;
pub mod config;
pub mod error;
pub mod metrics;
pub mod output;
pub mod pipeline;
pub mod postprocess;
pub mod scheduler;
pub mod segmentation;

pub use config::{Backend, CompositingMode, PipelineConfig};
pub use error::PipelineError;
pub use pipeline::{Liveness, Pipeline, TickOutcome};
