use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by the frame pipeline.
///
/// Only `FatalReconfiguration` and `Config` reach the caller as hard failures;
/// the others are recovered inside the tick loop.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The inference collaborator rejected a call. Recovered by bypassing one tick.
    #[error("inference failed: {0:#}")]
    TransientInference(#[source] anyhow::Error),

    /// Buffers disagree on dimensions, usually after a reconfiguration.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Camera or inference session is not initialised yet.
    #[error("{0} is not available")]
    CollaboratorUnavailable(&'static str),

    /// The change needs the inference session rebuilt from scratch.
    #[error("restart required: {0}")]
    FatalReconfiguration(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PipelineError {
    /// Whether the tick loop may continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TransientInference(_) | Self::ShapeMismatch(_) | Self::CollaboratorUnavailable(_)
        )
    }
}
