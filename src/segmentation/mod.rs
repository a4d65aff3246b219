mod preprocess;
mod rvm;
pub mod types;

pub use preprocess::{gamma_lut, Preprocessor};
pub use rvm::RobustVideoMatting;
pub use types::{
    DownsampledTensor, FullMatte, InferenceOutput, Matte, MattingSession, RecurrentState,
};

use crate::config::Backend;
use anyhow::Result;

/// Create the default matting session (RVM) on `backend`.
pub fn create_default_session(model_path: &str, backend: Backend) -> Result<Box<dyn MattingSession>> {
    let session = RobustVideoMatting::new(model_path, backend)?;
    Ok(Box::new(session))
}
