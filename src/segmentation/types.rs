use anyhow::Result;
use ndarray::{Array2, Array4, ArrayD, IxDyn};

/// Alpha matte: 0.0 = background, 1.0 = foreground, shape `[height, width]`.
pub type Matte = Array2<f32>;

/// Matte upsampled to the full frame resolution.
pub type FullMatte = Array2<f32>;

/// Planar RGB input tensor, shape `[1, 3, h, w]`, values in `[0, 1]`.
pub type DownsampledTensor = Array4<f32>;

/// Channel count of each recurrent slot for RVM MobileNetV3.
const STATE_CHANNELS: [usize; 4] = [16, 20, 40, 64];

/// Spatial stride of each recurrent slot relative to the downsampled input.
const STATE_STRIDES: [usize; 4] = [2, 4, 8, 16];

/// Recurrent hidden states r1..r4 carried from one inference call to the next.
///
/// Shapes belong to the model. The pipeline only replaces the whole set after a
/// successful call or resets it to zeros when the input geometry changes.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurrentState {
    slots: [ArrayD<f32>; 4],
}

impl RecurrentState {
    pub fn from_slots(slots: [ArrayD<f32>; 4]) -> Self {
        Self { slots }
    }

    /// Zero state for an input of `height x width` at `downsample_ratio`.
    pub fn zeroed(height: u32, width: u32, downsample_ratio: f32) -> Self {
        let inner = |v: u32| ((v as f32 * downsample_ratio).round() as usize).max(1);
        let (h, w) = (inner(height), inner(width));

        tracing::debug!("Initializing hidden states for {}x{} (inner {}x{})", width, height, w, h);

        let slot = |i: usize| {
            let stride = STATE_STRIDES[i];
            ArrayD::zeros(IxDyn(&[
                1,
                STATE_CHANNELS[i],
                h.div_ceil(stride).max(1),
                w.div_ceil(stride).max(1),
            ]))
        };
        Self {
            slots: [slot(0), slot(1), slot(2), slot(3)],
        }
    }

    pub fn slots(&self) -> &[ArrayD<f32>; 4] {
        &self.slots
    }

    pub fn shapes(&self) -> [Vec<usize>; 4] {
        std::array::from_fn(|i| self.slots[i].shape().to_vec())
    }
}

/// Result of one inference call.
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    pub matte: Matte,
    pub state: RecurrentState,
}

/// Boundary to the matting model.
///
/// Calls are serialised by the pipeline. An error leaves the caller's state
/// untouched, so it can be retried with the same inputs.
pub trait MattingSession {
    fn infer(
        &mut self,
        src: &DownsampledTensor,
        state: &RecurrentState,
        downsample_ratio: f32,
    ) -> Result<InferenceOutput>;

    /// Short description of the execution backend, reported in stats.
    fn backend_label(&self) -> String;
}
