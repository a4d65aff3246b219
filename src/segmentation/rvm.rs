use super::types::{DownsampledTensor, InferenceOutput, Matte, MattingSession, RecurrentState};
use crate::config::Backend;
use anyhow::{anyhow, bail, Context, Result};
use ndarray::{ArrayD, IxDyn};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
    TensorRTExecutionProvider,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;

const STATE_INPUTS: [&str; 4] = ["r1i", "r2i", "r3i", "r4i"];
const STATE_OUTPUTS: [&str; 4] = ["r1o", "r2o", "r3o", "r4o"];

/// RobustVideoMatting session on ONNX Runtime.
///
/// Inputs: `src`, `r1i`..`r4i`, `downsample_ratio`.
/// Outputs: `fgr` (unused), `pha`, `r1o`..`r4o`.
pub struct RobustVideoMatting {
    session: Session,
    backend: Backend,
}

impl RobustVideoMatting {
    /// Load an RVM ONNX model on the given backend.
    ///
    /// GPU backends keep the CPU provider registered as a fallback.
    pub fn new<P: AsRef<Path>>(model_path: P, backend: Backend) -> Result<Self> {
        let path = model_path.as_ref();

        tracing::info!("Loading RVM model from {} on {}", path.display(), backend.label());

        let providers: Vec<ExecutionProviderDispatch> = match backend {
            Backend::Cpu { .. } => vec![CPUExecutionProvider::default().build()],
            Backend::Cuda { device_id } => vec![
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CPUExecutionProvider::default().build(),
            ],
            Backend::TensorRt { device_id } => vec![
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CPUExecutionProvider::default().build(),
            ],
        };

        let mut builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_execution_providers(providers)?;
        if let Backend::Cpu { threads } = backend {
            builder = builder.with_intra_threads(threads)?;
        }

        let session = builder
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;

        tracing::info!("RVM model loaded successfully");

        Ok(Self { session, backend })
    }
}

fn to_tensor(array: &ArrayD<f32>) -> Result<Tensor<f32>> {
    let shape: Vec<i64> = array.shape().iter().map(|&d| d as i64).collect();
    let data: Vec<f32> = array.iter().copied().collect();
    Ok(Tensor::from_array((shape, data))?)
}

impl MattingSession for RobustVideoMatting {
    fn infer(
        &mut self,
        src: &DownsampledTensor,
        state: &RecurrentState,
        downsample_ratio: f32,
    ) -> Result<InferenceOutput> {
        let _span = tracing::debug_span!("rvm_infer").entered();

        let src = to_tensor(&src.clone().into_dyn())?;
        let [r1, r2, r3, r4] = state.slots();
        let ratio = Tensor::from_array((vec![1i64], vec![downsample_ratio]))?;

        let outputs = self
            .session
            .run(ort::inputs![
                "src" => src,
                STATE_INPUTS[0] => to_tensor(r1)?,
                STATE_INPUTS[1] => to_tensor(r2)?,
                STATE_INPUTS[2] => to_tensor(r3)?,
                STATE_INPUTS[3] => to_tensor(r4)?,
                "downsample_ratio" => ratio
            ])
            .context("Failed to run inference")?;

        let mut raw = Vec::new();
        for (name, value) in outputs.iter() {
            let (shape, data) = value
                .try_extract_tensor::<f32>()
                .with_context(|| format!("Output {name} is not an f32 tensor"))?;
            raw.push(RawOutput {
                name: name.to_string(),
                shape: shape.iter().map(|&d| d.max(0) as usize).collect(),
                data: data.to_vec(),
            });
        }

        split_outputs(raw)
    }

    fn backend_label(&self) -> String {
        self.backend.label()
    }
}

/// One output tensor copied out of the session.
#[derive(Debug, Clone)]
pub(crate) struct RawOutput {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl RawOutput {
    /// Matte height and width when this looks like a single-channel 4D tensor.
    fn matte_dims(&self) -> Option<(usize, usize)> {
        match self.shape.as_slice() {
            [1, 1, h, w] => Some((*h, *w)),
            [1, h, w, 1] => Some((*h, *w)),
            _ => None,
        }
    }

    fn is_foreground(&self) -> bool {
        matches!(self.shape.as_slice(), [1, 3, _, _] | [1, _, _, 3])
    }

    fn into_array(self) -> Result<ArrayD<f32>> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data)
            .with_context(|| format!("Output {} has inconsistent shape", self.name))
    }
}

/// Map raw session outputs to a matte and the next recurrent state.
///
/// Outputs named `r1o`..`r4o` map to slots in that order. Models that do not
/// name them fall back to sorting the four remaining outputs by size, largest
/// first; that ordering is model specific and is only a best guess.
pub(crate) fn split_outputs(mut raw: Vec<RawOutput>) -> Result<InferenceOutput> {
    let pha_idx = raw
        .iter()
        .position(|o| o.name == "pha")
        .or_else(|| raw.iter().position(|o| o.matte_dims().is_some()))
        .ok_or_else(|| anyhow!("Model produced no alpha matte output"))?;
    let pha = raw.remove(pha_idx);
    let (h, w) = pha
        .matte_dims()
        .ok_or_else(|| anyhow!("Alpha matte has unexpected shape {:?}", pha.shape))?;
    let matte = Matte::from_shape_vec((h, w), pha.data).context("Alpha matte size mismatch")?;

    let named: Vec<Option<usize>> = STATE_OUTPUTS
        .iter()
        .map(|n| raw.iter().position(|o| o.name == *n))
        .collect();

    let mut ordered: Vec<RawOutput> = if named.iter().all(Option::is_some) {
        let mut slots: Vec<Option<RawOutput>> = raw.into_iter().map(Some).collect();
        named
            .into_iter()
            .flatten()
            .filter_map(|i| slots[i].take())
            .collect()
    } else {
        let mut rest: Vec<RawOutput> = raw
            .into_iter()
            .filter(|o| o.name != "fgr" && !o.is_foreground())
            .collect();
        if rest.len() != 4 {
            bail!("Expected 4 recurrent outputs, found {}", rest.len());
        }
        tracing::debug!("Recurrent outputs are unnamed, ordering them by size");
        rest.sort_by_key(|o| std::cmp::Reverse(o.data.len()));
        rest
    };

    if ordered.len() != 4 {
        bail!("Expected 4 recurrent outputs, found {}", ordered.len());
    }
    let r4 = ordered.pop().map(RawOutput::into_array).transpose()?;
    let r3 = ordered.pop().map(RawOutput::into_array).transpose()?;
    let r2 = ordered.pop().map(RawOutput::into_array).transpose()?;
    let r1 = ordered.pop().map(RawOutput::into_array).transpose()?;
    let (Some(r1), Some(r2), Some(r3), Some(r4)) = (r1, r2, r3, r4) else {
        bail!("Recurrent outputs missing");
    };

    Ok(InferenceOutput {
        matte,
        state: RecurrentState::from_slots([r1, r2, r3, r4]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(name: &str, shape: &[usize], fill: f32) -> RawOutput {
        let len = shape.iter().product();
        RawOutput {
            name: name.to_string(),
            shape: shape.to_vec(),
            data: vec![fill; len],
        }
    }

    #[test]
    fn maps_named_outputs_in_fixed_order() {
        let raw = vec![
            output("fgr", &[1, 3, 4, 4], 0.0),
            output("r3o", &[1, 40, 1, 1], 3.0),
            output("pha", &[1, 1, 4, 4], 0.5),
            output("r1o", &[1, 16, 2, 2], 1.0),
            output("r4o", &[1, 64, 1, 1], 4.0),
            output("r2o", &[1, 20, 1, 1], 2.0),
        ];
        let out = split_outputs(raw).unwrap();

        assert_eq!(out.matte.dim(), (4, 4));
        assert!(out.matte.iter().all(|&v| v == 0.5));
        for (i, slot) in out.state.slots().iter().enumerate() {
            assert!(slot.iter().all(|&v| v == (i + 1) as f32));
        }
    }

    #[test]
    fn falls_back_to_size_ordering_for_unnamed_outputs() {
        let raw = vec![
            output("out0", &[1, 4, 4, 3], 0.0),
            output("out1", &[1, 4, 4, 1], 0.25),
            output("out2", &[1, 2, 2, 8], 3.0),
            output("out3", &[1, 8, 8, 8], 1.0),
            output("out4", &[1, 1, 1, 8], 4.0),
            output("out5", &[1, 4, 4, 8], 2.0),
        ];
        let out = split_outputs(raw).unwrap();

        assert_eq!(out.matte.dim(), (4, 4));
        let shapes = out.state.shapes();
        assert_eq!(shapes[0], vec![1, 8, 8, 8]);
        assert_eq!(shapes[3], vec![1, 1, 1, 8]);
    }

    #[test]
    fn rejects_missing_matte() {
        let raw = vec![output("r1o", &[1, 16, 2, 2], 0.0)];
        assert!(split_outputs(raw).is_err());
    }

    #[test]
    fn rejects_missing_state() {
        let raw = vec![
            output("pha", &[1, 1, 2, 2], 0.0),
            output("r1o", &[1, 16, 2, 2], 0.0),
        ];
        assert!(split_outputs(raw).is_err());
    }
}
