//! ONNX Runtime session plumbing shared by the ONNX and compiled backends.

use std::fmt;
use std::path::Path;

use ndarray::Array4;

use crate::inference::domain::backend_error::BackendError;

/// Return the preferred ONNX execution providers for the current platform.
///
/// ONNX Runtime falls back to CPU if the platform-specific provider is
/// unavailable.
pub fn preferred_execution_providers() -> Vec<ort::execution_providers::ExecutionProviderDispatch> {
    #[cfg(target_os = "macos")]
    {
        vec![ort::execution_providers::CoreMLExecutionProvider::default().build()]
    }
    #[cfg(target_os = "windows")]
    {
        vec![ort::execution_providers::DirectMLExecutionProvider::default().build()]
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        vec![]
    }
}

fn load_error<E: fmt::Display>(origin: &str) -> impl FnOnce(E) -> BackendError + '_ {
    move |e| BackendError::ModelLoad {
        path: origin.into(),
        reason: e.to_string(),
    }
}

fn inference_error<E: fmt::Display>(e: E) -> BackendError {
    BackendError::Inference(e.to_string())
}

/// Build a session from an `.onnx` or `.ort` file.
pub fn session_from_file(path: &Path) -> Result<ort::session::Session, BackendError> {
    let origin = path.display().to_string();
    ort::session::Session::builder()
        .map_err(load_error(&origin))?
        .with_execution_providers(preferred_execution_providers())
        .map_err(load_error(&origin))?
        .commit_from_file(path)
        .map_err(load_error(&origin))
}

/// Build a session from a model graph held in memory.
pub fn session_from_memory(graph: &[u8]) -> Result<ort::session::Session, BackendError> {
    let origin = "<embedded graph>";
    ort::session::Session::builder()
        .map_err(load_error(origin))?
        .with_execution_providers(preferred_execution_providers())
        .map_err(load_error(origin))?
        .commit_from_memory(graph)
        .map_err(load_error(origin))
}

/// Spatial input size declared by the model (NCHW), if static.
pub fn declared_input_size(session: &ort::session::Session) -> Option<(u32, u32)> {
    session.inputs().first().and_then(|input| {
        if let ort::value::ValueType::Tensor { ref shape, .. } = input.dtype() {
            if shape.len() >= 4 && shape[2] > 0 && shape[3] > 0 {
                Some((shape[3] as u32, shape[2] as u32))
            } else {
                None
            }
        } else {
            None
        }
    })
}

/// First model output, flattened.
pub struct RawOutput {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Run a single-input model and return its first output.
pub fn run_first_output(
    session: &mut ort::session::Session,
    blob: Array4<f32>,
) -> Result<RawOutput, BackendError> {
    let input_value = ort::value::Tensor::from_array(blob).map_err(inference_error)?;
    let outputs = session
        .run(ort::inputs![input_value])
        .map_err(inference_error)?;
    if outputs.len() == 0 {
        return Err(BackendError::UnexpectedOutput(
            "model produced no outputs".into(),
        ));
    }
    let tensor = outputs[0]
        .try_extract_array::<f32>()
        .map_err(inference_error)?;
    Ok(RawOutput {
        shape: tensor.shape().to_vec(),
        data: tensor.iter().copied().collect(),
    })
}

/// Rough cost of one forward pass, reported once at load time.
///
/// The parameter count is estimated from the serialized graph size assuming
/// f32 weights; every weight takes part in at least one multiply-add, which
/// gives a lower bound on operations per inference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComplexityReport {
    pub input_width: u32,
    pub input_height: u32,
    pub parameters: u64,
}

impl ComplexityReport {
    pub fn estimate(graph_bytes: u64, input_width: u32, input_height: u32) -> Self {
        Self {
            input_width,
            input_height,
            parameters: graph_bytes / 4,
        }
    }

    pub fn input_elements(&self) -> u64 {
        3 * self.input_width as u64 * self.input_height as u64
    }

    pub fn min_operations(&self) -> u64 {
        2 * self.parameters
    }
}

impl fmt::Display for ComplexityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "input {}x{} ({} elements), ~{:.2}M parameters, >= {:.1} MFLOP per inference",
            self.input_width,
            self.input_height,
            self.input_elements(),
            self.parameters as f64 / 1e6,
            self.min_operations() as f64 / 1e6
        )
    }
}
