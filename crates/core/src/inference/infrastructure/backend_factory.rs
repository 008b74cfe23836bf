use std::path::Path;

use crate::inference::domain::backend_error::BackendError;
use crate::inference::domain::inference_backend::InferenceBackend;
use crate::shared::config::BackendKind;

use super::compiled_backend::CompiledBackend;
use super::messenger_backend::MessengerBackend;
use super::onnx_backend::OnnxBackend;

/// Creates the backend selected by the config's `backend` key.
///
/// The compiled variant is only available in binaries built with the
/// `compiled-model` feature. Logs which variant is selected.
pub fn create_backend(
    kind: BackendKind,
    cache_dir: &Path,
) -> Result<Box<dyn InferenceBackend>, BackendError> {
    let backend: Box<dyn InferenceBackend> = match kind {
        BackendKind::Onnx => Box::new(OnnxBackend::new()),
        BackendKind::Compiled => Box::new(CompiledBackend::embedded()?),
        BackendKind::Messenger => Box::new(MessengerBackend::new(cache_dir)),
    };
    log::info!("Using {} inference backend", backend.name());
    Ok(backend)
}
