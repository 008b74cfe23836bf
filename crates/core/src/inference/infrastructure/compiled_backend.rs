//! Backend whose network graph is baked into the binary.
//!
//! Only pre/post-processing (normalization, labels, score floor) is
//! configurable; the graph itself is fixed at build time. Classification
//! only.

use std::path::Path;

use crate::inference::domain::backend_error::BackendError;
use crate::inference::domain::inference_backend::InferenceBackend;
use crate::shared::config::{BackendConfig, ConfigError, Mode, Normalization};
use crate::shared::detection::Detection;
use crate::shared::frame::Frame;

use super::onnx_backend::load_labels;
use super::onnx_session::{self, ComplexityReport};
use super::tensor_codec::{build_input_blob, OutputDecoder};

#[cfg(feature = "compiled-model")]
static EMBEDDED_GRAPH: &[u8] = include_bytes!(env!("ROBOVISION_COMPILED_MODEL"));

/// The graph embedded at build time, if this binary carries one.
pub fn embedded_graph() -> Option<&'static [u8]> {
    #[cfg(feature = "compiled-model")]
    {
        Some(EMBEDDED_GRAPH)
    }
    #[cfg(not(feature = "compiled-model"))]
    {
        None
    }
}

struct LoadedGraph {
    session: ort::session::Session,
    normalization: Normalization,
    decoder: OutputDecoder,
}

pub struct CompiledBackend {
    graph: &'static [u8],
    loaded: Option<LoadedGraph>,
}

impl CompiledBackend {
    pub fn new(graph: &'static [u8]) -> Self {
        Self {
            graph,
            loaded: None,
        }
    }

    /// Backend over the build-time embedded graph.
    pub fn embedded() -> Result<Self, BackendError> {
        embedded_graph()
            .map(Self::new)
            .ok_or(BackendError::CompiledGraphUnavailable)
    }
}

impl InferenceBackend for CompiledBackend {
    fn name(&self) -> &str {
        "compiled"
    }

    fn load_model(&mut self, model_dir: &Path, config: &BackendConfig) -> Result<(), BackendError> {
        if config.mode == Mode::Detection {
            return Err(ConfigError::DetectionUnsupported("compiled").into());
        }
        let normalization = config.require_normalization()?;
        let labels = load_labels(model_dir, config)?;
        let session = onnx_session::session_from_memory(self.graph)?;

        let (w, h) = config.input_size();
        log::info!(
            "Loaded compiled graph ({} labels): {}",
            labels.len(),
            ComplexityReport::estimate(self.graph.len() as u64, w, h)
        );

        self.loaded = Some(LoadedGraph {
            session,
            normalization,
            decoder: OutputDecoder {
                mode: Mode::Classification,
                min_score: config.min_score,
                top_k: 1,
                labels,
            },
        });
        Ok(())
    }

    fn run(&mut self, frame: &Frame) -> Result<Vec<Detection>, BackendError> {
        let loaded = self.loaded.as_mut().ok_or(BackendError::NotLoaded)?;
        let blob = build_input_blob(frame, &loaded.normalization);
        let output = onnx_session::run_first_output(&mut loaded.session, blob)?;
        loaded.decoder.decode(&output, frame)
    }
}
