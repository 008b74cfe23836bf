//! In-process inference through an ONNX Runtime session.
//!
//! The model file is resolved inside the model directory by filename
//! convention, inference runs directly on the calling thread, and outputs
//! are decoded as SSD detections or as a single classification.

use std::fs;
use std::path::{Path, PathBuf};

use crate::inference::domain::backend_error::BackendError;
use crate::inference::domain::inference_backend::InferenceBackend;
use crate::shared::config::{BackendConfig, Mode, Normalization};
use crate::shared::constants::{ONNX_EXTENSION, ORT_EXTENSION};
use crate::shared::detection::Detection;
use crate::shared::frame::Frame;
use crate::shared::label_table::LabelTable;

use super::onnx_session::{self, ComplexityReport};
use super::tensor_codec::{build_input_blob, OutputDecoder};

/// On-disk model format, selected from the `graph` filename.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelFormat {
    /// ONNX protobuf (`*.onnx`).
    Onnx,
    /// ONNX Runtime flatbuffer (`*.ort`), pre-optimized for the runtime.
    OrtFlatbuffer,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelFile {
    pub path: PathBuf,
    pub format: ModelFormat,
}

/// Resolve `graph` inside `model_dir`.
///
/// A `graph` ending in `.onnx` names an ONNX file directly. Without that
/// extension, a companion `<graph>.ort` file selects the flatbuffer format,
/// and `<graph>.onnx` is tried next.
pub fn locate_model(model_dir: &Path, graph: &str) -> Result<ModelFile, BackendError> {
    let direct = model_dir.join(graph);
    let has_onnx_ext = direct
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ONNX_EXTENSION));

    let candidates: Vec<ModelFile> = if has_onnx_ext {
        vec![ModelFile {
            path: direct,
            format: ModelFormat::Onnx,
        }]
    } else {
        vec![
            ModelFile {
                path: model_dir.join(format!("{graph}.{ORT_EXTENSION}")),
                format: ModelFormat::OrtFlatbuffer,
            },
            ModelFile {
                path: model_dir.join(format!("{graph}.{ONNX_EXTENSION}")),
                format: ModelFormat::Onnx,
            },
        ]
    };

    candidates
        .into_iter()
        .find(|c| c.path.is_file())
        .ok_or_else(|| BackendError::ModelNotFound {
            graph: graph.to_string(),
            dir: model_dir.to_path_buf(),
        })
}

/// Load the label table named by the config, relative to `model_dir`.
pub(crate) fn load_labels(model_dir: &Path, config: &BackendConfig) -> Result<LabelTable, BackendError> {
    let path = model_dir.join(config.require_labels()?);
    LabelTable::load(&path).map_err(|source| BackendError::Labels { path, source })
}

struct LoadedModel {
    session: ort::session::Session,
    normalization: Normalization,
    decoder: OutputDecoder,
}

/// Backend running an ONNX model in-process.
pub struct OnnxBackend {
    model: Option<LoadedModel>,
}

impl OnnxBackend {
    pub fn new() -> Self {
        Self { model: None }
    }
}

impl Default for OnnxBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for OnnxBackend {
    fn name(&self) -> &str {
        "onnx"
    }

    fn load_model(&mut self, model_dir: &Path, config: &BackendConfig) -> Result<(), BackendError> {
        let graph = config.require_graph()?;
        let (normalization, top_k) = match config.mode {
            Mode::Classification => (config.require_normalization()?, 1),
            Mode::Detection => (config.normalization(), config.require_top_k()?),
        };
        let labels = load_labels(model_dir, config)?;
        let model_file = locate_model(model_dir, graph)?;

        let session = onnx_session::session_from_file(&model_file.path)?;
        let (w, h) = config.input_size();
        if let Some(declared) = onnx_session::declared_input_size(&session) {
            if declared != (w, h) {
                log::warn!(
                    "Model {} declares input {}x{} but config requests {w}x{h}",
                    model_file.path.display(),
                    declared.0,
                    declared.1
                );
            }
        }

        let graph_bytes = fs::metadata(&model_file.path)
            .map_err(|e| BackendError::io(&model_file.path, e))?
            .len();
        log::info!(
            "Loaded {:?} model {} ({} labels, {} mode): {}",
            model_file.format,
            model_file.path.display(),
            labels.len(),
            config.mode,
            ComplexityReport::estimate(graph_bytes, w, h)
        );

        self.model = Some(LoadedModel {
            session,
            normalization,
            decoder: OutputDecoder {
                mode: config.mode,
                min_score: config.min_score,
                top_k,
                labels,
            },
        });
        Ok(())
    }

    fn run(&mut self, frame: &Frame) -> Result<Vec<Detection>, BackendError> {
        let model = self.model.as_mut().ok_or(BackendError::NotLoaded)?;
        let blob = build_input_blob(frame, &model.normalization);
        let output = onnx_session::run_first_output(&mut model.session, blob)?;
        model.decoder.decode(&output, frame)
    }
}
