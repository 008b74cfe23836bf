use std::path::PathBuf;

use thiserror::Error;

use crate::shared::config::ConfigError;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to read label file {path}: {source}")]
    Labels {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no model named `{graph}` in {dir}")]
    ModelNotFound { graph: String, dir: PathBuf },
    #[error("failed to load model {path}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("unexpected model output: {0}")]
    UnexpectedOutput(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("backend used before a model was loaded")]
    NotLoaded,
    #[error("backend panicked: {0}")]
    Panicked(String),
    #[error("this binary was built without an embedded compiled graph")]
    CompiledGraphUnavailable,
}

impl BackendError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackendError::Io {
            path: path.into(),
            source,
        }
    }
}
