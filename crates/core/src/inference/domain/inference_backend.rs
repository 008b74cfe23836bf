use std::path::Path;

use crate::inference::domain::backend_error::BackendError;
use crate::shared::config::BackendConfig;
use crate::shared::detection::Detection;
use crate::shared::frame::Frame;

/// Domain interface for a pluggable inference engine.
///
/// `run` is synchronous and may take hundreds of milliseconds; callers that
/// must not block hand the backend to a runner, which drives it from a
/// dedicated worker thread.
pub trait InferenceBackend: Send {
    /// Short name for diagnostics.
    fn name(&self) -> &str;

    /// Loads model files from `model_dir` and captures the configuration.
    fn load_model(&mut self, model_dir: &Path, config: &BackendConfig) -> Result<(), BackendError>;

    /// Runs one inference on a frame already at the configured input size.
    ///
    /// Returned locations are in the frame's coordinate space and scores
    /// are at or above the configured `min_score`.
    fn run(&mut self, frame: &Frame) -> Result<Vec<Detection>, BackendError>;

    /// Whether `run` needs RGB input.
    fn requires_color(&self) -> bool {
        true
    }

    /// Whether the backend exchanges data through the runner's cache directory.
    fn uses_cache_dir(&self) -> bool {
        false
    }
}
