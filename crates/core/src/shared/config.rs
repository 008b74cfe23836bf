//! Backend configuration, parsed once from a JSON key/value document and
//! immutable afterwards.
//!
//! Parsing validates what every backend needs (input size, mode, score
//! floor). Keys that only some backends need are checked by the backend at
//! load time through the `require_*` accessors.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Polls the messenger backend makes before giving up when no explicit
/// `timeout_ms` is configured.
pub const DEFAULT_MESSENGER_POLLS: u32 = 20;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required config key `{0}`")]
    MissingKey(&'static str),
    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("min_score must lie in [0, 1], got {0}")]
    MinScoreOutOfRange(f32),
    #[error("unknown mode `{0}` (expected `classification` or `detection`)")]
    UnknownMode(String),
    #[error("unknown backend `{0}` (expected `onnx`, `compiled` or `messenger`)")]
    UnknownBackend(String),
    #[error("{0} backend does not support detection mode")]
    DetectionUnsupported(&'static str),
    #[error("config document is malformed: {0}")]
    Parse(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Classification,
    Detection,
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classification" => Ok(Mode::Classification),
            "detection" => Ok(Mode::Detection),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Classification => write!(f, "classification"),
            Mode::Detection => write!(f, "detection"),
        }
    }
}

/// Which inference backend a runner builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Onnx,
    Compiled,
    Messenger,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "onnx" => Ok(BackendKind::Onnx),
            "compiled" => Ok(BackendKind::Compiled),
            "messenger" => Ok(BackendKind::Messenger),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

/// Per-channel input normalization: `(pixel - mean[c]) / std`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: f32,
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            mean: [0.0; 3],
            std: 1.0,
        }
    }
}

#[derive(Deserialize)]
struct RawConfig {
    backend: Option<String>,
    mode: Option<String>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    min_score: Option<f32>,
    #[serde(rename = "top_K")]
    top_k: Option<usize>,
    graph: Option<String>,
    labels: Option<PathBuf>,
    #[serde(rename = "input_mean_R")]
    input_mean_r: Option<f32>,
    #[serde(rename = "input_mean_G")]
    input_mean_g: Option<f32>,
    #[serde(rename = "input_mean_B")]
    input_mean_b: Option<f32>,
    input_std: Option<f32>,
    poll_period_ms: Option<u64>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    pub backend: BackendKind,
    pub mode: Mode,
    pub input_width: u32,
    pub input_height: u32,
    pub min_score: f32,
    pub top_k: Option<usize>,
    pub graph: Option<String>,
    pub labels: Option<PathBuf>,
    input_mean: [Option<f32>; 3],
    input_std: Option<f32>,
    pub poll_period: Option<Duration>,
    pub timeout: Option<Duration>,
}

impl BackendConfig {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ConfigError> {
        let raw = RawConfig::deserialize(value).map_err(ConfigError::Parse)?;

        let backend = match raw.backend.as_deref() {
            Some(name) => name.parse()?,
            None => BackendKind::Onnx,
        };
        let mode: Mode = raw.mode.as_deref().ok_or(ConfigError::MissingKey("mode"))?.parse()?;

        let input_width = raw.input_width.ok_or(ConfigError::MissingKey("input_width"))?;
        let input_height = raw.input_height.ok_or(ConfigError::MissingKey("input_height"))?;
        if input_width == 0 || input_height == 0 {
            return Err(ConfigError::InvalidValue {
                key: "input_width/input_height",
                reason: format!("input size must be positive, got {input_width}x{input_height}"),
            });
        }

        let min_score = raw.min_score.ok_or(ConfigError::MissingKey("min_score"))?;
        if !(0.0..=1.0).contains(&min_score) {
            return Err(ConfigError::MinScoreOutOfRange(min_score));
        }

        if mode == Mode::Detection {
            match raw.top_k {
                None => return Err(ConfigError::MissingKey("top_K")),
                Some(0) => {
                    return Err(ConfigError::InvalidValue {
                        key: "top_K",
                        reason: "must be at least 1".into(),
                    })
                }
                Some(_) => {}
            }
        }

        if raw.input_std == Some(0.0) {
            return Err(ConfigError::InvalidValue {
                key: "input_std",
                reason: "must be non-zero".into(),
            });
        }

        if raw.poll_period_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "poll_period_ms",
                reason: "must be at least 1".into(),
            });
        }

        Ok(Self {
            backend,
            mode,
            input_width,
            input_height,
            min_score,
            top_k: raw.top_k,
            graph: raw.graph,
            labels: raw.labels,
            input_mean: [raw.input_mean_r, raw.input_mean_g, raw.input_mean_b],
            input_std: raw.input_std,
            poll_period: raw.poll_period_ms.map(Duration::from_millis),
            timeout: raw.timeout_ms.map(Duration::from_millis),
        })
    }

    pub fn input_size(&self) -> (u32, u32) {
        (self.input_width, self.input_height)
    }

    /// Normalization with unset parameters defaulted to identity.
    pub fn normalization(&self) -> Normalization {
        let defaults = Normalization::default();
        Normalization {
            mean: [
                self.input_mean[0].unwrap_or(defaults.mean[0]),
                self.input_mean[1].unwrap_or(defaults.mean[1]),
                self.input_mean[2].unwrap_or(defaults.mean[2]),
            ],
            std: self.input_std.unwrap_or(defaults.std),
        }
    }

    /// Normalization where every parameter must be given explicitly.
    pub fn require_normalization(&self) -> Result<Normalization, ConfigError> {
        let keys = ["input_mean_R", "input_mean_G", "input_mean_B"];
        let mut mean = [0.0; 3];
        for (slot, (value, key)) in mean.iter_mut().zip(self.input_mean.iter().zip(keys)) {
            *slot = value.ok_or(ConfigError::MissingKey(key))?;
        }
        let std = self.input_std.ok_or(ConfigError::MissingKey("input_std"))?;
        Ok(Normalization { mean, std })
    }

    pub fn require_graph(&self) -> Result<&str, ConfigError> {
        self.graph.as_deref().ok_or(ConfigError::MissingKey("graph"))
    }

    pub fn require_labels(&self) -> Result<&PathBuf, ConfigError> {
        self.labels.as_ref().ok_or(ConfigError::MissingKey("labels"))
    }

    pub fn require_top_k(&self) -> Result<usize, ConfigError> {
        self.top_k.ok_or(ConfigError::MissingKey("top_K"))
    }

    pub fn require_poll_period(&self) -> Result<Duration, ConfigError> {
        self.poll_period.ok_or(ConfigError::MissingKey("poll_period_ms"))
    }

    /// How long the messenger waits for a result before giving up.
    pub fn messenger_timeout(&self) -> Result<Duration, ConfigError> {
        match self.timeout {
            Some(t) => Ok(t),
            None => Ok(self.require_poll_period()? * DEFAULT_MESSENGER_POLLS),
        }
    }
}
