//! Filesystem handoff between this process and an out-of-process inference
//! worker, rooted at one cache directory.
//!
//! Request: the frame is encoded to `temp.png`, its timestamp written to
//! `timestamp.txt`, and only then is `temp.png` renamed to
//! `objectDetectionImage.png`. The rename is the publish barrier: the worker
//! never sees a partially written request.
//!
//! Response: the worker writes `objectDetectionResults.json`, which is polled
//! for until it appears or a timeout elapses.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use image::{ColorType, ImageFormat};
use serde::{Deserialize, Serialize};

use crate::inference::domain::backend_error::BackendError;
use crate::shared::constants::{
    HANDOFF_REQUEST_IMAGE, HANDOFF_RESULTS, HANDOFF_TEMP_IMAGE, HANDOFF_TIMESTAMP,
};
use crate::shared::frame::Frame;

/// Response document written by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultDocument {
    #[serde(alias = "salientPoints")]
    pub objects: Vec<ResultObject>,
}

/// One detected object; coordinates are fractions of image width/height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultObject {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
    pub score: f32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

pub fn parse_results(bytes: &[u8]) -> Result<ResultDocument, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Outcome of waiting for the worker.
#[derive(Debug)]
pub enum PollOutcome {
    Answered(ResultDocument),
    TimedOut,
    Malformed(serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct HandoffDir {
    root: PathBuf,
}

impl HandoffDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn temp_image(&self) -> PathBuf {
        self.root.join(HANDOFF_TEMP_IMAGE)
    }

    pub fn request_image(&self) -> PathBuf {
        self.root.join(HANDOFF_REQUEST_IMAGE)
    }

    pub fn timestamp_file(&self) -> PathBuf {
        self.root.join(HANDOFF_TIMESTAMP)
    }

    pub fn results_file(&self) -> PathBuf {
        self.root.join(HANDOFF_RESULTS)
    }

    /// Publish `frame` as the current request.
    pub fn publish(&self, frame: &Frame) -> Result<(), BackendError> {
        // A late answer to an abandoned request must not satisfy this one.
        remove_if_present(&self.results_file());

        let temp = self.temp_image();
        let color = match frame.channels() {
            1 => ColorType::L8,
            3 => ColorType::Rgb8,
            n => {
                return Err(BackendError::UnexpectedOutput(format!(
                    "cannot encode a {n}-channel frame"
                )))
            }
        };
        image::save_buffer_with_format(
            &temp,
            frame.data(),
            frame.width(),
            frame.height(),
            color,
            ImageFormat::Png,
        )?;

        let timestamp = self.timestamp_file();
        fs::write(&timestamp, frame.timestamp_ms().to_string())
            .map_err(|e| BackendError::io(&timestamp, e))?;

        let request = self.request_image();
        fs::rename(&temp, &request).map_err(|e| BackendError::io(&request, e))
    }

    /// Sleep `poll_period` between checks for the results file, up to `timeout`.
    ///
    /// A results file that is present but fails to parse as truncated JSON is
    /// treated as still being written and polled again while time remains.
    pub fn await_results(&self, poll_period: Duration, timeout: Duration) -> PollOutcome {
        let results = self.results_file();
        let started = Instant::now();
        loop {
            thread::sleep(poll_period);
            let elapsed = started.elapsed();
            match fs::read(&results) {
                Ok(bytes) => match parse_results(&bytes) {
                    Ok(doc) => return PollOutcome::Answered(doc),
                    Err(e) if e.is_eof() && elapsed < timeout => {}
                    Err(e) => return PollOutcome::Malformed(e),
                },
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    log::warn!("Cannot read {}: {e}", results.display());
                }
            }
            if elapsed >= timeout {
                return PollOutcome::TimedOut;
            }
        }
    }

    /// Remove every artifact of the current exchange, present or not.
    pub fn clear_exchange(&self) {
        for path in [
            self.request_image(),
            self.results_file(),
            self.temp_image(),
            self.timestamp_file(),
        ] {
            remove_if_present(&path);
        }
    }
}

fn remove_if_present(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            log::warn!("Failed to remove {}: {e}", path.display());
        }
    }
}
