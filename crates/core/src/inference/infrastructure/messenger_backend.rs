//! Backend that delegates inference to an out-of-process worker through the
//! cache directory.
//!
//! Each call publishes one request, blocks polling for the worker's answer,
//! and removes every handoff file before returning. No answer within the
//! timeout, or an unreadable answer, yields zero detections.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::inference::domain::backend_error::BackendError;
use crate::inference::domain::inference_backend::InferenceBackend;
use crate::shared::config::BackendConfig;
use crate::shared::detection::{Detection, Location, PixelRect};
use crate::shared::frame::Frame;

use super::file_handoff::{HandoffDir, PollOutcome, ResultDocument};

#[derive(Clone, Copy, Debug)]
struct Exchange {
    poll_period: Duration,
    timeout: Duration,
    min_score: f32,
    top_k: Option<usize>,
}

pub struct MessengerBackend {
    handoff: HandoffDir,
    exchange: Option<Exchange>,
}

impl MessengerBackend {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            handoff: HandoffDir::new(cache_dir),
            exchange: None,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        self.handoff.root()
    }
}

impl InferenceBackend for MessengerBackend {
    fn name(&self) -> &str {
        "messenger"
    }

    fn load_model(&mut self, model_dir: &Path, config: &BackendConfig) -> Result<(), BackendError> {
        let poll_period = config.require_poll_period()?;
        let timeout = config.messenger_timeout()?;
        log::info!(
            "Messenger worker exchange at {} (poll {:?}, timeout {:?}); model directory {} is owned by the worker",
            self.handoff.root().display(),
            poll_period,
            timeout,
            model_dir.display()
        );
        self.exchange = Some(Exchange {
            poll_period,
            timeout,
            min_score: config.min_score,
            top_k: config.top_k,
        });
        Ok(())
    }

    fn run(&mut self, frame: &Frame) -> Result<Vec<Detection>, BackendError> {
        let exchange = self.exchange.ok_or(BackendError::NotLoaded)?;

        if let Err(e) = self.handoff.publish(frame) {
            self.handoff.clear_exchange();
            return Err(e);
        }
        let outcome = self
            .handoff
            .await_results(exchange.poll_period, exchange.timeout);
        self.handoff.clear_exchange();

        match outcome {
            PollOutcome::Answered(doc) => Ok(to_detections(&doc, frame, &exchange)),
            PollOutcome::TimedOut => {
                log::debug!(
                    "No worker answer for frame {} within {:?}",
                    frame.timestamp_ms(),
                    exchange.timeout
                );
                Ok(Vec::new())
            }
            PollOutcome::Malformed(e) => {
                log::warn!("Discarding malformed worker answer: {e}");
                Ok(Vec::new())
            }
        }
    }

    fn requires_color(&self) -> bool {
        false
    }

    fn uses_cache_dir(&self) -> bool {
        true
    }
}

/// Convert worker fractions to pixel rects at the frame's resolution.
fn to_detections(doc: &ResultDocument, frame: &Frame, exchange: &Exchange) -> Vec<Detection> {
    let timestamp = frame.timestamp_ms();
    let limit = exchange.top_k.unwrap_or(usize::MAX);
    doc.objects
        .iter()
        .filter(|obj| !obj.score.is_nan() && obj.score >= exchange.min_score)
        .filter(|obj| match obj.timestamp {
            Some(t) if t != timestamp => {
                log::debug!("Ignoring object answered for frame {t}, expected {timestamp}");
                false
            }
            _ => true,
        })
        .filter_map(|obj| {
            let rect = PixelRect::from_normalized_corners(
                obj.xmin.clamp(0.0, 1.0),
                obj.ymin.clamp(0.0, 1.0),
                obj.xmax.clamp(0.0, 1.0),
                obj.ymax.clamp(0.0, 1.0),
                frame.width(),
                frame.height(),
            )?;
            Some(Detection::new(
                timestamp,
                obj.score.min(1.0),
                obj.name.clone(),
                Location::Rect(rect),
            ))
        })
        .take(limit)
        .collect()
}
