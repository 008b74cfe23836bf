use std::thread;
use std::time::{Duration, Instant};

use crate::pipeline::detection_sink::DetectionSink;
use crate::runner::infrastructure::async_inference_runner::AsyncInferenceRunner;
use crate::shared::detection::Detection;
use crate::shared::frame::Frame;

const DRAIN_POLL: Duration = Duration::from_millis(1);

/// Running totals for one perception stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DetectionStats {
    pub frames_offered: u64,
    pub frames_submitted: u64,
    pub batches_published: u64,
    pub detections_published: u64,
}

impl DetectionStats {
    /// Frames offered while the runner was busy or could not use them.
    pub fn frames_skipped(&self) -> u64 {
        self.frames_offered - self.frames_submitted
    }
}

/// Perception stage driven once per control tick: collect → publish → start.
///
/// Never blocks inside `tick`; the latest collected batch stays available
/// through [`latest`](Self::latest) until the next one replaces it.
pub struct DetectObjectsUseCase {
    runner: AsyncInferenceRunner,
    sink: Box<dyn DetectionSink>,
    latest: Vec<Detection>,
    stats: DetectionStats,
}

impl DetectObjectsUseCase {
    pub fn new(runner: AsyncInferenceRunner, sink: Box<dyn DetectionSink>) -> Self {
        Self {
            runner,
            sink,
            latest: Vec::new(),
            stats: DetectionStats::default(),
        }
    }

    /// Runs one tick. Returns `true` if a batch was published.
    ///
    /// Collecting first frees the slot so `frame` can be submitted in the
    /// same tick the previous result arrived.
    pub fn tick(&mut self, frame: Option<&Frame>) -> bool {
        let published = self.collect();
        if let Some(frame) = frame {
            self.stats.frames_offered += 1;
            if self.runner.start_if_idle(frame) {
                self.stats.frames_submitted += 1;
            }
        }
        published
    }

    /// Waits up to `timeout` for the outstanding task, if any, and publishes
    /// its batch.
    pub fn drain(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.collect() {
                return true;
            }
            if self.runner.state().accepts_frames() || Instant::now() >= deadline {
                return false;
            }
            thread::sleep(DRAIN_POLL);
        }
    }

    fn collect(&mut self) -> bool {
        if !self.runner.collect_results(&mut self.latest) {
            return false;
        }
        self.stats.batches_published += 1;
        self.stats.detections_published += self.latest.len() as u64;
        self.sink.publish(&self.latest);
        true
    }

    pub fn latest(&self) -> &[Detection] {
        &self.latest
    }

    pub fn stats(&self) -> DetectionStats {
        self.stats
    }

    pub fn runner(&self) -> &AsyncInferenceRunner {
        &self.runner
    }
}
