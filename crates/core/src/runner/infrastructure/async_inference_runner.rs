//! Non-blocking front end over one inference backend.
//!
//! At most one frame is in flight. The caller polls from its control loop:
//! `start_if_idle` hands a resized copy of a frame to the worker thread and
//! `collect_results` picks up the detections once they are ready, mapped
//! back to the original frame's coordinates.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::inference::domain::backend_error::BackendError;
use crate::inference::domain::inference_backend::InferenceBackend;
use crate::inference::infrastructure::backend_factory::create_backend;
use crate::runner::domain::runner_state::RunnerState;
use crate::shared::config::{BackendConfig, ConfigError};
use crate::shared::detection::{rescale_all, Detection, ScaleFactors};
use crate::shared::frame::Frame;
use crate::shared::throttled_log::ThrottledLog;

use super::inference_worker::{InferenceWorker, PendingTask};

const DROPPED_FRAME_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("cannot prepare cache directory {path}: {source}")]
    CacheDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("runner is already initialized")]
    AlreadyInitialized,
    #[error("runner failed to initialize earlier and cannot be reused")]
    PermanentlyFailed,
    #[error("failed to spawn inference worker: {0}")]
    WorkerSpawn(#[source] io::Error),
}

struct InFlight {
    task: PendingTask,
    scale: ScaleFactors,
}

struct Active {
    worker: InferenceWorker,
    input_size: (u32, u32),
    requires_color: bool,
    pending: Option<InFlight>,
}

enum Lifecycle {
    Uninitialized,
    Failed,
    Ready(Active),
}

pub struct AsyncInferenceRunner {
    lifecycle: Lifecycle,
    colorless_frames: ThrottledLog,
    unusable_frames: ThrottledLog,
}

impl AsyncInferenceRunner {
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::Uninitialized,
            colorless_frames: ThrottledLog::new(DROPPED_FRAME_LOG_INTERVAL),
            unusable_frames: ThrottledLog::new(DROPPED_FRAME_LOG_INTERVAL),
        }
    }

    /// Builds the backend named by `config`, loads its model from
    /// `model_dir` and starts the worker thread.
    ///
    /// Any failure is permanent for this runner.
    pub fn init(
        &mut self,
        model_dir: &Path,
        cache_dir: &Path,
        config: &serde_json::Value,
    ) -> Result<(), RunnerError> {
        self.ensure_uninitialized()?;
        let result = BackendConfig::from_value(config)
            .map_err(RunnerError::from)
            .and_then(|cfg| {
                let backend = create_backend(cfg.backend, cache_dir)?;
                Self::activate(backend, model_dir, cache_dir, &cfg)
            });
        self.finish_init(result)
    }

    /// Like [`init`](Self::init) with an already constructed backend; the
    /// config's `backend` key is ignored.
    pub fn init_with_backend(
        &mut self,
        backend: Box<dyn InferenceBackend>,
        model_dir: &Path,
        cache_dir: &Path,
        config: &serde_json::Value,
    ) -> Result<(), RunnerError> {
        self.ensure_uninitialized()?;
        let result = BackendConfig::from_value(config)
            .map_err(RunnerError::from)
            .and_then(|cfg| Self::activate(backend, model_dir, cache_dir, &cfg));
        self.finish_init(result)
    }

    fn ensure_uninitialized(&self) -> Result<(), RunnerError> {
        match self.lifecycle {
            Lifecycle::Uninitialized => Ok(()),
            Lifecycle::Failed => Err(RunnerError::PermanentlyFailed),
            Lifecycle::Ready(_) => Err(RunnerError::AlreadyInitialized),
        }
    }

    fn finish_init(&mut self, result: Result<Active, RunnerError>) -> Result<(), RunnerError> {
        match result {
            Ok(active) => {
                self.lifecycle = Lifecycle::Ready(active);
                Ok(())
            }
            Err(e) => {
                log::error!("Inference runner failed to initialize: {e}");
                self.lifecycle = Lifecycle::Failed;
                Err(e)
            }
        }
    }

    fn activate(
        mut backend: Box<dyn InferenceBackend>,
        model_dir: &Path,
        cache_dir: &Path,
        config: &BackendConfig,
    ) -> Result<Active, RunnerError> {
        if backend.uses_cache_dir() {
            reset_cache_dir(cache_dir)?;
        }
        backend.load_model(model_dir, config)?;

        let input_size = config.input_size();
        let requires_color = backend.requires_color();
        let worker = InferenceWorker::spawn(backend).map_err(RunnerError::WorkerSpawn)?;
        log::info!(
            "Inference runner ready: {} backend, input {}x{}",
            worker.backend_name(),
            input_size.0,
            input_size.1
        );
        Ok(Active {
            worker,
            input_size,
            requires_color,
            pending: None,
        })
    }

    /// Submits a resized copy of `frame` if no task is outstanding.
    ///
    /// Returns `false` without side effects when the runner is not ready,
    /// busy, or the frame cannot be used by the backend.
    pub fn start_if_idle(&mut self, frame: &Frame) -> bool {
        let Lifecycle::Ready(active) = &mut self.lifecycle else {
            return false;
        };
        if active.pending.is_some() {
            return false;
        }
        if active.requires_color && !frame.has_color() {
            if let Some(suppressed) = self.colorless_frames.hit() {
                log::debug!(
                    "Skipping frame without colour data ({} channel(s)); {suppressed} more since last report",
                    frame.channels()
                );
            }
            return false;
        }

        let (w, h) = active.input_size;
        let resized = if frame.width() == 0 || frame.height() == 0 {
            None
        } else {
            frame.resized(w, h)
        };
        let Some(resized) = resized else {
            if let Some(suppressed) = self.unusable_frames.hit() {
                log::debug!(
                    "Skipping unusable {}x{}x{} frame; {suppressed} more since last report",
                    frame.width(),
                    frame.height(),
                    frame.channels()
                );
            }
            return false;
        };

        let scale = ScaleFactors::between((frame.width(), frame.height()), (w, h));
        match active.worker.submit(resized) {
            Some(task) => {
                active.pending = Some(InFlight { task, scale });
                true
            }
            None => false,
        }
    }

    /// Non-blocking. `true` exactly once per submitted frame, when its task
    /// has finished; `out` is then replaced with the detections in original
    /// frame coordinates, or cleared if inference failed. `false` leaves
    /// `out` untouched.
    pub fn collect_results(&mut self, out: &mut Vec<Detection>) -> bool {
        let Lifecycle::Ready(active) = &mut self.lifecycle else {
            return false;
        };
        let Some(in_flight) = active.pending.as_ref() else {
            return false;
        };
        let Some(outcome) = in_flight.task.poll() else {
            return false;
        };
        let scale = in_flight.scale;
        active.pending = None;

        match outcome {
            Ok(detections) => *out = rescale_all(&detections, scale),
            Err(e) => {
                log::warn!("{} inference failed: {e}", active.worker.backend_name());
                out.clear();
            }
        }
        true
    }

    pub fn state(&self) -> RunnerState {
        match &self.lifecycle {
            Lifecycle::Uninitialized => RunnerState::Uninitialized,
            Lifecycle::Failed => RunnerState::Failed,
            Lifecycle::Ready(active) => match &active.pending {
                None => RunnerState::Idle,
                Some(in_flight) if in_flight.task.is_finished() => RunnerState::ResultReady,
                Some(_) => RunnerState::Running,
            },
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Ready(_))
    }

    /// Processing resolution, once initialized.
    pub fn input_size(&self) -> Option<(u32, u32)> {
        match &self.lifecycle {
            Lifecycle::Ready(active) => Some(active.input_size),
            _ => None,
        }
    }
}

impl Default for AsyncInferenceRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn reset_cache_dir(dir: &Path) -> Result<(), RunnerError> {
    let cache_err = |source: io::Error| RunnerError::CacheDir {
        path: dir.to_path_buf(),
        source,
    };
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(cache_err(e)),
    }
    fs::create_dir_all(dir).map_err(cache_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::detection::{Location, NormalizedPoint, PixelRect};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;
    use tempfile::TempDir;

    #[derive(Default, Clone)]
    struct Calls {
        runs: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<(u32, u32, u64)>>>,
    }

    enum Reply {
        Detections(Vec<Detection>),
        Fail,
        Panic,
    }

    struct FakeBackend {
        reply: Reply,
        gate: Option<crossbeam_channel::Receiver<()>>,
        fail_load: bool,
        color: bool,
        cache: bool,
        calls: Calls,
    }

    impl FakeBackend {
        fn new(reply: Reply) -> Self {
            Self {
                reply,
                gate: None,
                fail_load: false,
                color: true,
                cache: false,
                calls: Calls::default(),
            }
        }
    }

    impl InferenceBackend for FakeBackend {
        fn name(&self) -> &str {
            "fake"
        }

        fn load_model(&mut self, _dir: &Path, _config: &BackendConfig) -> Result<(), BackendError> {
            if self.fail_load {
                return Err(BackendError::ModelNotFound {
                    graph: "missing".into(),
                    dir: PathBuf::from("models"),
                });
            }
            Ok(())
        }

        fn run(&mut self, frame: &Frame) -> Result<Vec<Detection>, BackendError> {
            if let Some(gate) = &self.gate {
                let _ = gate.recv();
            }
            self.calls.runs.fetch_add(1, Ordering::SeqCst);
            self.calls
                .seen
                .lock()
                .unwrap()
                .push((frame.width(), frame.height(), frame.timestamp_ms()));
            match &self.reply {
                Reply::Detections(d) => Ok(d.clone()),
                Reply::Fail => Err(BackendError::Inference("boom".into())),
                Reply::Panic => panic!("backend exploded"),
            }
        }

        fn requires_color(&self) -> bool {
            self.color
        }

        fn uses_cache_dir(&self) -> bool {
            self.cache
        }
    }

    fn config(w: u32, h: u32) -> serde_json::Value {
        json!({
            "mode": "detection",
            "input_width": w,
            "input_height": h,
            "min_score": 0.5,
            "top_K": 10
        })
    }

    fn color_frame(w: u32, h: u32, ts: u64) -> Frame {
        Frame::new(vec![128u8; (w * h * 3) as usize], w, h, 3, ts)
    }

    fn rect_detection(score: f32, label: &str, x: i32, y: i32, w: i32, h: i32) -> Detection {
        Detection::new(
            0,
            score,
            label,
            Location::Rect(PixelRect::new(x, y, w, h).unwrap()),
        )
    }

    fn ready(backend: FakeBackend, w: u32, h: u32) -> (AsyncInferenceRunner, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut runner = AsyncInferenceRunner::new();
        runner
            .init_with_backend(
                Box::new(backend),
                tmp.path(),
                &tmp.path().join("cache"),
                &config(w, h),
            )
            .unwrap();
        (runner, tmp)
    }

    fn collect_within(runner: &mut AsyncInferenceRunner, out: &mut Vec<Detection>) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if runner.collect_results(out) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_uninitialized_runner_refuses_everything() {
        let mut runner = AsyncInferenceRunner::new();
        let mut out = vec![rect_detection(0.9, "keep", 0, 0, 1, 1)];
        assert_eq!(runner.state(), RunnerState::Uninitialized);
        assert!(!runner.is_initialized());
        assert!(runner.input_size().is_none());
        assert!(!runner.start_if_idle(&color_frame(4, 4, 0)));
        assert!(!runner.collect_results(&mut out));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_single_slot_while_running() {
        let (gate_tx, gate_rx) = crossbeam_channel::bounded(1);
        let mut backend = FakeBackend::new(Reply::Detections(vec![rect_detection(
            0.9, "cube", 1, 1, 2, 2,
        )]));
        backend.gate = Some(gate_rx);
        let calls = backend.calls.clone();
        let (mut runner, _tmp) = ready(backend, 10, 10);

        assert_eq!(runner.state(), RunnerState::Idle);
        assert!(runner.start_if_idle(&color_frame(10, 10, 1)));
        assert_eq!(runner.state(), RunnerState::Running);

        for ts in 2..6 {
            assert!(!runner.start_if_idle(&color_frame(10, 10, ts)));
        }
        let mut out = vec![rect_detection(0.7, "previous", 0, 0, 1, 1)];
        assert!(!runner.collect_results(&mut out));
        assert_eq!(out[0].label, "previous");

        gate_tx.send(()).unwrap();
        assert!(collect_within(&mut runner, &mut out));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].label, "cube");
        assert_eq!(runner.state(), RunnerState::Idle);
        assert_eq!(calls.runs.load(Ordering::SeqCst), 1);
        assert_eq!(calls.seen.lock().unwrap()[0].2, 1);
    }

    #[test]
    fn test_result_ready_until_collected() {
        let (mut runner, _tmp) = ready(FakeBackend::new(Reply::Detections(Vec::new())), 4, 4);
        assert!(runner.start_if_idle(&color_frame(4, 4, 0)));

        let deadline = Instant::now() + Duration::from_secs(5);
        while runner.state() != RunnerState::ResultReady {
            assert!(Instant::now() < deadline, "task never finished");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!runner.start_if_idle(&color_frame(4, 4, 1)));

        let mut out = Vec::new();
        assert!(runner.collect_results(&mut out));
        assert_eq!(runner.state(), RunnerState::Idle);
    }

    #[test]
    fn test_scores_and_order_pass_through() {
        let detections = vec![
            rect_detection(0.9, "first", 0, 0, 4, 4),
            rect_detection(0.6, "third", 2, 2, 4, 4),
        ];
        let (mut runner, _tmp) = ready(FakeBackend::new(Reply::Detections(detections)), 8, 8);
        assert!(runner.start_if_idle(&color_frame(8, 8, 0)));
        let mut out = Vec::new();
        assert!(collect_within(&mut runner, &mut out));
        let labels: Vec<&str> = out.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["first", "third"]);
    }

    #[test]
    fn test_results_are_rescaled_to_original_frame() {
        let backend = FakeBackend::new(Reply::Detections(vec![
            rect_detection(0.9, "box", 100, 100, 50, 50),
            Detection::new(0, 0.8, "scene", Location::Point(NormalizedPoint::WHOLE_IMAGE)),
        ]));
        let calls = backend.calls.clone();
        let (mut runner, _tmp) = ready(backend, 300, 300);
        assert_eq!(runner.input_size(), Some((300, 300)));

        assert!(runner.start_if_idle(&color_frame(640, 480, 99)));
        let mut out = Vec::new();
        assert!(collect_within(&mut runner, &mut out));

        assert_eq!(calls.seen.lock().unwrap()[0], (300, 300, 99));
        match out[0].location {
            Location::Rect(r) => assert_eq!((r.x(), r.y(), r.width(), r.height()), (213, 160, 107, 80)),
            Location::Point(_) => panic!("expected a rect"),
        }
        assert_eq!(out[1].location, Location::Point(NormalizedPoint::WHOLE_IMAGE));
    }

    #[test]
    fn test_rescale_happens_once() {
        let backend = FakeBackend::new(Reply::Detections(vec![rect_detection(0.9, "box", 10, 10, 10, 10)]));
        let (mut runner, _tmp) = ready(backend, 100, 100);
        assert!(runner.start_if_idle(&color_frame(200, 200, 0)));

        let mut out = Vec::new();
        assert!(collect_within(&mut runner, &mut out));
        let first = out.clone();
        for _ in 0..5 {
            assert!(!runner.collect_results(&mut out));
        }
        assert_eq!(out, first);
        match out[0].location {
            Location::Rect(r) => assert_eq!((r.x(), r.width()), (20, 20)),
            Location::Point(_) => panic!("expected a rect"),
        }
    }

    #[test]
    fn test_backend_error_returns_to_idle_with_empty_results() {
        let (mut runner, _tmp) = ready(FakeBackend::new(Reply::Fail), 4, 4);
        assert!(runner.start_if_idle(&color_frame(4, 4, 0)));

        let mut out = vec![rect_detection(0.9, "stale", 0, 0, 1, 1)];
        assert!(collect_within(&mut runner, &mut out));
        assert!(out.is_empty());
        assert_eq!(runner.state(), RunnerState::Idle);
        assert!(runner.start_if_idle(&color_frame(4, 4, 1)));
    }

    #[test]
    fn test_backend_panic_releases_slot() {
        let (mut runner, _tmp) = ready(FakeBackend::new(Reply::Panic), 4, 4);
        assert!(runner.start_if_idle(&color_frame(4, 4, 0)));

        let mut out = vec![rect_detection(0.9, "stale", 0, 0, 1, 1)];
        assert!(collect_within(&mut runner, &mut out));
        assert!(out.is_empty());
        assert!(runner.start_if_idle(&color_frame(4, 4, 1)));
    }

    #[rstest::rstest]
    #[case::color_backend(true, false)]
    #[case::gray_backend(false, true)]
    fn test_gray_frames_only_for_backends_without_color(
        #[case] requires_color: bool,
        #[case] accepted: bool,
    ) {
        let mut backend = FakeBackend::new(Reply::Detections(Vec::new()));
        backend.color = requires_color;
        let (mut runner, _tmp) = ready(backend, 4, 4);
        let gray = Frame::new(vec![0u8; 64], 8, 8, 1, 0);
        assert_eq!(runner.start_if_idle(&gray), accepted);
        if accepted {
            let mut out = Vec::new();
            assert!(collect_within(&mut runner, &mut out));
        } else {
            assert_eq!(runner.state(), RunnerState::Idle);
        }
    }

    #[test]
    fn test_empty_frame_is_refused() {
        let (mut runner, _tmp) = ready(FakeBackend::new(Reply::Detections(Vec::new())), 4, 4);
        assert!(!runner.start_if_idle(&Frame::new(Vec::new(), 0, 0, 3, 0)));
        assert_eq!(runner.state(), RunnerState::Idle);
    }

    #[test]
    fn test_refusal_kinds_are_throttled_separately() {
        let (mut runner, _tmp) = ready(FakeBackend::new(Reply::Detections(Vec::new())), 4, 4);
        let gray = Frame::new(vec![0u8; 64], 8, 8, 1, 0);
        assert!(!runner.start_if_idle(&gray));
        assert!(!runner.start_if_idle(&gray));

        assert!(runner.colorless_frames.hit().is_none());
        assert_eq!(runner.unusable_frames.hit(), Some(0));
    }

    #[test]
    fn test_failed_load_is_permanent() {
        let tmp = TempDir::new().unwrap();
        let mut backend = FakeBackend::new(Reply::Detections(Vec::new()));
        backend.fail_load = true;
        let mut runner = AsyncInferenceRunner::new();

        let first = runner.init_with_backend(Box::new(backend), tmp.path(), tmp.path(), &config(4, 4));
        assert!(matches!(first, Err(RunnerError::Backend(BackendError::ModelNotFound { .. }))));
        assert_eq!(runner.state(), RunnerState::Failed);

        let retry = runner.init_with_backend(
            Box::new(FakeBackend::new(Reply::Detections(Vec::new()))),
            tmp.path(),
            tmp.path(),
            &config(4, 4),
        );
        assert!(matches!(retry, Err(RunnerError::PermanentlyFailed)));
        assert!(!runner.start_if_idle(&color_frame(4, 4, 0)));
    }

    #[test]
    fn test_missing_input_size_fails_init() {
        let tmp = TempDir::new().unwrap();
        let mut runner = AsyncInferenceRunner::new();
        let result = runner.init_with_backend(
            Box::new(FakeBackend::new(Reply::Detections(Vec::new()))),
            tmp.path(),
            tmp.path(),
            &json!({"mode": "detection", "min_score": 0.5, "top_K": 1}),
        );
        assert!(matches!(
            result,
            Err(RunnerError::Config(ConfigError::MissingKey("input_width")))
        ));
        assert_eq!(runner.state(), RunnerState::Failed);
    }

    #[test]
    fn test_second_init_is_rejected() {
        let (mut runner, tmp) = ready(FakeBackend::new(Reply::Detections(Vec::new())), 4, 4);
        let again = runner.init_with_backend(
            Box::new(FakeBackend::new(Reply::Detections(Vec::new()))),
            tmp.path(),
            tmp.path(),
            &config(4, 4),
        );
        assert!(matches!(again, Err(RunnerError::AlreadyInitialized)));
        assert!(runner.is_initialized());
    }

    #[test]
    fn test_cache_dir_is_reset_for_backends_that_use_it() {
        let tmp = TempDir::new().unwrap();
        let cache = tmp.path().join("cache");
        fs::create_dir_all(cache.join("nested")).unwrap();
        fs::write(cache.join("objectDetectionResults.json"), b"{}").unwrap();

        let mut backend = FakeBackend::new(Reply::Detections(Vec::new()));
        backend.cache = true;
        let mut runner = AsyncInferenceRunner::new();
        runner
            .init_with_backend(Box::new(backend), tmp.path(), &cache, &config(4, 4))
            .unwrap();

        assert!(cache.is_dir());
        assert_eq!(fs::read_dir(&cache).unwrap().count(), 0);
    }

    #[test]
    fn test_cache_dir_untouched_for_in_process_backends() {
        let tmp = TempDir::new().unwrap();
        let cache = tmp.path().join("cache");
        fs::create_dir_all(&cache).unwrap();
        fs::write(cache.join("keep.txt"), b"x").unwrap();

        let mut runner = AsyncInferenceRunner::new();
        runner
            .init_with_backend(
                Box::new(FakeBackend::new(Reply::Detections(Vec::new()))),
                tmp.path(),
                &cache,
                &config(4, 4),
            )
            .unwrap();
        assert!(cache.join("keep.txt").exists());
    }

    #[test]
    fn test_init_reports_unknown_backend() {
        let tmp = TempDir::new().unwrap();
        let mut runner = AsyncInferenceRunner::new();
        let mut cfg = config(4, 4);
        cfg["backend"] = json!("tpu");
        let result = runner.init(tmp.path(), tmp.path(), &cfg);
        assert!(matches!(
            result,
            Err(RunnerError::Config(ConfigError::UnknownBackend(_)))
        ));
        assert_eq!(runner.state(), RunnerState::Failed);
    }

    #[test]
    fn test_drop_joins_in_flight_task() {
        let backend = FakeBackend::new(Reply::Detections(Vec::new()));
        let calls = backend.calls.clone();
        let (mut runner, _tmp) = ready(backend, 4, 4);
        assert!(runner.start_if_idle(&color_frame(4, 4, 0)));
        drop(runner);
        assert_eq!(calls.runs.load(Ordering::SeqCst), 1);
    }
}
