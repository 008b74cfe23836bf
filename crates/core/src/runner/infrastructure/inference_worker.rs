//! Dedicated thread that owns one backend and runs one frame at a time.

use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};

use crate::inference::domain::backend_error::BackendError;
use crate::inference::domain::inference_backend::InferenceBackend;
use crate::shared::detection::Detection;
use crate::shared::frame::Frame;

pub type InferenceOutcome = Result<Vec<Detection>, BackendError>;

struct Job {
    frame: Frame,
    reply: Sender<InferenceOutcome>,
}

enum Settled {
    Pending,
    Ready(InferenceOutcome),
    Taken,
}

/// Handle to one submitted frame. Yields its outcome exactly once.
pub struct PendingTask {
    reply: Receiver<InferenceOutcome>,
    settled: RefCell<Settled>,
}

impl PendingTask {
    fn new(reply: Receiver<InferenceOutcome>) -> Self {
        Self {
            reply,
            settled: RefCell::new(Settled::Pending),
        }
    }

    /// Non-blocking: `None` while the backend is still running, and after the
    /// outcome has been taken.
    pub fn poll(&self) -> Option<InferenceOutcome> {
        self.settle();
        let mut settled = self.settled.borrow_mut();
        match std::mem::replace(&mut *settled, Settled::Taken) {
            Settled::Ready(outcome) => Some(outcome),
            other => {
                *settled = other;
                None
            }
        }
    }

    /// True once an outcome is ready, including a worker that went away.
    /// Does not consume the outcome.
    pub fn is_finished(&self) -> bool {
        self.settle();
        matches!(*self.settled.borrow(), Settled::Ready(_))
    }

    fn settle(&self) {
        let mut settled = self.settled.borrow_mut();
        if !matches!(*settled, Settled::Pending) {
            return;
        }
        match self.reply.try_recv() {
            Ok(outcome) => *settled = Settled::Ready(outcome),
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                *settled = Settled::Ready(Err(BackendError::Panicked(
                    "inference worker exited without replying".into(),
                )))
            }
        }
    }
}

pub struct InferenceWorker {
    jobs: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
    backend_name: String,
}

impl InferenceWorker {
    /// Moves `backend` onto a new named thread.
    pub fn spawn(backend: Box<dyn InferenceBackend>) -> io::Result<Self> {
        let backend_name = backend.name().to_string();
        let (job_tx, job_rx) = crossbeam_channel::bounded::<Job>(1);
        let handle = std::thread::Builder::new()
            .name(format!("inference-{backend_name}"))
            .spawn(move || run_jobs(backend, job_rx))?;
        Ok(Self {
            jobs: Some(job_tx),
            handle: Some(handle),
            backend_name,
        })
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    /// Hands `frame` to the worker without blocking.
    ///
    /// `None` if the worker still holds an unstarted job or has exited.
    pub fn submit(&self, frame: Frame) -> Option<PendingTask> {
        let jobs = self.jobs.as_ref()?;
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        match jobs.try_send(Job {
            frame,
            reply: reply_tx,
        }) {
            Ok(()) => Some(PendingTask::new(reply_rx)),
            Err(TrySendError::Full(_)) => {
                log::warn!("{} worker is still busy; frame not submitted", self.backend_name);
                None
            }
            Err(TrySendError::Disconnected(_)) => {
                log::error!("{} worker has exited", self.backend_name);
                None
            }
        }
    }
}

impl Drop for InferenceWorker {
    /// Closes the job channel and waits for any in-flight job to finish.
    fn drop(&mut self) {
        drop(self.jobs.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("{} worker thread panicked", self.backend_name);
            }
        }
    }
}

fn run_jobs(mut backend: Box<dyn InferenceBackend>, jobs: Receiver<Job>) {
    for job in jobs {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| backend.run(&job.frame)))
            .unwrap_or_else(|payload| Err(BackendError::Panicked(panic_message(&*payload))));
        // The runner may have been dropped mid-task; nobody is listening then.
        let _ = job.reply.send(outcome);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::config::BackendConfig;
    use crate::shared::detection::{Location, NormalizedPoint};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    enum Behavior {
        Echo,
        Fail,
        Panic,
        Block(Receiver<()>),
    }

    struct FakeBackend {
        behavior: Behavior,
        runs: Arc<AtomicUsize>,
    }

    impl FakeBackend {
        fn boxed(behavior: Behavior) -> (Box<dyn InferenceBackend>, Arc<AtomicUsize>) {
            let runs = Arc::new(AtomicUsize::new(0));
            let backend = FakeBackend {
                behavior,
                runs: runs.clone(),
            };
            (Box::new(backend), runs)
        }
    }

    impl InferenceBackend for FakeBackend {
        fn name(&self) -> &str {
            "fake"
        }

        fn load_model(&mut self, _dir: &Path, _config: &BackendConfig) -> Result<(), BackendError> {
            Ok(())
        }

        fn run(&mut self, frame: &Frame) -> Result<Vec<Detection>, BackendError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Echo => Ok(vec![Detection::new(
                    frame.timestamp_ms(),
                    0.8,
                    "echo",
                    Location::Point(NormalizedPoint::WHOLE_IMAGE),
                )]),
                Behavior::Fail => Err(BackendError::Inference("boom".into())),
                Behavior::Panic => panic!("backend exploded"),
                Behavior::Block(gate) => {
                    let _ = gate.recv();
                    Ok(Vec::new())
                }
            }
        }
    }

    fn frame(ts: u64) -> Frame {
        Frame::new(vec![0u8; 12], 2, 2, 3, ts)
    }

    fn wait(task: &PendingTask) -> InferenceOutcome {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(outcome) = task.poll() {
                return outcome;
            }
            assert!(Instant::now() < deadline, "task never finished");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_outcome_is_delivered_once() {
        let (backend, runs) = FakeBackend::boxed(Behavior::Echo);
        let worker = InferenceWorker::spawn(backend).unwrap();
        assert_eq!(worker.backend_name(), "fake");

        let task = worker.submit(frame(42)).unwrap();
        let detections = wait(&task).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].timestamp_ms, 42);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backend_error_is_returned() {
        let (backend, _) = FakeBackend::boxed(Behavior::Fail);
        let worker = InferenceWorker::spawn(backend).unwrap();
        let task = worker.submit(frame(0)).unwrap();
        assert!(matches!(wait(&task), Err(BackendError::Inference(_))));
    }

    #[test]
    fn test_panic_is_caught_and_worker_survives() {
        let (backend, runs) = FakeBackend::boxed(Behavior::Panic);
        let worker = InferenceWorker::spawn(backend).unwrap();

        let task = worker.submit(frame(0)).unwrap();
        match wait(&task) {
            Err(BackendError::Panicked(msg)) => assert!(msg.contains("backend exploded")),
            other => panic!("expected a panic report, got {other:?}"),
        }

        let task = worker.submit(frame(1)).unwrap();
        assert!(matches!(wait(&task), Err(BackendError::Panicked(_))));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_is_finished_tracks_completion() {
        let (gate_tx, gate_rx) = crossbeam_channel::bounded(1);
        let (backend, _) = FakeBackend::boxed(Behavior::Block(gate_rx));
        let worker = InferenceWorker::spawn(backend).unwrap();

        let task = worker.submit(frame(0)).unwrap();
        assert!(!task.is_finished());
        assert!(task.poll().is_none());

        gate_tx.send(()).unwrap();
        assert!(wait(&task).unwrap().is_empty());
    }

    #[test]
    fn test_vanished_worker_counts_as_finished() {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded::<InferenceOutcome>(1);
        let task = PendingTask::new(reply_rx);
        assert!(!task.is_finished());

        drop(reply_tx);
        assert!(task.is_finished());
        assert!(matches!(task.poll(), Some(Err(BackendError::Panicked(_)))));
        assert!(task.poll().is_none());
    }

    #[test]
    fn test_is_finished_keeps_the_outcome_for_poll() {
        let (backend, _) = FakeBackend::boxed(Behavior::Echo);
        let worker = InferenceWorker::spawn(backend).unwrap();
        let task = worker.submit(frame(9)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !task.is_finished() {
            assert!(Instant::now() < deadline, "task never finished");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(task.is_finished());
        let detections = task.poll().unwrap().unwrap();
        assert_eq!(detections[0].timestamp_ms, 9);
        assert!(task.poll().is_none());
    }

    #[test]
    fn test_drop_waits_for_in_flight_job() {
        let (gate_tx, gate_rx) = crossbeam_channel::bounded(1);
        let (backend, runs) = FakeBackend::boxed(Behavior::Block(gate_rx));
        let worker = InferenceWorker::spawn(backend).unwrap();
        let _task = worker.submit(frame(0)).unwrap();

        let release = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            gate_tx.send(()).unwrap();
        });
        drop(worker);
        release.join().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
