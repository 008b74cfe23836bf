/// Observable state of an inference runner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunnerState {
    /// `init` has not succeeded yet.
    Uninitialized,
    /// Loading failed; the runner never becomes usable.
    Failed,
    /// No task outstanding; the next frame is accepted.
    Idle,
    /// A frame is being processed.
    Running,
    /// The task finished but its results have not been collected.
    ResultReady,
}

impl RunnerState {
    /// Whether `start_if_idle` would accept a frame.
    pub fn accepts_frames(self) -> bool {
        self == RunnerState::Idle
    }
}
