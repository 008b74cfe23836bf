use std::time::{Duration, Instant};

/// Rate limiter for diagnostics about conditions that can fire every tick.
///
/// [`ThrottledLog::hit`] returns `Some(suppressed)` at most once per
/// `interval`, where `suppressed` counts the hits swallowed since the last
/// emitted message.
#[derive(Debug)]
pub struct ThrottledLog {
    interval: Duration,
    last_emit: Option<Instant>,
    suppressed: u64,
}

impl ThrottledLog {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            suppressed: 0,
        }
    }

    pub fn hit(&mut self) -> Option<u64> {
        self.hit_at(Instant::now())
    }

    fn hit_at(&mut self, now: Instant) -> Option<u64> {
        let due = self
            .last_emit
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if due {
            self.last_emit = Some(now);
            Some(std::mem::take(&mut self.suppressed))
        } else {
            self.suppressed += 1;
            None
        }
    }
}
