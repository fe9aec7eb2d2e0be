use std::time::Instant;

/// Monotonic time source, abstracted so breaker timing can be driven by a
/// fake clock in tests.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
