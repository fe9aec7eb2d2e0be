use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::clock::Clock;

/// Current position of the breaker state machine. Exported as a gauge, so
/// the discriminants are stable: closed = 0, open = 1, half-open = 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_gauge(&self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::Open => 1.0,
            BreakerState::HalfOpen => 2.0,
        }
    }
}

/// Verdict returned by [`CircuitBreaker::allow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Proceed,
    Reject,
}

/// A circuit breaker guarding the database writer.
///
/// The breaker is not a rate limiter: it only gates. While open, no call is
/// admitted until `reset_timeout` has elapsed; then exactly one probe runs
/// at a time. A probe that fails to report within `half_open_timeout` is
/// presumed lost and its slot is re-armed.
///
/// Only the writer mutates this state (hence plain `&mut self` methods);
/// everything else observes it through the exported gauge.
pub struct CircuitBreaker {
    state: BreakerState,
    failures: u32,
    failure_threshold: u32,
    reset_timeout: Duration,
    half_open_timeout: Duration,
    opened_at_millis: u64,
    probe_started_millis: Option<u64>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(
        failure_threshold: u32,
        reset_timeout: Duration,
        half_open_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            half_open_timeout,
            opened_at_millis: 0,
            probe_started_millis: None,
            clock,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Gate a call. Open breakers reject until `reset_timeout` has elapsed,
    /// at which point the caller is admitted as the half-open probe.
    pub fn allow(&mut self) -> Gate {
        match self.state {
            BreakerState::Closed => Gate::Proceed,
            BreakerState::Open => {
                let now = self.clock.now_millis();
                let elapsed = now.saturating_sub(self.opened_at_millis);
                if elapsed >= self.reset_timeout.as_millis() as u64 {
                    info!("circuit breaker half-open, admitting probe");
                    self.state = BreakerState::HalfOpen;
                    self.probe_started_millis = Some(now);
                    Gate::Proceed
                } else {
                    Gate::Reject
                }
            }
            BreakerState::HalfOpen => {
                let now = self.clock.now_millis();
                match self.probe_started_millis {
                    // Probe still in flight and within its deadline.
                    Some(started)
                        if now.saturating_sub(started)
                            < self.half_open_timeout.as_millis() as u64 =>
                    {
                        Gate::Reject
                    }
                    // Probe lost or never started: re-arm the slot.
                    _ => {
                        warn!("circuit breaker probe timed out, admitting a new probe");
                        self.probe_started_millis = Some(now);
                        Gate::Proceed
                    }
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            BreakerState::HalfOpen => {
                info!("circuit breaker probe succeeded, closing");
                self.state = BreakerState::Closed;
                self.failures = 0;
                self.probe_started_millis = None;
            }
            BreakerState::Closed => {
                self.failures = 0;
            }
            // A success while open can only come from a call admitted before
            // the breaker tripped; the next allow() still applies the timer.
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        match self.state {
            BreakerState::Closed => {
                self.failures += 1;
                if self.failures >= self.failure_threshold {
                    warn!(
                        failures = self.failures,
                        "circuit breaker tripped, rejecting database calls"
                    );
                    self.open();
                }
            }
            BreakerState::HalfOpen => {
                warn!("circuit breaker probe failed, reopening");
                self.open();
            }
            BreakerState::Open => {
                // Restart the timer: a straggler failure means the backend
                // is still down.
                self.opened_at_millis = self.clock.now_millis();
            }
        }
    }

    fn open(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at_millis = self.clock.now_millis();
        self.probe_started_millis = None;
    }
}
