use std::collections::VecDeque;
use std::time::Duration;

/// Tuning parameters the consumer loop reads before every poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    pub poll_timeout: Duration,
    pub max_batch: usize,
}

/// Rails and step sizes for the adaptive controller.
#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub window_size: usize,
    pub threshold_high: Duration,
    pub threshold_low: Duration,
    pub poll_timeout_min: Duration,
    pub poll_timeout_max: Duration,
    pub poll_timeout_step: Duration,
    pub batch_size_min: usize,
    pub batch_size_max: usize,
    pub batch_size_step: usize,
}

/// Retunes `(poll_timeout, max_batch)` from observed end-to-end latency.
///
/// The median of a sliding sample window is compared against two thresholds.
/// Above the high threshold the controller trades throughput for relief
/// (smaller batches, longer polls); below the low threshold it does the
/// opposite. Between them it holds, which is what keeps it from
/// oscillating. Moves are a single step per sample and outputs are always
/// clamped to the configured rails.
pub struct AdaptiveController {
    settings: ControllerSettings,
    samples: VecDeque<Duration>,
    current: Tuning,
}

impl AdaptiveController {
    pub fn new(settings: ControllerSettings, initial: Tuning) -> Self {
        let current = Tuning {
            poll_timeout: initial
                .poll_timeout
                .clamp(settings.poll_timeout_min, settings.poll_timeout_max),
            max_batch: initial
                .max_batch
                .clamp(settings.batch_size_min, settings.batch_size_max),
        };
        Self {
            settings,
            samples: VecDeque::with_capacity(settings.window_size.max(1)),
            current,
        }
    }

    pub fn tuning(&self) -> Tuning {
        self.current
    }

    /// Record one end-to-end latency sample and retune.
    pub fn record_sample(&mut self, sample: Duration) {
        if self.samples.len() == self.settings.window_size.max(1) {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);

        let median = self.median();
        if median > self.settings.threshold_high {
            self.current.max_batch = self
                .current
                .max_batch
                .saturating_sub(self.settings.batch_size_step)
                .max(self.settings.batch_size_min);
            self.current.poll_timeout = (self.current.poll_timeout
                + self.settings.poll_timeout_step)
                .min(self.settings.poll_timeout_max);
        } else if median < self.settings.threshold_low {
            self.current.max_batch = (self.current.max_batch + self.settings.batch_size_step)
                .min(self.settings.batch_size_max);
            self.current.poll_timeout = self
                .current
                .poll_timeout
                .saturating_sub(self.settings.poll_timeout_step)
                .max(self.settings.poll_timeout_min);
        }
    }

    fn median(&self) -> Duration {
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2
        } else {
            sorted[mid]
        }
    }
}
