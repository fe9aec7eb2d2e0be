use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::candle::{outcome_for, CandleOutcome};
use crate::kafka::ConsumedRecord;

/// A sealed batch on its way to the writer.
///
/// `offsets` holds the highest offset covered per partition; committing
/// them is only legal once the batch has been durably written (or every
/// entry in it was poison).
#[derive(Debug)]
pub struct Batch {
    pub outcomes: Vec<CandleOutcome>,
    pub offsets: HashMap<i32, i64>,
    pub earliest_broker_timestamp: Option<DateTime<Utc>>,
    pub sealed_at: Instant,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// Accumulates records until either the configured count or the age of the
/// oldest record trips, whichever happens first. Partial batches are never
/// dropped: shutdown calls [`Batcher::drain`] to force out the remainder.
pub struct Batcher {
    outcomes: Vec<CandleOutcome>,
    offsets: HashMap<i32, i64>,
    earliest_broker_timestamp: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    max_records: usize,
    max_age: Duration,
}

impl Batcher {
    pub fn new(max_records: usize, max_age: Duration) -> Self {
        Self {
            outcomes: Vec::new(),
            offsets: HashMap::new(),
            earliest_broker_timestamp: None,
            opened_at: None,
            max_records: max_records.max(1),
            max_age,
        }
    }

    /// Applied by the consumer loop from the controller's current tuning.
    pub fn set_max_records(&mut self, max_records: usize) {
        self.max_records = max_records.max(1);
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Append the candle derived from `record`. Undecodable and invalid
    /// payloads enter the batch as poison markers so their offsets are
    /// still covered by the eventual commit.
    pub fn add(&mut self, record: ConsumedRecord) {
        if self.outcomes.is_empty() {
            self.opened_at = Some(Instant::now());
            self.earliest_broker_timestamp = None;
        }

        if let Some(timestamp) = record.timestamp {
            self.earliest_broker_timestamp = Some(match self.earliest_broker_timestamp {
                Some(earliest) => earliest.min(timestamp),
                None => timestamp,
            });
        }

        let covered = self.offsets.entry(record.partition).or_insert(record.offset);
        *covered = (*covered).max(record.offset);

        self.outcomes
            .push(outcome_for(record.partition, record.offset, &record.payload));
    }

    /// Seal and emit a batch if the size or age bound has tripped.
    pub fn tick(&mut self, now: Instant) -> Option<Batch> {
        if self.outcomes.is_empty() {
            return None;
        }
        let aged_out = self
            .opened_at
            .is_some_and(|opened| now.duration_since(opened) >= self.max_age);
        if self.outcomes.len() >= self.max_records || aged_out {
            return self.seal();
        }
        None
    }

    /// Force emission regardless of thresholds; used during shutdown.
    pub fn drain(&mut self) -> Option<Batch> {
        if self.outcomes.is_empty() {
            return None;
        }
        self.seal()
    }

    fn seal(&mut self) -> Option<Batch> {
        let batch = Batch {
            outcomes: std::mem::take(&mut self.outcomes),
            offsets: std::mem::take(&mut self.offsets),
            earliest_broker_timestamp: self.earliest_broker_timestamp.take(),
            sealed_at: Instant::now(),
        };
        self.opened_at = None;
        Some(batch)
    }
}
