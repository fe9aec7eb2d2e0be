use std::collections::HashMap;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, warn};

use crate::batcher::Batch;
use crate::breaker::{BreakerState, CircuitBreaker, Gate};
use crate::candle::{Candle, CandleOutcome};
use crate::retry::RetryPolicy;
use crate::store::{CandleStore, StoreError};

/// Proof that a batch became durable. Consumed exactly once by the
/// consumer loop, which turns it into a broker offset commit.
#[derive(Debug)]
pub struct CommitToken {
    /// Highest durable offset per partition.
    pub offsets: HashMap<i32, i64>,
    /// Batch-sealed to commit-returned, fed back to the controller.
    pub latency: Duration,
}

/// Enumeration of errors for batch submissions.
#[derive(Error, Debug)]
pub enum WriterError {
    #[error("circuit breaker is open, batch was not attempted")]
    BreakerOpen,
    #[error("database write failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Permanent(StoreError),
    #[error("shutdown requested while writing")]
    Cancelled,
}

/// What the writer task reports back over the one-slot channel.
#[derive(Debug)]
pub enum WriteOutcome {
    /// The batch is durable; commit these offsets.
    Committed(CommitToken),
    /// The batch was not written (breaker open or retries exhausted); it is
    /// handed back so the loop can pause and resubmit it.
    Bounced(Batch),
    /// Unrecoverable; the supervisor must shut the service down.
    Fatal(WriterError),
}

/// Validates, dedup-keys and upserts batches. `&mut self` on
/// [`Writer::submit`] is what enforces a single in-flight submission.
///
/// Composition order matters: the retry loop is on the outside, the breaker
/// gate on the inside, and the breaker is charged once per logical
/// submission rather than once per attempt.
pub struct Writer<S> {
    store: S,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    shutdown: watch::Receiver<bool>,
    wrote_once: bool,
}

impl<S: CandleStore> Writer<S> {
    pub fn new(
        store: S,
        breaker: CircuitBreaker,
        retry: RetryPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            breaker,
            retry,
            shutdown,
            wrote_once: false,
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Whether at least one batch has been durably written since startup.
    pub fn has_written(&self) -> bool {
        self.wrote_once
    }

    /// Submit one batch. The batch is only borrowed: on failure the caller
    /// still holds it unchanged and decides whether to resubmit.
    pub async fn submit(&mut self, batch: &Batch) -> Result<CommitToken, WriterError> {
        let mut candles: Vec<Candle> = Vec::with_capacity(batch.len());
        let mut poison: Vec<(i32, i64, &str)> = Vec::new();
        for outcome in &batch.outcomes {
            match outcome {
                CandleOutcome::Valid(candle) => candles.push(candle.clone()),
                CandleOutcome::Poison {
                    partition,
                    offset,
                    reason,
                } => poison.push((*partition, *offset, reason.as_str())),
            }
        }

        if !candles.is_empty() {
            if self.breaker.allow() == Gate::Reject {
                self.publish_breaker_state();
                return Err(WriterError::BreakerOpen);
            }
            // allow() may have moved the breaker to half-open.
            self.publish_breaker_state();

            self.upsert_with_retry(&candles).await?;

            self.breaker.record_success();
            self.wrote_once = true;
            self.publish_breaker_state();

            counter!("ingest_batches_written_total").increment(1);
            histogram!("ingest_batch_size").record(candles.len() as f64);
        }

        // Poison accounting happens only here, once the batch's offsets are
        // about to become committable; a bounced batch is resubmitted later
        // and must not be counted twice.
        if !poison.is_empty() {
            counter!("ingest_poison_records_total").increment(poison.len() as u64);
            for (partition, offset, reason) in poison {
                warn!(partition, offset, reason, "discarding poison record");
            }
        }

        let latency = batch.sealed_at.elapsed();
        histogram!("ingest_write_latency_seconds").record(latency.as_secs_f64());

        Ok(CommitToken {
            offsets: batch.offsets.clone(),
            latency,
        })
    }

    async fn upsert_with_retry(&mut self, candles: &[Candle]) -> Result<(), WriterError> {
        let max_attempts = self.retry.max_attempts();

        for attempt in 1..=max_attempts {
            match self.store.upsert(candles).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() => {
                    if attempt == max_attempts {
                        // One breaker failure per logical submission.
                        self.breaker.record_failure();
                        self.publish_breaker_state();
                        return Err(WriterError::RetriesExhausted {
                            attempts: max_attempts,
                            source: err,
                        });
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient database error, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.changed() => return Err(WriterError::Cancelled),
                    }
                }
                Err(err) => {
                    error!(error = %err, "permanent database error");
                    return Err(WriterError::Permanent(err));
                }
            }
        }

        unreachable!("retry loop returns before exhausting attempts")
    }

    fn publish_breaker_state(&self) {
        gauge!("ingest_breaker_state").set(self.breaker.state().as_gauge());
    }
}
