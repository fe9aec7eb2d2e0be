use std::collections::HashMap;
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::batcher::{Batch, Batcher};
use crate::controller::AdaptiveController;
use crate::health::HealthHandle;
use crate::kafka::{RecordSource, SourceError};
use crate::writer::{CommitToken, WriteOutcome};

/// Constant backoff after a failed broker poll.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Enumeration of errors that terminate the consumer loop.
#[derive(Error, Debug)]
pub enum LoopError {
    /// Double ingestion is tolerable, commit loss is not: a failed offset
    /// commit takes the whole service down.
    #[error("failed to commit offsets: {0}")]
    Commit(#[source] SourceError),
    #[error(transparent)]
    Writer(crate::writer::WriterError),
    #[error("writer task stopped unexpectedly")]
    WriterGone,
}

/// The cooperative loop at the center of the service: polls the broker with
/// the controller's current tuning, feeds the batcher, hands sealed batches
/// to the writer over a one-slot channel (the primary backpressure), and
/// commits the offsets the writer has made durable.
pub struct ConsumerLoop<S> {
    source: S,
    batcher: Batcher,
    controller: AdaptiveController,
    batch_tx: mpsc::Sender<Batch>,
    outcome_rx: mpsc::Receiver<WriteOutcome>,
    shutdown: watch::Receiver<bool>,
    liveness: HealthHandle,
    /// Hard cap on emitted batch sizes, whatever the controller asks for.
    insert_batch_size: usize,
    /// How long to idle while the breaker keeps rejecting.
    breaker_pause: Duration,
    /// Highest committed offset per partition; commits must never regress.
    committed: HashMap<i32, i64>,
    /// A batch the writer handed back; resubmitted after a pause.
    bounced: Option<Batch>,
}

impl<S: RecordSource> ConsumerLoop<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: S,
        batcher: Batcher,
        controller: AdaptiveController,
        batch_tx: mpsc::Sender<Batch>,
        outcome_rx: mpsc::Receiver<WriteOutcome>,
        shutdown: watch::Receiver<bool>,
        liveness: HealthHandle,
        insert_batch_size: usize,
        breaker_pause: Duration,
    ) -> Self {
        Self {
            source,
            batcher,
            controller,
            batch_tx,
            outcome_rx,
            shutdown,
            liveness,
            insert_batch_size,
            breaker_pause,
            committed: HashMap::new(),
            bounced: None,
        }
    }

    /// Run until shutdown is signalled or a fatal error occurs. On a clean
    /// exit the caller is expected to follow up with [`ConsumerLoop::drain`].
    pub async fn run(&mut self) -> Result<(), LoopError> {
        info!("consumer loop started");

        while !*self.shutdown.borrow() {
            self.liveness.report_healthy().await;
            self.collect_outcomes().await?;

            // A bounced batch means the writer could not make progress;
            // pause, then resubmit it before pulling anything new.
            if let Some(batch) = self.bounced.take() {
                self.sleep_unless_shutdown(self.breaker_pause).await;
                if *self.shutdown.borrow() {
                    self.bounced = Some(batch);
                    break;
                }
                self.dispatch(batch).await?;
                continue;
            }

            let tuning = self.controller.tuning();
            let cap = tuning.max_batch.min(self.insert_batch_size);
            self.batcher.set_max_records(cap);
            gauge!("ingest_poll_timeout_seconds").set(tuning.poll_timeout.as_secs_f64());
            gauge!("ingest_max_batch_size").set(cap as f64);

            let want = cap.saturating_sub(self.batcher.len()).max(1);
            let polled = tokio::select! {
                polled = self.source.poll(tuning.poll_timeout, want) => polled,
                _ = self.shutdown.changed() => break,
            };
            match polled {
                Ok(records) => {
                    if !records.is_empty() {
                        counter!("ingest_records_consumed_total")
                            .increment(records.len() as u64);
                    }
                    for record in records {
                        self.batcher.add(record);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "broker poll failed, backing off");
                    self.sleep_unless_shutdown(POLL_ERROR_BACKOFF).await;
                    continue;
                }
            }

            if let Some(batch) = self.batcher.tick(Instant::now()) {
                self.dispatch(batch).await?;
            }
        }

        info!("consumer loop stopping");
        Ok(())
    }

    /// Flush what is still buffered, then wait for the writer to settle,
    /// all bounded by `deadline`. Anything not durable when the deadline
    /// expires is abandoned uncommitted and will be re-delivered.
    pub async fn drain(mut self, deadline: Duration) -> Result<(), LoopError> {
        info!("draining buffered records before shutdown");
        let expires = Instant::now() + deadline;

        let residual: Vec<Batch> = self
            .bounced
            .take()
            .into_iter()
            .chain(self.batcher.drain())
            .collect();
        for batch in residual {
            let remaining = expires.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.batch_tx.send(batch)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(LoopError::WriterGone),
                Err(_) => {
                    warn!("drain deadline expired before handoff; batch will be re-delivered");
                    break;
                }
            }
        }

        // Closing the channel lets the writer task exit once it settles.
        self.batch_tx = mpsc::channel(1).0;

        loop {
            let remaining = expires.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("shutdown grace period expired with work outstanding");
                break;
            }
            match tokio::time::timeout(remaining, self.outcome_rx.recv()).await {
                Ok(Some(WriteOutcome::Committed(token))) => self.apply_token(token).await?,
                Ok(Some(WriteOutcome::Bounced(batch))) => {
                    warn!(
                        records = batch.len(),
                        "abandoning unwritten batch; it will be re-delivered"
                    );
                }
                Ok(Some(WriteOutcome::Fatal(err))) => return Err(LoopError::Writer(err)),
                Ok(None) => break,
                Err(_) => {
                    warn!("shutdown grace period expired waiting for the writer");
                    break;
                }
            }
        }

        info!("drain complete");
        Ok(())
    }

    async fn collect_outcomes(&mut self) -> Result<(), LoopError> {
        while let Ok(outcome) = self.outcome_rx.try_recv() {
            match outcome {
                WriteOutcome::Committed(token) => self.apply_token(token).await?,
                WriteOutcome::Bounced(batch) => {
                    debug!(records = batch.len(), "writer bounced batch");
                    self.bounced = Some(batch);
                }
                WriteOutcome::Fatal(err) => return Err(LoopError::Writer(err)),
            }
        }
        Ok(())
    }

    async fn apply_token(&mut self, token: CommitToken) -> Result<(), LoopError> {
        // Keep commits monotonic per partition.
        let mut advancing: HashMap<i32, i64> = HashMap::new();
        for (partition, offset) in &token.offsets {
            let regressed = self
                .committed
                .get(partition)
                .is_some_and(|done| offset <= done);
            if !regressed {
                advancing.insert(*partition, *offset);
            }
        }

        if !advancing.is_empty() {
            if let Err(err) = self.source.commit(&advancing).await {
                counter!("ingest_commit_failures_total").increment(1);
                error!(error = %err, "offset commit failed");
                return Err(LoopError::Commit(err));
            }
            self.committed.extend(advancing);
        }

        self.controller.record_sample(token.latency);
        Ok(())
    }

    async fn dispatch(&mut self, batch: Batch) -> Result<(), LoopError> {
        debug!(records = batch.len(), "dispatching batch to writer");
        // reserve() rather than send() so the batch survives a shutdown
        // race and can still be drained.
        tokio::select! {
            permit = self.batch_tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(batch);
                    Ok(())
                }
                Err(_) => Err(LoopError::WriterGone),
            },
            _ = self.shutdown.changed() => {
                self.bounced = Some(batch);
                Ok(())
            }
        }
    }

    async fn sleep_unless_shutdown(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown.changed() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::batcher::Batcher;
    use crate::candle::sample_payload;
    use crate::controller::{AdaptiveController, ControllerSettings, Tuning};
    use crate::health::HealthRegistry;
    use crate::kafka::ConsumedRecord;
    use crate::writer::WriterError;

    /// Record source double: hands out queued records, captures commits.
    #[derive(Default)]
    struct MemorySource {
        records: Mutex<VecDeque<ConsumedRecord>>,
        commits: Mutex<Vec<HashMap<i32, i64>>>,
        fail_commits: AtomicBool,
    }

    #[async_trait::async_trait]
    impl RecordSource for Arc<MemorySource> {
        async fn poll(
            &self,
            timeout: Duration,
            max_records: usize,
        ) -> Result<Vec<ConsumedRecord>, SourceError> {
            let drained = {
                let mut queue = self.records.lock().unwrap();
                if queue.is_empty() {
                    None
                } else {
                    let take = max_records.min(queue.len());
                    Some(queue.drain(..take).collect())
                }
            };
            match drained {
                Some(records) => Ok(records),
                None => {
                    tokio::time::sleep(timeout).await;
                    Ok(Vec::new())
                }
            }
        }

        async fn commit(&self, offsets: &HashMap<i32, i64>) -> Result<(), SourceError> {
            if self.fail_commits.load(Ordering::SeqCst) {
                return Err(SourceError::Commit(rdkafka::error::KafkaError::Canceled));
            }
            self.commits.lock().unwrap().push(offsets.clone());
            Ok(())
        }
    }

    impl MemorySource {
        fn committed(&self) -> HashMap<i32, i64> {
            let mut merged = HashMap::new();
            for commit in self.commits.lock().unwrap().iter() {
                merged.extend(commit.iter().map(|(p, o)| (*p, *o)));
            }
            merged
        }
    }

    fn record(partition: i32, offset: i64) -> ConsumedRecord {
        ConsumedRecord {
            partition,
            offset,
            timestamp: None,
            payload: sample_payload("BTCUSDT", "1m", [10.0, 12.0, 9.0, 11.0]),
        }
    }

    fn settings() -> ControllerSettings {
        ControllerSettings {
            window_size: 5,
            threshold_high: Duration::from_secs(1),
            // Zero keeps the controller in its hold band for these tests.
            threshold_low: Duration::ZERO,
            poll_timeout_min: Duration::from_millis(10),
            poll_timeout_max: Duration::from_millis(50),
            poll_timeout_step: Duration::from_millis(10),
            batch_size_min: 1,
            batch_size_max: 100,
            batch_size_step: 2,
        }
    }

    struct Harness {
        source: Arc<MemorySource>,
        consumer: ConsumerLoop<Arc<MemorySource>>,
        batch_rx: mpsc::Receiver<Batch>,
        outcome_tx: mpsc::Sender<WriteOutcome>,
        shutdown_tx: watch::Sender<bool>,
    }

    async fn harness(max_batch: usize) -> Harness {
        let source = Arc::new(MemorySource::default());
        let (batch_tx, batch_rx) = mpsc::channel(1);
        let (outcome_tx, outcome_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = HealthRegistry::new("test");
        let liveness = registry
            .register("consumer-loop".to_string(), time::Duration::seconds(30))
            .await;
        let controller = AdaptiveController::new(
            settings(),
            Tuning {
                poll_timeout: Duration::from_millis(10),
                max_batch,
            },
        );
        let batcher = Batcher::new(max_batch, Duration::from_secs(60));
        let consumer = ConsumerLoop::new(
            source.clone(),
            batcher,
            controller,
            batch_tx,
            outcome_rx,
            shutdown_rx,
            liveness,
            1000,
            Duration::from_millis(10),
        );
        Harness {
            source,
            consumer,
            batch_rx,
            outcome_tx,
            shutdown_tx,
        }
    }

    /// Writer-task double that acknowledges every batch as durable.
    fn spawn_echo_writer(
        mut batch_rx: mpsc::Receiver<Batch>,
        outcome_tx: mpsc::Sender<WriteOutcome>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(batch) = batch_rx.recv().await {
                let token = CommitToken {
                    offsets: batch.offsets.clone(),
                    latency: Duration::from_millis(1),
                };
                if outcome_tx.send(WriteOutcome::Committed(token)).await.is_err() {
                    break;
                }
            }
        })
    }

    #[tokio::test]
    async fn test_records_flow_to_commit() {
        let mut harness = harness(2).await;
        for offset in 1..=4 {
            harness.source.records.lock().unwrap().push_back(record(0, offset));
        }
        let echo = spawn_echo_writer(harness.batch_rx, harness.outcome_tx.clone());

        let mut consumer = harness.consumer;
        let run = tokio::spawn(async move { consumer.run().await });

        // Both two-record batches must be committed.
        for _ in 0..100 {
            if harness.source.committed().get(&0) == Some(&4) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(harness.source.committed().get(&0), Some(&4));

        harness.shutdown_tx.send(true).unwrap();
        run.await.unwrap().unwrap();
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_failure_is_fatal() {
        let mut harness = harness(1).await;
        harness.source.fail_commits.store(true, Ordering::SeqCst);
        harness.source.records.lock().unwrap().push_back(record(0, 1));
        let _echo = spawn_echo_writer(harness.batch_rx, harness.outcome_tx.clone());

        let result = tokio::time::timeout(Duration::from_secs(5), harness.consumer.run()).await;
        assert!(matches!(result, Ok(Err(LoopError::Commit(_)))));
    }

    #[tokio::test]
    async fn test_fatal_outcome_stops_the_loop() {
        let harness = harness(1).await;
        harness
            .outcome_tx
            .send(WriteOutcome::Fatal(WriterError::Permanent(
                crate::store::StoreError::classify(sqlx::Error::RowNotFound),
            )))
            .await
            .unwrap();

        let mut consumer = harness.consumer;
        let result = tokio::time::timeout(Duration::from_secs(5), consumer.run()).await;
        assert!(matches!(result, Ok(Err(LoopError::Writer(_)))));
    }

    #[tokio::test]
    async fn test_bounced_batch_is_resubmitted() {
        let mut harness = harness(1).await;
        harness.source.records.lock().unwrap().push_back(record(0, 1));

        // First submission bounces, second is acknowledged.
        let outcome_tx = harness.outcome_tx.clone();
        let mut batch_rx = harness.batch_rx;
        let writer = tokio::spawn(async move {
            let first = batch_rx.recv().await.expect("first dispatch");
            outcome_tx
                .send(WriteOutcome::Bounced(first))
                .await
                .unwrap();
            let second = batch_rx.recv().await.expect("resubmission");
            let token = CommitToken {
                offsets: second.offsets.clone(),
                latency: Duration::from_millis(1),
            };
            outcome_tx
                .send(WriteOutcome::Committed(token))
                .await
                .unwrap();
        });

        let mut consumer = harness.consumer;
        let run = tokio::spawn(async move { consumer.run().await });

        for _ in 0..100 {
            if harness.source.committed().get(&0) == Some(&1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(harness.source.committed().get(&0), Some(&1));

        harness.shutdown_tx.send(true).unwrap();
        run.await.unwrap().unwrap();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_commits_never_regress() {
        let mut harness = harness(1).await;
        harness.consumer.committed.insert(0, 10);

        harness
            .consumer
            .apply_token(CommitToken {
                offsets: HashMap::from([(0, 5), (1, 3)]),
                latency: Duration::from_millis(1),
            })
            .await
            .unwrap();

        // Partition 0 must not move backwards; partition 1 is new.
        let committed = harness.source.committed();
        assert_eq!(committed.get(&0), None);
        assert_eq!(committed.get(&1), Some(&3));
        assert_eq!(harness.consumer.committed.get(&0), Some(&10));
    }

    #[tokio::test]
    async fn test_drain_flushes_partial_batch() {
        let mut harness = harness(100).await;
        let echo = spawn_echo_writer(harness.batch_rx, harness.outcome_tx.clone());
        drop(harness.outcome_tx);

        // Half-full batcher, then immediate shutdown.
        harness.consumer.batcher.add(record(0, 1));
        harness.consumer.batcher.add(record(0, 2));
        harness.shutdown_tx.send(true).unwrap();

        harness.consumer.run().await.unwrap();
        harness
            .consumer
            .drain(Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(harness.source.committed().get(&0), Some(&2));
        echo.await.unwrap();
    }
}
