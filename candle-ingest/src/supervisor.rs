use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::batcher::{Batch, Batcher};
use crate::breaker::{BreakerState, CircuitBreaker};
use crate::clock::MonotonicClock;
use crate::config::{Config, ConfigError};
use crate::consumer::{ConsumerLoop, LoopError};
use crate::controller::AdaptiveController;
use crate::health::{ComponentStatus, HealthHandle, HealthRegistry};
use crate::kafka::{KafkaSource, SourceError};
use crate::metrics;
use crate::retry::RetryPolicy;
use crate::store::{CandleStore, TimescaleStore};
use crate::writer::{WriteOutcome, Writer, WriterError};

/// Slice of the grace period reserved for closing handles after the drain,
/// so the orchestrator's kill signal never races the final commit.
const DRAIN_SAFETY_MARGIN: Duration = Duration::from_secs(5);

/// How long the consumer loop reports liveness for on each iteration.
const LIVENESS_DEADLINE: time::Duration = time::Duration::seconds(30);

/// Enumeration of errors that terminate the service.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Loop(#[from] LoopError),
}

impl ServiceError {
    /// Exit code contract: 1 for configuration and fatal runtime errors,
    /// 2 for startup precondition failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            ServiceError::Bind { .. } | ServiceError::Source(_) => 2,
            ServiceError::Config(_) | ServiceError::Loop(_) => 1,
        }
    }
}

/// Wire up the pipeline and run it until `shutdown_signal` resolves or a
/// fatal error surfaces.
///
/// Components start in dependency order: metrics recorder, health surface,
/// broker and database handles, breaker and retry inside the writer task,
/// then the consumer loop in the foreground. Shutdown is cooperative: stop
/// polling, drain the batcher, give the writer a bounded window to settle,
/// commit what became durable.
pub async fn run(
    config: Config,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServiceError> {
    config.validate()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal.await;
        info!("shutdown signal received");
        _ = shutdown_tx.send(true);
    });

    // Metric registration is explicit here, never an import side effect.
    let recorder_handle = metrics::setup_metrics_recorder();
    let liveness = HealthRegistry::new("candle-ingest");
    let router = metrics::router(liveness.clone(), recorder_handle);
    let bind = config.bind();
    let listener = TcpListener::bind(&bind)
        .await
        .map_err(|source| ServiceError::Bind {
            addr: bind.clone(),
            source,
        })?;
    info!("health and metrics listening on {}", bind);
    tokio::spawn(async move {
        if let Err(err) = metrics::serve(router, listener).await {
            error!(error = %err, "health/metrics server exited");
        }
    });

    let source = KafkaSource::new(&config)?;
    let store = TimescaleStore::new(&config);

    let breaker = CircuitBreaker::new(
        config.cb_failure_threshold,
        config.cb_reset_timeout.0,
        config.cb_half_open_timeout.0,
        Arc::new(MonotonicClock::default()),
    );
    let retry = RetryPolicy::new(config.insert_retry_attempts, config.insert_retry_delay.0);
    let writer = Writer::new(store, breaker, retry, shutdown_rx.clone());

    let (batch_tx, batch_rx) = mpsc::channel::<Batch>(1);
    let (outcome_tx, outcome_rx) = mpsc::channel::<WriteOutcome>(1);

    let writer_health = liveness
        .register("writer".to_string(), LIVENESS_DEADLINE)
        .await;
    // The breaker starts closed, so the writer is ready before its first write.
    writer_health.report_status(ComponentStatus::Healthy).await;
    let writer_task = spawn_writer(writer, batch_rx, outcome_tx, writer_health);

    let loop_health = liveness
        .register("consumer-loop".to_string(), LIVENESS_DEADLINE)
        .await;
    let batcher = Batcher::new(
        config.kafka_initial_max_batch_size.min(config.insert_batch_size),
        config.insert_time_interval.0,
    );
    let controller = AdaptiveController::new(config.controller_settings(), config.initial_tuning());
    let breaker_pause = config.cb_reset_timeout.0.min(Duration::from_secs(1));
    let mut consumer = ConsumerLoop::new(
        source,
        batcher,
        controller,
        batch_tx,
        outcome_rx,
        shutdown_rx,
        loop_health,
        config.insert_batch_size,
        breaker_pause,
    );

    match consumer.run().await {
        Ok(()) => {
            let grace = config
                .shutdown_grace_period
                .0
                .saturating_sub(DRAIN_SAFETY_MARGIN)
                .max(Duration::from_secs(1));
            consumer.drain(grace).await?;
            let _unused = writer_task.await;
            info!("clean shutdown complete");
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "consumer loop failed");
            writer_task.abort();
            Err(err.into())
        }
    }
}

/// The writer half of the one-slot handoff: receives sealed batches,
/// submits them, and reports each outcome back to the consumer loop.
fn spawn_writer<S: CandleStore + Send + Sync + 'static>(
    mut writer: Writer<S>,
    mut batch_rx: mpsc::Receiver<Batch>,
    outcome_tx: mpsc::Sender<WriteOutcome>,
    health: HealthHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = batch_rx.recv().await {
            let result = writer.submit(&batch).await;

            let ready =
                writer.has_written() || writer.breaker_state() != BreakerState::Open;
            let status = if ready {
                ComponentStatus::Healthy
            } else {
                ComponentStatus::Unhealthy
            };
            health.report_status(status).await;

            let outcome = match result {
                Ok(token) => WriteOutcome::Committed(token),
                Err(WriterError::BreakerOpen) => WriteOutcome::Bounced(batch),
                Err(err @ WriterError::RetriesExhausted { .. }) => {
                    warn!(error = %err, "batch write failed, handing it back");
                    WriteOutcome::Bounced(batch)
                }
                Err(WriterError::Cancelled) => {
                    info!("writer cancelled mid-batch; it will be re-delivered on restart");
                    break;
                }
                Err(err @ WriterError::Permanent(_)) => WriteOutcome::Fatal(err),
            };
            if outcome_tx.send(outcome).await.is_err() {
                break;
            }
        }
        info!("writer task stopped");
    })
}
