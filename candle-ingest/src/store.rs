use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;

use crate::candle::Candle;
use crate::config::Config;

/// Database errors split by whether retrying can help. The writer retries
/// transient errors and escalates permanent ones to the supervisor.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("transient database error: {0}")]
    Transient(#[source] sqlx::Error),
    #[error("permanent database error: {0}")]
    Permanent(#[source] sqlx::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    /// Sort an sqlx error into the retryable or fatal bucket.
    ///
    /// Connection-level failures, pool exhaustion, serialization failures
    /// (40001) and deadlocks (40P01) are worth retrying; schema errors,
    /// authentication failures and constraint violations the upsert does
    /// not cover are not.
    pub fn classify(error: sqlx::Error) -> StoreError {
        match &error {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::WorkerCrashed => StoreError::Transient(error),
            sqlx::Error::Database(db_error) => {
                let transient = db_error.code().is_some_and(|code| {
                    let code = code.as_ref();
                    code == "40001"              // serialization_failure
                        || code == "40P01"       // deadlock_detected
                        || code == "53300"       // too_many_connections
                        || code.starts_with("08") // connection exceptions
                        || code.starts_with("57P") // operator intervention / shutdown
                });
                if transient {
                    StoreError::Transient(error)
                } else {
                    StoreError::Permanent(error)
                }
            }
            _ => StoreError::Permanent(error),
        }
    }
}

/// Seam between the writer and the time-series store.
#[async_trait]
pub trait CandleStore {
    /// Upsert the candles in a single transaction. Re-applying any subset
    /// must leave the table unchanged.
    async fn upsert(&self, candles: &[Candle]) -> Result<(), StoreError>;
}

pub struct TimescaleStore {
    pool: PgPool,
    table: String,
}

impl TimescaleStore {
    /// Build a lazily-connecting pool. The hypertable and its partitioning
    /// are assumed to exist already; this service never creates them.
    pub fn new(config: &Config) -> Self {
        let options = PgConnectOptions::new()
            .host(&config.timescaledb_host)
            .port(config.timescaledb_port)
            .database(&config.timescaledb_dbname)
            .username(&config.timescaledb_user)
            .password(&config.timescaledb_password);

        let pool = PgPoolOptions::new()
            .max_connections(config.timescaledb_pool_size)
            .acquire_timeout(config.timescaledb_connection_timeout.0)
            .connect_lazy_with(options);

        Self {
            pool,
            table: config.timescaledb_table.as_str().to_owned(),
        }
    }
}

#[async_trait]
impl CandleStore for TimescaleStore {
    async fn upsert(&self, candles: &[Candle]) -> Result<(), StoreError> {
        if candles.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(StoreError::classify)?;

        let mut query: QueryBuilder<Postgres> = QueryBuilder::new("INSERT INTO ");
        query.push(&self.table);
        query.push(
            " (symbol, interval, open_time, open, high, low, close, volume, trade_count, ingest_time) ",
        );
        query.push_values(candles, |mut row, candle| {
            row.push_bind(&candle.symbol)
                .push_bind(candle.interval.as_str())
                .push_bind(candle.open_time)
                .push_bind(candle.open)
                .push_bind(candle.high)
                .push_bind(candle.low)
                .push_bind(candle.close)
                .push_bind(candle.volume)
                .push_bind(candle.trade_count)
                .push_bind(candle.ingest_time);
        });
        // Re-delivered rows overwrite themselves with identical values, so
        // replaying a batch is a no-op.
        query.push(
            " ON CONFLICT (symbol, interval, open_time) DO UPDATE SET \
              open = EXCLUDED.open, high = EXCLUDED.high, low = EXCLUDED.low, \
              close = EXCLUDED.close, volume = EXCLUDED.volume, \
              trade_count = EXCLUDED.trade_count, ingest_time = EXCLUDED.ingest_time",
        );

        query
            .build()
            .execute(&mut *tx)
            .await
            .map_err(StoreError::classify)?;

        tx.commit().await.map_err(StoreError::classify)?;

        debug!(rows = candles.len(), "upserted candle batch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_and_pool_errors_are_transient() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ));
        assert!(StoreError::classify(io).is_transient());
        assert!(StoreError::classify(sqlx::Error::PoolTimedOut).is_transient());
    }

    #[test]
    fn test_protocol_and_row_errors_are_permanent() {
        assert!(!StoreError::classify(sqlx::Error::RowNotFound).is_transient());
        assert!(!StoreError::classify(sqlx::Error::Protocol("bad frame".into())).is_transient());
    }
}
