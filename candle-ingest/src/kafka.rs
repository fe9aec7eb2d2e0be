use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::Config;

/// A record as delivered by the broker, decoupled from rdkafka types so the
/// rest of the pipeline can be exercised without a cluster.
#[derive(Debug, Clone)]
pub struct ConsumedRecord {
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: Vec<u8>,
}

/// Enumeration of errors for operations against the broker.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to create kafka consumer: {0}")]
    Create(#[source] KafkaError),
    #[error("failed to subscribe to topic: {0}")]
    Subscribe(#[source] KafkaError),
    #[error("failed to poll the broker: {0}")]
    Poll(#[source] KafkaError),
    #[error("failed to commit offsets: {0}")]
    Commit(#[source] KafkaError),
}

/// Seam between the consumer loop and the broker client.
#[async_trait]
pub trait RecordSource {
    /// Poll for up to `max_records` records or until `timeout` elapses,
    /// whichever happens first. An empty poll is not an error.
    async fn poll(
        &self,
        timeout: Duration,
        max_records: usize,
    ) -> Result<Vec<ConsumedRecord>, SourceError>;

    /// Synchronously commit the given `{partition -> offset}` positions.
    async fn commit(&self, offsets: &HashMap<i32, i64>) -> Result<(), SourceError>;
}

pub struct KafkaSource {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaSource {
    /// Connect and subscribe. Auto-commit is disabled: the loop commits
    /// only offsets covered by durably written batches.
    pub fn new(config: &Config) -> Result<Self, SourceError> {
        info!(
            "connecting to Kafka brokers at {}...",
            config.kafka_bootstrap_servers
        );

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_bootstrap_servers)
            .set("group.id", config.kafka_group_id.as_str())
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &config.kafka_auto_offset_reset)
            .set(
                "session.timeout.ms",
                config.kafka_session_timeout_ms.to_string(),
            )
            .set("enable.partition.eof", "false");

        debug!("rdkafka configuration: {:?}", client_config);
        let consumer: StreamConsumer = client_config.create().map_err(SourceError::Create)?;
        consumer
            .subscribe(&[config.kafka_topic.as_str()])
            .map_err(SourceError::Subscribe)?;

        Ok(Self {
            consumer,
            topic: config.kafka_topic.as_str().to_owned(),
        })
    }

    fn to_record(message: &rdkafka::message::BorrowedMessage<'_>) -> ConsumedRecord {
        ConsumedRecord {
            partition: message.partition(),
            offset: message.offset(),
            timestamp: message
                .timestamp()
                .to_millis()
                .and_then(DateTime::from_timestamp_millis),
            payload: message.payload().unwrap_or_default().to_vec(),
        }
    }
}

#[async_trait]
impl RecordSource for KafkaSource {
    async fn poll(
        &self,
        timeout: Duration,
        max_records: usize,
    ) -> Result<Vec<ConsumedRecord>, SourceError> {
        let deadline = Instant::now() + timeout;
        let mut records = Vec::new();

        while records.len() < max_records {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(message)) => records.push(Self::to_record(&message)),
                Ok(Err(err)) => return Err(SourceError::Poll(err)),
                // Poll window elapsed with no further messages.
                Err(_) => break,
            }
        }

        Ok(records)
    }

    async fn commit(&self, offsets: &HashMap<i32, i64>) -> Result<(), SourceError> {
        if offsets.is_empty() {
            return Ok(());
        }

        let mut list = TopicPartitionList::new();
        for (partition, offset) in offsets {
            // Kafka commits point at the next offset to consume.
            list.add_partition_offset(&self.topic, *partition, Offset::Offset(offset + 1))
                .map_err(SourceError::Commit)?;
        }

        self.consumer
            .commit(&list, CommitMode::Sync)
            .map_err(SourceError::Commit)?;

        Ok(())
    }
}
