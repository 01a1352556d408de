//! Typed producer/consumer wrappers over the durable message bus.
//!
//! Topics are partitioned; publishing with a key preserves per-key
//! ordering end-to-end. Delivery is at-least-once: producers wait for
//! broker acknowledgement and consumers commit offsets manually after
//! their side effects have landed.

use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::KafkaSettings;
use crate::error::{PipelineError, Result};

pub struct EventProducer {
    producer: FutureProducer,
    ack_timeout: Duration,
}

impl EventProducer {
    pub fn new(settings: &KafkaSettings, client_id_suffix: &str) -> Result<Self> {
        let producer: FutureProducer = settings
            .client_config(client_id_suffix)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("compression.type", "gzip")
            .set("message.timeout.ms", "30000")
            .set("delivery.timeout.ms", "60000")
            .set("queue.buffering.max.ms", "1000")
            .set_log_level(RDKafkaLogLevel::Warning)
            .create()
            .map_err(|e| PipelineError::config(format!("failed to create producer: {}", e)))?;

        Ok(Self {
            producer,
            ack_timeout: Duration::from_millis(settings.ack_timeout_ms),
        })
    }

    /// Publish a serialized value and wait for broker acknowledgement.
    ///
    /// When the in-memory producer queue is full this blocks up to the
    /// acknowledgement window before failing, surfacing backpressure to
    /// the caller as a service-unavailable error.
    pub async fn publish<T: Serialize>(&self, topic: &str, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        let record = FutureRecord::to(topic).key(key).payload(&payload);

        match self
            .producer
            .send(record, Timeout::After(self.ack_timeout))
            .await
        {
            Ok((partition, offset)) => {
                tracing::debug!(topic, partition, offset, "published");
                Ok(())
            }
            Err((e, _)) => {
                tracing::error!(topic, error = %e, "publish failed");
                Err(PipelineError::service_unavailable(format!(
                    "bus publish to '{}' failed: {}",
                    topic, e
                )))
            }
        }
    }

    /// Reachability probe used by the health endpoint.
    pub fn ping(&self) -> bool {
        use rdkafka::producer::Producer;
        self.producer
            .client()
            .fetch_metadata(None, Duration::from_secs(2))
            .is_ok()
    }
}

pub struct EventConsumer {
    consumer: StreamConsumer,
}

impl EventConsumer {
    pub fn new(
        settings: &KafkaSettings,
        group_id: &str,
        topics: &[&str],
        client_id_suffix: &str,
    ) -> Result<Self> {
        let consumer: StreamConsumer = settings
            .client_config(client_id_suffix)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "6000")
            .set("max.poll.interval.ms", "300000")
            .set_log_level(RDKafkaLogLevel::Warning)
            .create()
            .map_err(|e| PipelineError::config(format!("failed to create consumer: {}", e)))?;

        consumer
            .subscribe(topics)
            .map_err(|e| PipelineError::config(format!("failed to subscribe: {}", e)))?;

        tracing::info!(group_id, ?topics, "consumer subscribed");
        Ok(Self { consumer })
    }

    pub async fn recv(&self) -> Result<BorrowedMessage<'_>> {
        self.consumer.recv().await.map_err(PipelineError::from)
    }

    /// Commit the message's offset. Called only after the downstream
    /// side effect (index write) has been acknowledged; a crash before
    /// commit replays the message, which deduplication absorbs.
    pub fn commit(&self, msg: &BorrowedMessage<'_>) -> Result<()> {
        self.consumer
            .commit_message(msg, CommitMode::Async)
            .map_err(PipelineError::from)
    }
}

/// Envelope written to the dead-letter topic when an event exhausts its
/// processing retries.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    pub original_topic: String,
    pub original_partition: i32,
    pub original_offset: i64,
    pub error_type: String,
    pub error_message: String,
    pub retry_count: u32,
    pub failed_at: chrono::DateTime<chrono::Utc>,
    pub payload: String,
}

pub struct DeadLetterQueue {
    producer: EventProducer,
    topic: String,
}

impl DeadLetterQueue {
    pub fn new(settings: &KafkaSettings) -> Result<Self> {
        Ok(Self {
            producer: EventProducer::new(settings, "dlq")?,
            topic: settings.dlq_topic.clone(),
        })
    }

    pub async fn send(
        &self,
        msg: &BorrowedMessage<'_>,
        error_type: &str,
        error_message: &str,
        retry_count: u32,
    ) -> Result<()> {
        let dead_letter = DeadLetterMessage {
            original_topic: msg.topic().to_string(),
            original_partition: msg.partition(),
            original_offset: msg.offset(),
            error_type: error_type.to_string(),
            error_message: error_message.to_string(),
            retry_count,
            failed_at: chrono::Utc::now(),
            payload: msg
                .payload()
                .map(|p| String::from_utf8_lossy(p).to_string())
                .unwrap_or_default(),
        };
        let key = format!("{}:{}:{}", msg.topic(), msg.partition(), msg.offset());
        self.producer.publish(&self.topic, &key, &dead_letter).await
    }
}
