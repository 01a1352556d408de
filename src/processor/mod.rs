//! Processor worker: consumes raw events from the bus, deduplicates,
//! normalizes, enriches, indexes, and taps the detection engine.
//!
//! Offsets are committed only after the index write acknowledges, so a
//! worker killed mid-flight replays the event on restart; the dedup
//! cache and id-idempotent index writes absorb the replay.

pub mod dedup;
pub mod enrich;

use chrono::Utc;
use rdkafka::message::{BorrowedMessage, Message};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::bus::{DeadLetterQueue, EventConsumer, EventProducer};
use crate::config::Settings;
use crate::detection::DetectionEngine;
use crate::dispatch::AlertDispatcher;
use crate::error::{PipelineError, Result};
use crate::models::{Alert, Event};
use crate::response::ResponseEngine;
use crate::storage::IndexStore;
use crate::util::retry::retry_with_backoff;
use dedup::DedupCache;
use enrich::EnrichmentPipeline;

// Index write retry backoff per the recovery policy: 200ms base,
// 30s cap, jitter inside retry_with_backoff.
const INDEX_RETRY_BASE_MS: u64 = 200;
const INDEX_RETRY_CAP_MS: u64 = 30_000;

pub struct Processor {
    consumer: EventConsumer,
    dedup: Mutex<DedupCache>,
    enrichment: EnrichmentPipeline,
    store: IndexStore,
    dlq: DeadLetterQueue,
    detection: Arc<DetectionEngine>,
    response: Arc<ResponseEngine>,
    dispatcher: Arc<AlertDispatcher>,
    producer: EventProducer,
    enriched_topic: String,
    alerts_topic: String,
    index_retry_max: u32,
}

impl Processor {
    pub fn new(
        settings: &Settings,
        store: IndexStore,
        detection: Arc<DetectionEngine>,
        response: Arc<ResponseEngine>,
        dispatcher: Arc<AlertDispatcher>,
    ) -> Result<Self> {
        let consumer = EventConsumer::new(
            &settings.kafka,
            &settings.processor.consumer_group_id,
            &[settings.kafka.raw_logs_topic.as_str()],
            "processor",
        )?;
        Ok(Self {
            consumer,
            dedup: Mutex::new(DedupCache::new(
                settings.processor.dedup_window_secs,
                settings.processor.dedup_cache_max,
            )),
            enrichment: EnrichmentPipeline::from_settings(&settings.processor)?,
            store,
            dlq: DeadLetterQueue::new(&settings.kafka)?,
            detection,
            response,
            dispatcher,
            producer: EventProducer::new(&settings.kafka, "processor-out")?,
            enriched_topic: settings.kafka.enriched_logs_topic.clone(),
            alerts_topic: settings.kafka.alerts_topic.clone(),
            index_retry_max: settings.processor.index_retry_max,
        })
    }

    pub async fn run(&self) -> Result<()> {
        tracing::info!("processor worker started");
        loop {
            let msg = match self.consumer.recv().await {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::error!(error = %e, "consumer error");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };
            match self.handle_message(&msg).await {
                Ok(()) => {
                    if let Err(e) = self.consumer.commit(&msg) {
                        tracing::error!(error = %e, "offset commit failed");
                    }
                }
                Err(e) => {
                    // No commit: the message replays after restart or
                    // rebalance.
                    tracing::error!(error = %e, "event processing failed, offset not committed");
                }
            }
        }
    }

    /// Process one message end to end. `Ok(())` means the offset may be
    /// committed: the event was indexed, was a duplicate, or has been
    /// routed to the dead-letter topic.
    pub async fn handle_message(&self, msg: &BorrowedMessage<'_>) -> Result<()> {
        let payload = match msg.payload() {
            Some(payload) => payload,
            None => {
                tracing::warn!("empty message, skipping");
                return Ok(());
            }
        };

        let mut event: Event = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                // Poison message: park it and move on.
                self.dlq.send(msg, "invalid_json", &e.to_string(), 0).await?;
                return Ok(());
            }
        };

        let fingerprint = dedup::fingerprint(&event);
        {
            let mut cache = self.dedup.lock().await;
            if cache.check_and_insert(&fingerprint, Utc::now().timestamp() as u64) {
                tracing::debug!(fingerprint, "duplicate event dropped");
                return Ok(());
            }
        }

        self.normalize(&mut event);
        self.enrichment.enrich(&mut event).await;

        match self.index_event(&event, &fingerprint).await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!(error = %e, "index write exhausted retries, routing to DLQ");
                self.dlq
                    .send(msg, "index_write_failed", &e.to_string(), self.index_retry_max)
                    .await?;
                return Ok(());
            }
        }

        // Downstream consumers read the enriched stream; same partition
        // key as ingestion so per-source ordering carries through.
        if let Err(e) = self
            .producer
            .publish(&self.enriched_topic, &event.source, &event)
            .await
        {
            tracing::warn!(error = %e, "failed to publish enriched event");
        }

        // Detection runs after the event is durable; alerts for one
        // event are gathered before any is emitted.
        let alerts = self.detection.evaluate(&event).await;
        for alert in &alerts {
            self.emit_alert(alert).await;
        }

        Ok(())
    }

    /// Normalization: a UTC timestamp is required past this point, and
    /// an id must exist even for events that bypassed the collector.
    fn normalize(&self, event: &mut Event) {
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now());
        }
        if event.id.is_none() {
            event.id = Some(uuid::Uuid::new_v4().to_string());
        }
    }

    async fn index_event(&self, event: &Event, fingerprint: &str) -> Result<()> {
        let timestamp = event
            .timestamp
            .ok_or_else(|| PipelineError::internal("normalized event lost its timestamp"))?;
        let index = self.store.index_for(timestamp);
        let id = event
            .id
            .clone()
            .ok_or_else(|| PipelineError::internal("normalized event lost its id"))?;

        let mut doc = serde_json::to_value(event)?;
        if let Value::Object(map) = &mut doc {
            map.insert("fingerprint".to_string(), Value::from(fingerprint));
        }

        retry_with_backoff(
            self.index_retry_max.max(1),
            INDEX_RETRY_BASE_MS,
            INDEX_RETRY_CAP_MS,
            || self.store.put(&index, &id, &doc),
        )
        .await
    }

    async fn emit_alert(&self, alert: &Alert) {
        // Alerts are at-least-once; the deterministic alert id keeps
        // downstream consumers idempotent.
        if let Err(e) = self
            .producer
            .publish(&self.alerts_topic, &alert.rule_id, alert)
            .await
        {
            tracing::error!(error = %e, alert_id = %alert.id, "failed to publish alert");
        }

        let index = self.store.alerts_index_for(alert.timestamp);
        if let Ok(doc) = serde_json::to_value(alert) {
            if let Err(e) = self.store.put(&index, &alert.id, &doc).await {
                tracing::warn!(error = %e, alert_id = %alert.id, "failed to index alert");
            }
        }

        self.dispatcher.dispatch(alert).await;
        let run_log = self.response.process_alert(alert).await;
        if !run_log.is_empty() {
            tracing::info!(
                alert_id = %alert.id,
                actions = run_log.len(),
                "playbook actions executed"
            );
        }
    }
}
