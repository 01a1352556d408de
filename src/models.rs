use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{PipelineError, Result};

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_.-]+$").unwrap());

/// A single normalized log record flowing through the pipeline.
///
/// `id`, `source`, `event_type` and `timestamp` are required once the
/// event has been accepted by the collector. `enriched` is written only
/// by the processor and is never taken from clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub id: Option<String>,
    pub source: String,
    pub event_type: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default = "default_severity")]
    pub severity: String,
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub enriched: Map<String, Value>,
}

fn default_severity() -> String {
    "info".to_string()
}

impl Event {
    /// Validate client-supplied fields and stamp the accept-time
    /// invariants: id assigned, timestamp defaulted to wall clock,
    /// enriched cleared (clients may not write it).
    pub fn accept(mut self, max_event_bytes: usize) -> Result<Event> {
        if self.source.is_empty() || self.source.len() > 255 || !NAME_RE.is_match(&self.source) {
            return Err(PipelineError::validation(
                "source must contain only alphanumeric characters, dots, hyphens, and underscores",
            ));
        }
        if self.event_type.is_empty()
            || self.event_type.len() > 100
            || !NAME_RE.is_match(&self.event_type)
        {
            return Err(PipelineError::validation(
                "event_type must contain only alphanumeric characters, dots, hyphens, and underscores",
            ));
        }
        if !matches!(
            self.severity.as_str(),
            "debug" | "info" | "warning" | "error" | "critical"
        ) {
            return Err(PipelineError::validation(format!(
                "invalid severity: {}",
                self.severity
            )));
        }
        let data_bytes = serde_json::to_vec(&self.data)?.len();
        if data_bytes > max_event_bytes {
            return Err(PipelineError::validation(format!(
                "event data exceeds maximum size of {} bytes",
                max_event_bytes
            )));
        }

        if self.id.is_none() {
            self.id = Some(Uuid::new_v4().to_string());
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now());
        }
        self.enriched = Map::new();
        Ok(self)
    }

    /// Dotted-path lookup across top-level fields and `data` / `enriched`.
    /// `data.src_ip` reads `data["src_ip"]`; a bare `source` reads the
    /// top-level field.
    pub fn field(&self, path: &str) -> Option<Value> {
        let mut parts = path.split('.');
        let head = parts.next()?;
        let mut current: Value = match head {
            "id" => Value::from(self.id.clone()?),
            "source" => Value::from(self.source.clone()),
            "event_type" => Value::from(self.event_type.clone()),
            "timestamp" => Value::from(self.timestamp?.to_rfc3339()),
            "vendor" => Value::from(self.vendor.clone()?),
            "severity" => Value::from(self.severity.clone()),
            "data" => Value::Object(self.data.clone()),
            "enriched" => Value::Object(self.enriched.clone()),
            _ => return None,
        };
        for part in parts {
            current = current.get(part)?.clone();
        }
        Some(current)
    }
}

/// Batch ingestion request: up to the configured maximum of events,
/// each attempted independently.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchLogEvents {
    pub events: Vec<Event>,
}

/// Raw line ingestion request. `format` is auto-detected when absent.
#[derive(Debug, Clone, Deserialize)]
pub struct RawLogRequest {
    pub source: String,
    pub log_line: String,
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    pub status: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItemResult {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    pub results: Vec<BatchItemResult>,
    pub summary: BatchSummary,
}

/// Alert severities, ordered from most to least urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert emitted by the detection engine. Append-only; emitted once per
/// (rule, fingerprint) within the rule's throttle window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub source_event: Value,
    pub matched_fields: Map<String, Value>,
    pub tags: Vec<String>,
}

impl Alert {
    /// Dotted-path lookup into the alert, for playbook triggers and
    /// parameter templates (`matched_fields.source_ip`, `severity`, ...).
    pub fn field(&self, path: &str) -> Option<Value> {
        let root = serde_json::to_value(self).ok()?;
        let mut current = root;
        for part in path.split('.') {
            current = current.get(part)?.clone();
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event() -> Event {
        serde_json::from_value(json!({
            "source": "firewall",
            "event_type": "network",
            "data": {"src_ip": "10.0.0.1", "attempts": 5}
        }))
        .unwrap()
    }

    #[test]
    fn accept_assigns_id_and_timestamp() {
        let event = sample_event().accept(1_048_576).unwrap();
        assert!(event.id.is_some());
        assert!(event.timestamp.is_some());
        assert!(event.enriched.is_empty());
    }

    #[test]
    fn accept_rejects_bad_source() {
        let mut event = sample_event();
        event.source = "bad source!".to_string();
        assert!(event.accept(1_048_576).is_err());
    }

    #[test]
    fn accept_strips_client_enrichment() {
        let mut event = sample_event();
        event
            .enriched
            .insert("sneaky".to_string(), json!("value"));
        let event = event.accept(1_048_576).unwrap();
        assert!(event.enriched.is_empty());
    }

    #[test]
    fn dotted_field_lookup() {
        let event = sample_event().accept(1_048_576).unwrap();
        assert_eq!(event.field("data.src_ip"), Some(json!("10.0.0.1")));
        assert_eq!(event.field("data.attempts"), Some(json!(5)));
        assert_eq!(event.field("source"), Some(json!("firewall")));
        assert_eq!(event.field("data.missing"), None);
    }

    #[test]
    fn severity_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Severity::High).unwrap(), "\"high\"");
    }
}
