//! Detection engine: selects candidate rules for each processed event,
//! runs the evaluators, throttles repeats, and emits alerts.

pub mod anomaly;
pub mod custom;
pub mod rules;
pub mod sigma;
pub mod yara;

use chrono::Utc;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::DetectionSettings;
use crate::models::{Alert, Event};
use rules::{DetectionRule, RuleKind, RuleStore};

pub struct DetectionEngine {
    store: Arc<RuleStore>,
    throttle: Mutex<HashMap<String, u64>>,
    default_throttle_secs: u64,
}

impl DetectionEngine {
    pub fn new(store: Arc<RuleStore>, settings: &DetectionSettings) -> Self {
        Self {
            store,
            throttle: Mutex::new(HashMap::new()),
            default_throttle_secs: settings.throttle_default_secs,
        }
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    /// Evaluate every candidate rule against the event. Alerts for the
    /// event are returned together, after all rules have run. A rule
    /// whose evaluator errors is logged and skipped; evaluation
    /// continues with the remaining rules.
    pub async fn evaluate(&self, event: &Event) -> Vec<Alert> {
        let snapshot = self.store.snapshot();
        let candidates = snapshot.candidates(&event.event_type, &event.source);
        let mut alerts = Vec::new();

        for rule in candidates {
            match self.evaluate_rule(&rule, event).await {
                Ok(Some(matched_fields)) => {
                    if self.throttled(&rule, event, &matched_fields).await {
                        tracing::debug!(rule_id = %rule.id, "alert suppressed by throttle window");
                        continue;
                    }
                    alerts.push(self.build_alert(&rule, event, matched_fields));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(rule_id = %rule.id, error = %e, "rule evaluation failed");
                }
            }
        }

        alerts
    }

    async fn evaluate_rule(
        &self,
        rule: &DetectionRule,
        event: &Event,
    ) -> crate::error::Result<Option<Map<String, Value>>> {
        match &rule.kind {
            RuleKind::Custom(custom) => Ok(custom.matches(event)),
            RuleKind::Sigma(sigma) => Ok(sigma.matches(event)),
            RuleKind::Yara(ruleset) => {
                let content = match yara::YaraRuleSet::extract_content(event).await {
                    Some(content) => content,
                    None => return Ok(None),
                };
                Ok(ruleset.scan(&content)?.map(|(_, fields)| fields))
            }
            RuleKind::Anomaly(anomaly) => Ok(anomaly.matches(event)),
        }
    }

    /// Throttle fingerprint: the rule-scoped key field when declared,
    /// otherwise the matched fields themselves.
    fn fingerprint(
        rule: &DetectionRule,
        event: &Event,
        matched_fields: &Map<String, Value>,
    ) -> String {
        let material = match rule
            .throttle_key
            .as_deref()
            .and_then(|path| event.field(path))
        {
            Some(value) => value.to_string(),
            None => {
                let mut keys: Vec<_> = matched_fields.iter().collect();
                keys.sort_by(|a, b| a.0.cmp(b.0));
                keys.iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join("|")
            }
        };
        let digest = Sha256::digest(format!("{}|{}", rule.id, material).as_bytes());
        format!("{:x}", digest)
    }

    async fn throttled(
        &self,
        rule: &DetectionRule,
        event: &Event,
        matched_fields: &Map<String, Value>,
    ) -> bool {
        let window = rule.throttle_window.unwrap_or(self.default_throttle_secs);
        if window == 0 {
            return false;
        }
        let key = Self::fingerprint(rule, event, matched_fields);
        let now = Utc::now().timestamp() as u64;

        let mut throttle = self.throttle.lock().await;
        throttle.retain(|_, expiry| *expiry > now);
        if throttle.contains_key(&key) {
            return true;
        }
        throttle.insert(key, now + window);
        false
    }

    fn build_alert(
        &self,
        rule: &DetectionRule,
        event: &Event,
        matched_fields: Map<String, Value>,
    ) -> Alert {
        Alert {
            id: format!("{}_{}_{}", rule.kind.name(), rule.id, Uuid::new_v4()),
            rule_id: rule.id.clone(),
            rule_name: rule.title.clone(),
            severity: rule.severity,
            title: rule.title.clone(),
            description: rule.description.clone(),
            timestamp: Utc::now(),
            source_event: serde_json::to_value(event).unwrap_or(Value::Null),
            matched_fields,
            tags: rule.tags.clone(),
        }
    }
}
