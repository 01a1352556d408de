//! Unsupervised outlier detection keyed by event type.
//!
//! Each rule carries a trained baseline: per-feature mean and standard
//! deviation over a fixed feature vector extracted from `data`. Numeric
//! fields are standardized; categorical fields hash into a stable
//! bucket. The verdict is binary: an event whose maximum absolute
//! z-score reaches the rule threshold is an outlier.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::models::Event;

const CATEGORICAL_BUCKETS: u64 = 1024;
// Floor for stddev so constant features do not divide by zero.
const MIN_STDDEV: f64 = 1e-9;

fn default_threshold() -> f64 {
    3.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeatureKind {
    #[default]
    Numeric,
    Categorical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub field: String,
    #[serde(default)]
    pub kind: FeatureKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Baseline {
    pub mean: Vec<f64>,
    pub stddev: Vec<f64>,
    #[serde(default)]
    pub sample_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyRule {
    pub event_type: String,
    pub features: Vec<FeatureSpec>,
    pub baseline: Baseline,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

/// Stable bucket value for a categorical feature.
fn hash_categorical(text: &str) -> f64 {
    let digest = Sha256::digest(text.as_bytes());
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(word) % CATEGORICAL_BUCKETS) as f64
}

impl AnomalyRule {
    /// Extract the fixed feature vector from an event. Missing or
    /// uncoercible numeric fields read as 0.0.
    pub fn feature_vector(&self, event: &Event) -> Vec<f64> {
        self.features
            .iter()
            .map(|spec| {
                let value = event
                    .field(&spec.field)
                    .or_else(|| event.field(&format!("data.{}", spec.field)));
                match spec.kind {
                    FeatureKind::Numeric => value
                        .as_ref()
                        .and_then(|v| match v {
                            Value::Number(n) => n.as_f64(),
                            Value::String(s) => s.parse().ok(),
                            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                            _ => None,
                        })
                        .unwrap_or(0.0),
                    FeatureKind::Categorical => value
                        .as_ref()
                        .map(|v| match v {
                            Value::String(s) => hash_categorical(s),
                            other => hash_categorical(&other.to_string()),
                        })
                        .unwrap_or(0.0),
                }
            })
            .collect()
    }

    /// Maximum absolute z-score of the vector against the baseline.
    pub fn score(&self, vector: &[f64]) -> f64 {
        vector
            .iter()
            .zip(self.baseline.mean.iter())
            .zip(self.baseline.stddev.iter())
            .map(|((x, mean), stddev)| (x - mean).abs() / stddev.max(MIN_STDDEV))
            .fold(0.0, f64::max)
    }

    /// Binary outlier verdict with the matched score, when anomalous.
    pub fn matches(&self, event: &Event) -> Option<Map<String, Value>> {
        if event.event_type != self.event_type {
            return None;
        }
        if self.baseline.mean.len() != self.features.len()
            || self.baseline.stddev.len() != self.features.len()
        {
            tracing::warn!(
                event_type = %self.event_type,
                "anomaly baseline shape does not match features, skipping"
            );
            return None;
        }
        let vector = self.feature_vector(event);
        let score = self.score(&vector);
        if score < self.threshold {
            return None;
        }
        let mut fields = Map::new();
        fields.insert("anomaly_score".into(), Value::from(score));
        for (spec, value) in self.features.iter().zip(vector) {
            fields.insert(spec.field.clone(), Value::from(value));
        }
        Some(fields)
    }

    /// Fit the baseline from observed vectors (population stddev).
    pub fn fit(&mut self, samples: &[Vec<f64>]) {
        let dims = self.features.len();
        let count = samples.len();
        if count == 0 {
            self.baseline = Baseline::default();
            return;
        }
        let mut mean = vec![0.0; dims];
        for sample in samples {
            for (i, value) in sample.iter().take(dims).enumerate() {
                mean[i] += value;
            }
        }
        for value in mean.iter_mut() {
            *value /= count as f64;
        }
        let mut variance = vec![0.0; dims];
        for sample in samples {
            for (i, value) in sample.iter().take(dims).enumerate() {
                let delta = value - mean[i];
                variance[i] += delta * delta;
            }
        }
        let stddev = variance
            .into_iter()
            .map(|v| (v / count as f64).sqrt())
            .collect();
        self.baseline = Baseline {
            mean,
            stddev,
            sample_count: count as u64,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn login_event(hour: f64, attempts: f64) -> Event {
        serde_json::from_value(json!({
            "source": "auth",
            "event_type": "login",
            "timestamp": "2024-02-05T14:11:05Z",
            "data": {"hour": hour, "attempts": attempts},
        }))
        .unwrap()
    }

    fn trained_rule() -> AnomalyRule {
        let mut rule: AnomalyRule = serde_json::from_value(json!({
            "event_type": "login",
            "features": [
                {"field": "hour", "kind": "numeric"},
                {"field": "attempts", "kind": "numeric"},
            ],
            "baseline": {"mean": [], "stddev": []},
        }))
        .unwrap();
        // Typical logins: business hours, one or two attempts.
        let samples: Vec<Vec<f64>> = (0..100)
            .map(|i| vec![9.0 + (i % 8) as f64, 1.0 + (i % 2) as f64])
            .collect();
        rule.fit(&samples);
        rule
    }

    #[test]
    fn fit_produces_sane_baseline() {
        let rule = trained_rule();
        assert_eq!(rule.baseline.sample_count, 100);
        assert!((rule.baseline.mean[0] - 12.5).abs() < 0.1);
        assert!(rule.baseline.stddev[0] > 1.0);
    }

    #[test]
    fn near_centroid_is_not_an_outlier() {
        let rule = trained_rule();
        assert!(rule.matches(&login_event(12.0, 1.0)).is_none());
    }

    #[test]
    fn far_from_centroid_is_an_outlier() {
        let rule = trained_rule();
        // 40 attempts is far beyond three standard deviations.
        let fields = rule.matches(&login_event(3.0, 40.0)).unwrap();
        assert!(fields["anomaly_score"].as_f64().unwrap() >= 3.0);
        assert_eq!(fields["attempts"], 40.0);
    }

    #[test]
    fn wrong_event_type_is_skipped() {
        let rule = trained_rule();
        let mut event = login_event(3.0, 40.0);
        event.event_type = "network".to_string();
        assert!(rule.matches(&event).is_none());
    }

    #[test]
    fn categorical_features_hash_stably() {
        let a = hash_categorical("alice");
        assert_eq!(a, hash_categorical("alice"));
        assert!(a >= 0.0 && a < CATEGORICAL_BUCKETS as f64);
    }

    #[test]
    fn mismatched_baseline_shape_is_skipped() {
        let rule: AnomalyRule = serde_json::from_value(json!({
            "event_type": "login",
            "features": [{"field": "hour"}],
            "baseline": {"mean": [1.0, 2.0], "stddev": [1.0, 1.0]},
        }))
        .unwrap();
        assert!(rule.matches(&login_event(99.0, 0.0)).is_none());
    }
}
