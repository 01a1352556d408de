//! Detection rule types and the hot-reloadable rule store.
//!
//! Rules are a tagged union on `type`; each variant carries its own
//! payload and evaluator. Rule documents live under the rules directory:
//! `custom/*.json`, `sigma/*.yml`, `yara/*.yml`, `anomaly/*.json`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::detection::anomaly::AnomalyRule;
use crate::detection::custom::CustomRule;
use crate::detection::sigma::SigmaRule;
use crate::detection::yara::YaraRuleSet;
use crate::error::{PipelineError, Result};
use crate::models::Severity;

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RuleKind {
    Custom(CustomRule),
    Sigma(SigmaRule),
    Yara(YaraRuleSet),
    Anomaly(AnomalyRule),
}

impl RuleKind {
    pub fn name(&self) -> &'static str {
        match self {
            RuleKind::Custom(_) => "custom",
            RuleKind::Sigma(_) => "sigma",
            RuleKind::Yara(_) => "yara",
            RuleKind::Anomaly(_) => "anomaly",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRule {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub severity: Severity,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Seconds during which repeated matches of the same fingerprint
    /// are suppressed to one alert.
    #[serde(default)]
    pub throttle_window: Option<u64>,
    /// Field path whose value scopes the throttle fingerprint
    /// (default: the matched fields themselves).
    #[serde(default)]
    pub throttle_key: Option<String>,
    #[serde(flatten)]
    pub kind: RuleKind,
}

impl DetectionRule {
    /// Event-type constraint used to prune evaluation, where the rule
    /// pins one down.
    pub fn event_type_filter(&self) -> Option<&str> {
        match &self.kind {
            RuleKind::Custom(rule) => rule.pinned_event_type(),
            RuleKind::Anomaly(rule) => Some(rule.event_type.as_str()),
            _ => None,
        }
    }

    /// Source constraint used to prune evaluation.
    pub fn source_filter(&self) -> Option<&str> {
        match &self.kind {
            RuleKind::Sigma(rule) => rule.logsource_filter(),
            _ => None,
        }
    }
}

/// Immutable snapshot of all loaded rules, indexed for pruning.
/// Evaluators hold a reference to one snapshot for the duration of one
/// event; hot reload swaps the snapshot atomically.
#[derive(Debug, Default)]
pub struct RuleSet {
    pub rules: Vec<Arc<DetectionRule>>,
    by_event_type: HashMap<String, Vec<usize>>,
    by_source: HashMap<String, Vec<usize>>,
    unconstrained: Vec<usize>,
}

impl RuleSet {
    pub fn new(rules: Vec<DetectionRule>) -> Self {
        let rules: Vec<Arc<DetectionRule>> = rules
            .into_iter()
            .filter(|r| r.enabled)
            .map(Arc::new)
            .collect();
        let mut by_event_type: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_source: HashMap<String, Vec<usize>> = HashMap::new();
        let mut unconstrained = Vec::new();

        for (i, rule) in rules.iter().enumerate() {
            if let Some(event_type) = rule.event_type_filter() {
                by_event_type.entry(event_type.to_string()).or_default().push(i);
            } else if let Some(source) = rule.source_filter() {
                by_source.entry(source.to_string()).or_default().push(i);
            } else {
                unconstrained.push(i);
            }
        }

        Self {
            rules,
            by_event_type,
            by_source,
            unconstrained,
        }
    }

    /// Rules worth evaluating for an event with this type and source.
    pub fn candidates(&self, event_type: &str, source: &str) -> Vec<Arc<DetectionRule>> {
        let mut out: Vec<Arc<DetectionRule>> = Vec::new();
        if let Some(indices) = self.by_event_type.get(event_type) {
            out.extend(indices.iter().map(|&i| self.rules[i].clone()));
        }
        if let Some(indices) = self.by_source.get(source) {
            out.extend(indices.iter().map(|&i| self.rules[i].clone()));
        }
        out.extend(self.unconstrained.iter().map(|&i| self.rules[i].clone()));
        out
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Loads rule documents from disk and hands out immutable snapshots.
pub struct RuleStore {
    rules_dir: std::path::PathBuf,
    snapshot: RwLock<Arc<RuleSet>>,
}

impl RuleStore {
    /// Load all rules at startup. A directory that is missing entirely
    /// is tolerated (empty set); an unreadable or unparseable rule file
    /// is a startup failure.
    pub fn load(rules_dir: impl AsRef<Path>) -> Result<Self> {
        let rules_dir = rules_dir.as_ref().to_path_buf();
        let ruleset = Self::load_dir(&rules_dir)?;
        tracing::info!(count = ruleset.len(), dir = %rules_dir.display(), "loaded detection rules");
        Ok(Self {
            rules_dir,
            snapshot: RwLock::new(Arc::new(ruleset)),
        })
    }

    fn load_dir(dir: &Path) -> Result<RuleSet> {
        let mut rules = Vec::new();
        if !dir.exists() {
            tracing::warn!(dir = %dir.display(), "rules directory not found, starting empty");
            return Ok(RuleSet::new(rules));
        }
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            for entry in std::fs::read_dir(&current)? {
                let path = entry?.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
                let rule: DetectionRule = match ext {
                    "json" => {
                        let content = std::fs::read_to_string(&path)?;
                        serde_json::from_str(&content).map_err(|e| {
                            PipelineError::config(format!(
                                "bad rule file {}: {}",
                                path.display(),
                                e
                            ))
                        })?
                    }
                    "yml" | "yaml" => {
                        let content = std::fs::read_to_string(&path)?;
                        serde_yaml::from_str(&content).map_err(|e| {
                            PipelineError::config(format!(
                                "bad rule file {}: {}",
                                path.display(),
                                e
                            ))
                        })?
                    }
                    _ => continue,
                };
                rules.push(rule);
            }
        }
        Ok(RuleSet::new(rules))
    }

    /// Current immutable snapshot.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.snapshot.read().expect("rule store lock").clone()
    }

    /// Re-read the rules directory and swap the snapshot. In-flight
    /// evaluations keep the snapshot they started with.
    pub fn reload(&self) -> Result<usize> {
        let ruleset = Self::load_dir(&self.rules_dir)?;
        let count = ruleset.len();
        *self.snapshot.write().expect("rule store lock") = Arc::new(ruleset);
        tracing::info!(count, "reloaded detection rules");
        Ok(count)
    }

    /// Build a store directly from rules, bypassing the filesystem.
    pub fn from_rules(rules: Vec<DetectionRule>) -> Self {
        Self {
            rules_dir: std::path::PathBuf::new(),
            snapshot: RwLock::new(Arc::new(RuleSet::new(rules))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn custom_rule_json(id: &str, event_type: Option<&str>) -> DetectionRule {
        let mut conditions = vec![json!({"field": "data.x", "op": "eq", "value": 1})];
        if let Some(et) = event_type {
            conditions.push(json!({"field": "event_type", "op": "eq", "value": et}));
        }
        serde_json::from_value(json!({
            "id": id,
            "title": id,
            "severity": "low",
            "type": "custom",
            "operator": "and",
            "conditions": conditions,
        }))
        .unwrap()
    }

    #[test]
    fn tagged_union_deserializes() {
        let rule: DetectionRule = serde_json::from_value(json!({
            "id": "r1",
            "title": "Custom rule",
            "severity": "high",
            "type": "custom",
            "operator": "and",
            "conditions": [{"field": "data.src_ip", "op": "eq", "value": "1.2.3.4"}],
        }))
        .unwrap();
        assert_eq!(rule.kind.name(), "custom");
        assert!(rule.enabled);
        assert!(rule.throttle_window.is_none());
    }

    #[test]
    fn disabled_rules_are_dropped_from_snapshot() {
        let mut rule = custom_rule_json("r1", None);
        rule.enabled = false;
        let ruleset = RuleSet::new(vec![rule, custom_rule_json("r2", None)]);
        assert_eq!(ruleset.len(), 1);
    }

    #[test]
    fn candidates_prune_by_event_type() {
        let ruleset = RuleSet::new(vec![
            custom_rule_json("auth-only", Some("authentication")),
            custom_rule_json("all-events", None),
        ]);
        let for_auth = ruleset.candidates("authentication", "any");
        assert_eq!(for_auth.len(), 2);
        let for_net = ruleset.candidates("network", "any");
        assert_eq!(for_net.len(), 1);
        assert_eq!(for_net[0].id, "all-events");
    }

    #[test]
    fn reload_swaps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::load(dir.path()).unwrap();
        assert!(store.snapshot().is_empty());

        std::fs::write(
            dir.path().join("rule.json"),
            serde_json::to_string(&custom_rule_json("fresh", None)).unwrap(),
        )
        .unwrap();
        let count = store.reload().unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.snapshot().len(), 1);
    }
}
