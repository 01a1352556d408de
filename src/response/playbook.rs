//! Playbook documents and the hot-reloadable playbook store.
//!
//! A playbook fires when all of its triggers match the alert; its
//! actions then run in declaration order, each gated by its own
//! conditions against the same alert.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::detection::custom::cached_regex;
use crate::error::{PipelineError, Result};
use crate::models::Alert;

fn default_enabled() -> bool {
    true
}

fn default_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOp {
    Equals,
    Contains,
    Matches,
    In,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerCondition {
    pub field: String,
    pub op: TriggerOp,
    pub value: Value,
}

impl TriggerCondition {
    pub fn matches(&self, alert: &Alert) -> bool {
        let actual = match alert.field(&self.field) {
            Some(v) => v,
            None => return false,
        };
        match self.op {
            TriggerOp::Equals => actual == self.value,
            TriggerOp::Contains => match (&actual, &self.value) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle),
                (Value::Array(items), needle) => items.contains(needle),
                _ => false,
            },
            TriggerOp::Matches => match (&actual, self.value.as_str()) {
                (Value::String(text), Some(pattern)) => cached_regex(pattern)
                    .map(|re| re.is_match(text))
                    .unwrap_or(false),
                _ => false,
            },
            TriggerOp::In => match &self.value {
                Value::Array(options) => options.contains(&actual),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookAction {
    /// Driver selector: thehive, cortex, ansible, python, webhook.
    #[serde(rename = "type")]
    pub action_type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub conditions: Vec<TriggerCondition>,
    /// Seconds before the driver call is abandoned.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Abort the remaining actions when this one fails.
    #[serde(default)]
    pub fail_stop: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub triggers: Vec<TriggerCondition>,
    pub actions: Vec<PlaybookAction>,
}

impl Playbook {
    /// All triggers must match (AND) for the playbook to fire.
    pub fn matches(&self, alert: &Alert) -> bool {
        self.enabled && self.triggers.iter().all(|t| t.matches(alert))
    }
}

pub struct PlaybookStore {
    playbooks_dir: std::path::PathBuf,
    snapshot: RwLock<Arc<Vec<Playbook>>>,
}

impl PlaybookStore {
    pub fn load(playbooks_dir: impl AsRef<Path>) -> Result<Self> {
        let playbooks_dir = playbooks_dir.as_ref().to_path_buf();
        let playbooks = Self::load_dir(&playbooks_dir)?;
        tracing::info!(
            count = playbooks.len(),
            dir = %playbooks_dir.display(),
            "loaded playbooks"
        );
        Ok(Self {
            playbooks_dir,
            snapshot: RwLock::new(Arc::new(playbooks)),
        })
    }

    fn load_dir(dir: &Path) -> Result<Vec<Playbook>> {
        let mut playbooks = Vec::new();
        if !dir.exists() {
            tracing::warn!(dir = %dir.display(), "playbooks directory not found, starting empty");
            return Ok(playbooks);
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
                if !matches!(ext, "yml" | "yaml") {
                    continue;
                }
                let content = std::fs::read_to_string(&path)?;
                let playbook: Playbook = serde_yaml::from_str(&content).map_err(|e| {
                    PipelineError::config(format!("bad playbook {}: {}", path.display(), e))
                })?;
                playbooks.push(playbook);
            }
        }
        Ok(playbooks)
    }

    pub fn snapshot(&self) -> Arc<Vec<Playbook>> {
        self.snapshot.read().expect("playbook store lock").clone()
    }

    pub fn reload(&self) -> Result<usize> {
        let playbooks = Self::load_dir(&self.playbooks_dir)?;
        let count = playbooks.len();
        *self.snapshot.write().expect("playbook store lock") = Arc::new(playbooks);
        tracing::info!(count, "reloaded playbooks");
        Ok(count)
    }

    pub fn from_playbooks(playbooks: Vec<Playbook>) -> Self {
        Self {
            playbooks_dir: std::path::PathBuf::new(),
            snapshot: RwLock::new(Arc::new(playbooks)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use chrono::Utc;
    use serde_json::json;

    fn alert(severity: Severity, tags: Vec<&str>) -> Alert {
        Alert {
            id: "a1".into(),
            rule_id: "r1".into(),
            rule_name: "rule".into(),
            severity,
            title: "t".into(),
            description: "d".into(),
            timestamp: Utc::now(),
            source_event: json!({}),
            matched_fields: json!({"source_ip": "10.0.0.9"})
                .as_object()
                .unwrap()
                .clone(),
            tags: tags.into_iter().map(String::from).collect(),
        }
    }

    const PLAYBOOK_YAML: &str = r#"
id: incident_response_high_severity
name: High severity incident response
triggers:
  - field: severity
    op: equals
    value: high
  - field: tags
    op: contains
    value: security
actions:
  - type: thehive
    name: create_case
    parameters:
      title: "{{ alert.title }}"
"#;

    #[test]
    fn parses_and_matches_triggers_with_and_semantics() {
        let playbook: Playbook = serde_yaml::from_str(PLAYBOOK_YAML).unwrap();
        assert!(playbook.matches(&alert(Severity::High, vec!["security"])));
        // One trigger failing is enough to skip the playbook.
        assert!(!playbook.matches(&alert(Severity::High, vec!["ops"])));
        assert!(!playbook.matches(&alert(Severity::Low, vec!["security"])));
    }

    #[test]
    fn disabled_playbook_never_matches() {
        let mut playbook: Playbook = serde_yaml::from_str(PLAYBOOK_YAML).unwrap();
        playbook.enabled = false;
        assert!(!playbook.matches(&alert(Severity::High, vec!["security"])));
    }

    #[test]
    fn trigger_ops() {
        let alert = alert(Severity::High, vec!["security"]);

        let t: TriggerCondition = serde_json::from_value(
            json!({"field": "matched_fields.source_ip", "op": "matches", "value": r"^10\."}),
        )
        .unwrap();
        assert!(t.matches(&alert));

        let t: TriggerCondition = serde_json::from_value(
            json!({"field": "severity", "op": "in", "value": ["critical", "high"]}),
        )
        .unwrap();
        assert!(t.matches(&alert));

        let t: TriggerCondition = serde_json::from_value(
            json!({"field": "matched_fields.missing", "op": "equals", "value": 1}),
        )
        .unwrap();
        assert!(!t.matches(&alert));
    }

    #[test]
    fn action_defaults() {
        let playbook: Playbook = serde_yaml::from_str(PLAYBOOK_YAML).unwrap();
        let action = &playbook.actions[0];
        assert_eq!(action.timeout, 300);
        assert!(!action.fail_stop);
        assert!(action.conditions.is_empty());
    }

    #[test]
    fn reload_picks_up_new_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlaybookStore::load(dir.path()).unwrap();
        assert!(store.snapshot().is_empty());
        std::fs::write(dir.path().join("pb.yml"), PLAYBOOK_YAML).unwrap();
        assert_eq!(store.reload().unwrap(), 1);
    }
}
