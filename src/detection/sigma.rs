//! Sigma-dialect rule evaluation.
//!
//! Rules are parsed once at load. Detection blocks hold named selections
//! plus a condition expression (`selection`, `all of them`,
//! `any of them`, `a and b`, `a or b`). Values support `*` wildcards and
//! the field modifiers `contains`, `startswith`, `endswith`, `re`,
//! `base64`.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::detection::custom::cached_regex;
use crate::models::Event;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogSource {
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigmaRule {
    #[serde(default)]
    pub logsource: LogSource,
    /// Named selections plus the `condition` entry.
    pub detection: Map<String, Value>,
}

impl SigmaRule {
    /// Source constraint for pruning: `logsource.service` wins over
    /// `logsource.product`.
    pub fn logsource_filter(&self) -> Option<&str> {
        self.logsource
            .service
            .as_deref()
            .or(self.logsource.product.as_deref())
    }

    fn condition(&self) -> String {
        self.detection
            .get("condition")
            .and_then(|v| v.as_str())
            .unwrap_or("all of them")
            .to_string()
    }

    fn selections(&self) -> impl Iterator<Item = (&String, &Map<String, Value>)> {
        self.detection.iter().filter_map(|(name, value)| {
            if name == "condition" {
                return None;
            }
            value.as_object().map(|m| (name, m))
        })
    }

    pub fn matches(&self, event: &Event) -> Option<Map<String, Value>> {
        if let Some(source) = self.logsource_filter() {
            if event.source != source {
                return None;
            }
        }
        if let Some(category) = self.logsource.category.as_deref() {
            if event.event_type != category {
                return None;
            }
        }

        let condition = self.condition();
        let matched = match condition.as_str() {
            "all of them" => self.selections().all(|(_, sel)| selection_matches(sel, event)),
            "any of them" => self.selections().any(|(_, sel)| selection_matches(sel, event)),
            expr if expr.contains(" and ") => expr
                .split(" and ")
                .all(|name| self.named_selection_matches(name.trim(), event)),
            expr if expr.contains(" or ") => expr
                .split(" or ")
                .any(|name| self.named_selection_matches(name.trim(), event)),
            name => self.named_selection_matches(name.trim(), event),
        };
        if !matched {
            return None;
        }

        let mut fields = Map::new();
        for (_, selection) in self.selections() {
            for (field_spec, expected) in selection {
                let (field, _) = split_modifier(field_spec);
                if let Some(actual) = lookup(event, field) {
                    if entry_matches(event, field_spec, expected) {
                        fields.insert(field.to_string(), actual);
                    }
                }
            }
        }
        Some(fields)
    }

    fn named_selection_matches(&self, name: &str, event: &Event) -> bool {
        self.detection
            .get(name)
            .and_then(|v| v.as_object())
            .map(|sel| selection_matches(sel, event))
            .unwrap_or(false)
    }
}

fn selection_matches(selection: &Map<String, Value>, event: &Event) -> bool {
    selection
        .iter()
        .all(|(field_spec, expected)| entry_matches(event, field_spec, expected))
}

fn entry_matches(event: &Event, field_spec: &str, expected: &Value) -> bool {
    let (field, modifier) = split_modifier(field_spec);
    let actual = match lookup(event, field) {
        Some(v) => v,
        None => return false,
    };
    match expected {
        Value::Array(options) => options
            .iter()
            .any(|option| value_matches(&actual, option, modifier)),
        other => value_matches(&actual, other, modifier),
    }
}

fn split_modifier(field_spec: &str) -> (&str, Option<&str>) {
    match field_spec.split_once('|') {
        Some((field, modifier)) => (field, Some(modifier)),
        None => (field_spec, None),
    }
}

/// Sigma fields name log attributes; try the literal path first, then
/// under `data`.
fn lookup(event: &Event, field: &str) -> Option<Value> {
    event
        .field(field)
        .or_else(|| event.field(&format!("data.{}", field)))
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_matches(actual: &Value, expected: &Value, modifier: Option<&str>) -> bool {
    let actual_text = value_as_text(actual);
    let expected_text = value_as_text(expected);

    match modifier {
        Some("contains") => actual_text.contains(&expected_text),
        Some("startswith") => actual_text.starts_with(&expected_text),
        Some("endswith") => actual_text.ends_with(&expected_text),
        Some("re") => cached_regex(&expected_text)
            .map(|re| re.is_match(&actual_text))
            .unwrap_or(false),
        Some("base64") => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&expected_text);
            actual_text.contains(&encoded)
        }
        Some(_) | None => wildcard_match(&actual_text, &expected_text),
    }
}

/// Plain Sigma value matching: exact unless the pattern carries leading
/// and/or trailing `*`.
fn wildcard_match(actual: &str, pattern: &str) -> bool {
    let starts = pattern.starts_with('*');
    let ends = pattern.ends_with('*');
    let core = pattern.trim_matches('*');
    match (starts, ends) {
        (true, true) => actual.contains(core),
        (true, false) => actual.ends_with(core),
        (false, true) => actual.starts_with(core),
        (false, false) => actual == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(source: &str, event_type: &str, data: Value) -> Event {
        serde_json::from_value(json!({
            "source": source,
            "event_type": event_type,
            "timestamp": "2024-02-05T14:11:05Z",
            "data": data,
        }))
        .unwrap()
    }

    fn rule(yaml: &str) -> SigmaRule {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn all_of_them_condition() {
        let rule = rule(
            r#"
logsource:
  product: windows
detection:
  selection_img:
    Image|endswith: "\\powershell.exe"
  selection_cmd:
    CommandLine|contains: "-enc"
  condition: all of them
"#,
        );
        let matching = event(
            "windows",
            "process",
            json!({"Image": "C:\\Tools\\powershell.exe", "CommandLine": "powershell -enc SQBFAFgA"}),
        );
        assert!(rule.matches(&matching).is_some());

        let non_matching = event(
            "windows",
            "process",
            json!({"Image": "C:\\Tools\\powershell.exe", "CommandLine": "powershell -File x.ps1"}),
        );
        assert!(rule.matches(&non_matching).is_none());
    }

    #[test]
    fn logsource_prunes_other_sources() {
        let rule = rule(
            r#"
logsource:
  service: sshd
detection:
  selection:
    message|contains: "Failed password"
  condition: selection
"#,
        );
        assert!(rule
            .matches(&event("sshd", "log", json!({"message": "Failed password for root"})))
            .is_some());
        assert!(rule
            .matches(&event("nginx", "log", json!({"message": "Failed password for root"})))
            .is_none());
    }

    #[test]
    fn and_or_conditions() {
        let rule1 = rule(
            r#"
detection:
  a:
    status: 401
  b:
    path|startswith: "/admin"
  condition: a and b
"#,
        );
        assert!(rule1
            .matches(&event("web", "log", json!({"status": 401, "path": "/admin/users"})))
            .is_some());
        assert!(rule1
            .matches(&event("web", "log", json!({"status": 401, "path": "/public"})))
            .is_none());

        let rule2 = rule(
            r#"
detection:
  a:
    status: 500
  b:
    status: 503
  condition: a or b
"#,
        );
        assert!(rule2.matches(&event("web", "log", json!({"status": 503}))).is_some());
    }

    #[test]
    fn wildcard_values() {
        let rule = rule(
            r#"
detection:
  selection:
    useragent: "*sqlmap*"
  condition: selection
"#,
        );
        assert!(rule
            .matches(&event("web", "log", json!({"useragent": "Mozilla sqlmap/1.5"})))
            .is_some());
        assert!(rule
            .matches(&event("web", "log", json!({"useragent": "Mozilla Firefox"})))
            .is_none());
    }

    #[test]
    fn list_values_match_any() {
        let rule = rule(
            r#"
detection:
  selection:
    program:
      - sshd
      - sudo
  condition: selection
"#,
        );
        assert!(rule
            .matches(&event("syslog", "log", json!({"program": "sudo"})))
            .is_some());
        assert!(rule
            .matches(&event("syslog", "log", json!({"program": "cron"})))
            .is_none());
    }

    #[test]
    fn re_and_base64_modifiers() {
        let rule1 = rule(
            r#"
detection:
  selection:
    command|re: "curl\\s+https?://"
  condition: selection
"#,
        );
        assert!(rule1
            .matches(&event("sh", "log", json!({"command": "curl http://evil.example"})))
            .is_some());

        let rule2 = rule(
            r#"
detection:
  selection:
    payload|base64: "whoami"
  condition: selection
"#,
        );
        // "whoami" base64-encodes to d2hvYW1p
        assert!(rule2
            .matches(&event("sh", "log", json!({"payload": "prefix d2hvYW1p suffix"})))
            .is_some());
    }

    #[test]
    fn matched_fields_are_reported() {
        let rule = rule(
            r#"
detection:
  selection:
    src_ip: "10.0.0.1"
  condition: selection
"#,
        );
        let fields = rule
            .matches(&event("fw", "network", json!({"src_ip": "10.0.0.1"})))
            .unwrap();
        assert_eq!(fields["src_ip"], "10.0.0.1");
    }
}
