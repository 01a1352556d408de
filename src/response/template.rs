//! Strict parameter templating for playbook actions.
//!
//! `{{ alert.matched_fields.source_ip }}` placeholders are substituted
//! from the triggering alert. Rendering is side-effect free and strict:
//! a placeholder that resolves to nothing is an error, so a playbook
//! cannot silently fire an action with a half-rendered parameter.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{PipelineError, Result};
use crate::models::Alert;

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([a-zA-Z0-9_.]+)\s*\}\}").unwrap());

fn resolve(alert: &Alert, path: &str) -> Option<Value> {
    let rest = path.strip_prefix("alert.").unwrap_or(path);
    alert.field(rest)
}

fn render_text(template: &str, alert: &Alert) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER_RE.captures_iter(template) {
        let whole = caps.get(0).unwrap();
        let path = caps.get(1).unwrap().as_str();
        let value = resolve(alert, path).ok_or_else(|| {
            PipelineError::response(format!("template references unknown field: {}", path))
        })?;
        out.push_str(&template[last..whole.start()]);
        match value {
            Value::String(s) => out.push_str(&s),
            other => out.push_str(&other.to_string()),
        }
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Render every string leaf of the parameter document against the alert.
pub fn render_parameters(parameters: &Value, alert: &Alert) -> Result<Value> {
    Ok(match parameters {
        Value::String(s) => Value::String(render_text(s, alert)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_parameters(item, alert))
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                out.insert(key.clone(), render_parameters(value, alert)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use chrono::Utc;
    use serde_json::json;

    fn alert() -> Alert {
        Alert {
            id: "a1".into(),
            rule_id: "r1".into(),
            rule_name: "SSH brute force".into(),
            severity: Severity::High,
            title: "SSH brute force".into(),
            description: "desc".into(),
            timestamp: Utc::now(),
            source_event: json!({"source": "sshd"}),
            matched_fields: json!({"source_ip": "10.0.0.9", "attempts": 12})
                .as_object()
                .unwrap()
                .clone(),
            tags: vec!["security".into()],
        }
    }

    #[test]
    fn renders_alert_fields() {
        let params = json!({
            "title": "Case for {{ alert.rule_name }}",
            "host": "{{ alert.matched_fields.source_ip }}",
            "count": "{{ alert.matched_fields.attempts }}",
        });
        let rendered = render_parameters(&params, &alert()).unwrap();
        assert_eq!(rendered["title"], "Case for SSH brute force");
        assert_eq!(rendered["host"], "10.0.0.9");
        assert_eq!(rendered["count"], "12");
    }

    #[test]
    fn renders_nested_and_array_parameters() {
        let params = json!({
            "inventory": {"hosts": ["{{ alert.matched_fields.source_ip }}"]},
            "severity": "{{ alert.severity }}",
        });
        let rendered = render_parameters(&params, &alert()).unwrap();
        assert_eq!(rendered["inventory"]["hosts"][0], "10.0.0.9");
        assert_eq!(rendered["severity"], "high");
    }

    #[test]
    fn unknown_field_is_an_error() {
        let params = json!({"x": "{{ alert.matched_fields.file_hash }}"});
        assert!(render_parameters(&params, &alert()).is_err());
    }

    #[test]
    fn non_string_leaves_pass_through() {
        let params = json!({"timeout": 30, "wait": true});
        let rendered = render_parameters(&params, &alert()).unwrap();
        assert_eq!(rendered["timeout"], 30);
        assert_eq!(rendered["wait"], true);
    }
}
