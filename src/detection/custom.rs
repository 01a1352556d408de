//! Custom boolean rules: field-level conditions joined by AND/OR.
//!
//! Field paths traverse the event with dots (`data.src_ip`). Operator
//! coercions are type-checked; a type mismatch is a non-match, never an
//! evaluation error.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::models::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Contains,
    Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: Op,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomRule {
    #[serde(default)]
    pub operator: Operator,
    pub conditions: Vec<Condition>,
}

// Compiled patterns are shared across rules and reloads; invalid
// patterns are remembered as None so they fail to match, not to error.
static REGEX_CACHE: Lazy<Mutex<HashMap<String, Option<Regex>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub(crate) fn cached_regex(pattern: &str) -> Option<Regex> {
    let mut cache = REGEX_CACHE.lock().expect("regex cache lock");
    cache
        .entry(pattern.to_string())
        .or_insert_with(|| match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(pattern, error = %e, "invalid regex in rule condition");
                None
            }
        })
        .clone()
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    // 5 == 5.0 == "5"
    match (as_number(actual), as_number(expected)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

impl Condition {
    /// Whether the condition holds for the event. Missing fields and
    /// uncoercible types are non-matches.
    pub fn matches(&self, event: &Event) -> bool {
        let actual = match event.field(&self.field) {
            Some(v) => v,
            None => return false,
        };

        match self.op {
            Op::Eq => values_equal(&actual, &self.value),
            Op::Ne => !values_equal(&actual, &self.value),
            Op::Gt | Op::Gte | Op::Lt | Op::Lte => {
                match (as_number(&actual), as_number(&self.value)) {
                    (Some(a), Some(b)) => match self.op {
                        Op::Gt => a > b,
                        Op::Gte => a >= b,
                        Op::Lt => a < b,
                        Op::Lte => a <= b,
                        _ => unreachable!(),
                    },
                    _ => false,
                }
            }
            Op::In => match &self.value {
                Value::Array(options) => options.iter().any(|o| values_equal(&actual, o)),
                _ => false,
            },
            Op::NotIn => match &self.value {
                Value::Array(options) => !options.iter().any(|o| values_equal(&actual, o)),
                _ => false,
            },
            Op::Contains => match (&actual, as_text(&self.value)) {
                (Value::String(haystack), Some(needle)) => haystack.contains(&needle),
                (Value::Array(items), Some(_)) => {
                    items.iter().any(|item| values_equal(item, &self.value))
                }
                _ => false,
            },
            Op::Regex => match (as_text(&actual), self.value.as_str()) {
                (Some(text), Some(pattern)) => cached_regex(pattern)
                    .map(|re| re.is_match(&text))
                    .unwrap_or(false),
                _ => false,
            },
        }
    }
}

impl CustomRule {
    pub fn matches(&self, event: &Event) -> Option<Map<String, Value>> {
        let matched = match self.operator {
            Operator::And => self.conditions.iter().all(|c| c.matches(event)),
            Operator::Or => self.conditions.iter().any(|c| c.matches(event)),
        };
        if !matched {
            return None;
        }

        let mut fields = Map::new();
        for condition in &self.conditions {
            if condition.matches(event) {
                if let Some(value) = event.field(&condition.field) {
                    let key = condition
                        .field
                        .rsplit('.')
                        .next()
                        .unwrap_or(&condition.field)
                        .to_string();
                    fields.insert(key, value);
                }
            }
        }
        Some(fields)
    }

    /// The event type this rule is pinned to, when an AND-joined `eq`
    /// condition names one. Used to prune evaluation.
    pub fn pinned_event_type(&self) -> Option<&str> {
        if self.operator != Operator::And {
            return None;
        }
        self.conditions
            .iter()
            .find(|c| c.field == "event_type" && c.op == Op::Eq)
            .and_then(|c| c.value.as_str())
    }
}
