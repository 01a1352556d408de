//! Binary-pattern signatures for file content.
//!
//! A rule set compiles named string patterns (text, or hex bytes with
//! `??` wildcards) and fires on `any` or `all` of them. Rules apply only
//! to events carrying a scannable blob: `data.file.content` (base64 or
//! plain text) or `data.file.path` pointing at a readable file.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PipelineError, Result};
use crate::models::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    #[default]
    Text,
    Hex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchCondition {
    #[default]
    Any,
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternString {
    pub id: String,
    pub value: String,
    #[serde(default)]
    pub kind: PatternKind,
    #[serde(default)]
    pub nocase: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YaraRule {
    pub name: String,
    pub strings: Vec<PatternString>,
    #[serde(default)]
    pub condition: MatchCondition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YaraRuleSet {
    pub rules: Vec<YaraRule>,
}

/// A hex pattern byte: a literal value or a `??` wildcard.
type HexByte = Option<u8>;

fn compile_hex(pattern: &str) -> Result<Vec<HexByte>> {
    let mut bytes = Vec::new();
    for token in pattern.split_whitespace() {
        if token == "??" {
            bytes.push(None);
            continue;
        }
        if token.len() != 2 {
            return Err(PipelineError::config(format!(
                "bad hex token '{}' in pattern",
                token
            )));
        }
        let byte = u8::from_str_radix(token, 16)
            .map_err(|e| PipelineError::config(format!("bad hex token '{}': {}", token, e)))?;
        bytes.push(Some(byte));
    }
    if bytes.is_empty() {
        return Err(PipelineError::config("empty hex pattern"));
    }
    Ok(bytes)
}

fn hex_match(haystack: &[u8], pattern: &[HexByte]) -> bool {
    if pattern.len() > haystack.len() {
        return false;
    }
    haystack.windows(pattern.len()).any(|window| {
        window
            .iter()
            .zip(pattern)
            .all(|(byte, expected)| expected.map_or(true, |e| e == *byte))
    })
}

fn text_match(haystack: &[u8], needle: &str, nocase: bool) -> bool {
    if nocase {
        let lowered = haystack.to_ascii_lowercase();
        let needle = needle.to_ascii_lowercase();
        lowered
            .windows(needle.len().max(1))
            .any(|w| w == needle.as_bytes())
    } else {
        haystack
            .windows(needle.len().max(1))
            .any(|w| w == needle.as_bytes())
    }
}

impl PatternString {
    fn matches(&self, content: &[u8]) -> Result<bool> {
        match self.kind {
            PatternKind::Text => Ok(text_match(content, &self.value, self.nocase)),
            PatternKind::Hex => Ok(hex_match(content, &compile_hex(&self.value)?)),
        }
    }
}

impl YaraRule {
    pub fn matches(&self, content: &[u8]) -> Result<Vec<String>> {
        let mut hit_ids = Vec::new();
        for pattern in &self.strings {
            if pattern.matches(content)? {
                hit_ids.push(pattern.id.clone());
            }
        }
        let fired = match self.condition {
            MatchCondition::Any => !hit_ids.is_empty(),
            MatchCondition::All => hit_ids.len() == self.strings.len(),
        };
        Ok(if fired { hit_ids } else { Vec::new() })
    }
}

impl YaraRuleSet {
    /// Pull the scannable blob off an event, if it carries one.
    pub async fn extract_content(event: &Event) -> Option<Vec<u8>> {
        if let Some(content) = event.field("data.file.content").and_then(|v| match v {
            Value::String(s) => Some(s),
            _ => None,
        }) {
            // Content fields are normally base64; fall back to the raw
            // text when decoding fails.
            return Some(
                base64::engine::general_purpose::STANDARD
                    .decode(content.as_bytes())
                    .unwrap_or_else(|_| content.into_bytes()),
            );
        }
        if let Some(Value::String(path)) = event.field("data.file.path") {
            match tokio::fs::read(&path).await {
                Ok(bytes) => return Some(bytes),
                Err(e) => {
                    tracing::debug!(path, error = %e, "blob path not readable, skipping scan");
                    return None;
                }
            }
        }
        None
    }

    /// Scan the blob through every rule; reports the first matching
    /// rule's name and the pattern ids it hit.
    pub fn scan(&self, content: &[u8]) -> Result<Option<(String, Map<String, Value>)>> {
        for rule in &self.rules {
            let hits = rule.matches(content)?;
            if !hits.is_empty() {
                let mut fields = Map::new();
                fields.insert("rule".into(), Value::from(rule.name.clone()));
                fields.insert(
                    "strings".into(),
                    Value::Array(hits.into_iter().map(Value::from).collect()),
                );
                return Ok(Some((rule.name.clone(), fields)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ruleset(yaml: &str) -> YaraRuleSet {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn text_pattern_matches() {
        let set = ruleset(
            r#"
rules:
  - name: eicar_like
    strings:
      - id: marker
        value: "EICAR-STANDARD-ANTIVIRUS-TEST"
    condition: any
"#,
        );
        let content = b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";
        let (name, fields) = set.scan(content).unwrap().unwrap();
        assert_eq!(name, "eicar_like");
        assert_eq!(fields["strings"][0], "marker");
        assert!(set.scan(b"clean content").unwrap().is_none());
    }

    #[test]
    fn nocase_text_pattern() {
        let set = ruleset(
            r#"
rules:
  - name: shell
    strings:
      - id: s1
        value: "MimiKatz"
        nocase: true
    condition: any
"#,
        );
        assert!(set.scan(b"loading mimikatz module").unwrap().is_some());
    }

    #[test]
    fn hex_pattern_with_wildcards() {
        let set = ruleset(
            r#"
rules:
  - name: mz_header
    strings:
      - id: magic
        value: "4D 5A ?? ?? 00"
        kind: hex
    condition: any
"#,
        );
        assert!(set.scan(&[0x4D, 0x5A, 0x90, 0x01, 0x00, 0xFF]).unwrap().is_some());
        assert!(set.scan(&[0x4D, 0x5A, 0x90, 0x01, 0x01]).unwrap().is_none());
    }

    #[test]
    fn all_condition_requires_every_string() {
        let set = ruleset(
            r#"
rules:
  - name: dropper
    strings:
      - id: a
        value: "CreateRemoteThread"
      - id: b
        value: "VirtualAllocEx"
    condition: all
"#,
        );
        assert!(set
            .scan(b"CreateRemoteThread then VirtualAllocEx")
            .unwrap()
            .is_some());
        assert!(set.scan(b"only CreateRemoteThread here").unwrap().is_none());
    }

    #[test]
    fn bad_hex_pattern_is_an_error() {
        let set = ruleset(
            r#"
rules:
  - name: broken
    strings:
      - id: a
        value: "ZZ"
        kind: hex
    condition: any
"#,
        );
        assert!(set.scan(b"anything").is_err());
    }

    #[tokio::test]
    async fn extracts_base64_content() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("hello blob");
        let event: Event = serde_json::from_value(json!({
            "source": "edr",
            "event_type": "file",
            "data": {"file": {"content": encoded, "path": "/tmp/x"}},
        }))
        .unwrap();
        let content = YaraRuleSet::extract_content(&event).await.unwrap();
        assert_eq!(content, b"hello blob");
    }

    #[tokio::test]
    async fn no_blob_means_no_scan() {
        let event: Event = serde_json::from_value(json!({
            "source": "fw",
            "event_type": "network",
            "data": {"src_ip": "1.2.3.4"},
        }))
        .unwrap();
        assert!(YaraRuleSet::extract_content(&event).await.is_none());
    }
}
