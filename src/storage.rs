//! Time-partitioned index store.
//!
//! Talks to an Elasticsearch-compatible endpoint over HTTP. Documents
//! land in monthly indices (`logs-YYYY.MM` by default); declared fields
//! have stable typed mappings and `data.*` stays dynamic. A declarative
//! lifecycle policy ages indices hot → warm → cold → delete.

use chrono::{DateTime, Datelike, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::IndexSettings;
use crate::error::{PipelineError, Result};

/// Structured query fragments; composed into the store's native query
/// DSL without callers writing it by hand.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum SearchQuery {
    Term { field: String, value: Value },
    Match { field: String, value: String },
    Range {
        field: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        gte: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        lte: Option<Value>,
    },
    Bool {
        #[serde(default)]
        must: Vec<SearchQuery>,
        #[serde(default)]
        should: Vec<SearchQuery>,
        #[serde(default)]
        must_not: Vec<SearchQuery>,
    },
}

impl SearchQuery {
    pub fn to_dsl(&self) -> Value {
        fn keyed(outer: &str, field: &str, value: Value) -> Value {
            let mut inner = serde_json::Map::new();
            inner.insert(field.to_string(), value);
            let mut object = serde_json::Map::new();
            object.insert(outer.to_string(), Value::Object(inner));
            Value::Object(object)
        }

        match self {
            SearchQuery::Term { field, value } => keyed("term", field, value.clone()),
            SearchQuery::Match { field, value } => keyed("match", field, Value::from(value.clone())),
            SearchQuery::Range { field, gte, lte } => {
                let mut range = serde_json::Map::new();
                if let Some(gte) = gte {
                    range.insert("gte".into(), gte.clone());
                }
                if let Some(lte) = lte {
                    range.insert("lte".into(), lte.clone());
                }
                keyed("range", field, Value::Object(range))
            }
            SearchQuery::Bool { must, should, must_not } => {
                json!({"bool": {
                    "must": must.iter().map(|q| q.to_dsl()).collect::<Vec<_>>(),
                    "should": should.iter().map(|q| q.to_dsl()).collect::<Vec<_>>(),
                    "must_not": must_not.iter().map(|q| q.to_dsl()).collect::<Vec<_>>(),
                }})
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchHit {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_index")]
    pub index: String,
    #[serde(rename = "_source")]
    pub source: Value,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub hits: Vec<SearchHit>,
    pub total: u64,
    /// Offset cursor for the next page, when more hits remain.
    pub next_cursor: Option<u64>,
}

#[derive(Clone)]
pub struct IndexStore {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    prefix: String,
    ilm_warm_days: u32,
    ilm_cold_days: u32,
    ilm_delete_days: u32,
}

impl IndexStore {
    pub fn new(settings: &IndexSettings) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!settings.ssl_verify)
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: settings.hosts.trim_end_matches('/').to_string(),
            username: settings.username.clone(),
            password: settings.password.clone(),
            prefix: settings.index_prefix.clone(),
            ilm_warm_days: settings.ilm_warm_days,
            ilm_cold_days: settings.ilm_cold_days,
            ilm_delete_days: settings.ilm_delete_days,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Monthly bucket derived from the event timestamp: `logs-YYYY.MM`.
    pub fn index_for(&self, timestamp: DateTime<Utc>) -> String {
        format!(
            "{}-{:04}.{:02}",
            self.prefix,
            timestamp.year(),
            timestamp.month()
        )
    }

    pub fn alerts_index_for(&self, timestamp: DateTime<Utc>) -> String {
        format!(
            "{}-alerts-{:04}.{:02}",
            self.prefix,
            timestamp.year(),
            timestamp.month()
        )
    }

    pub fn playbook_runs_index(&self) -> String {
        format!("{}-playbook-runs", self.prefix)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(username) = &self.username {
            builder = builder.basic_auth(username, self.password.as_deref());
        }
        builder
    }

    /// Install the index template and lifecycle policy. Both calls are
    /// idempotent PUTs and safe to run on every startup.
    pub async fn ensure_template(&self) -> Result<()> {
        let policy_name = format!("{}-lifecycle", self.prefix);
        let policy = json!({
            "policy": {
                "phases": {
                    "hot": {
                        "min_age": "0ms",
                        "actions": {"set_priority": {"priority": 100}}
                    },
                    "warm": {
                        "min_age": format!("{}d", self.ilm_warm_days),
                        "actions": {
                            "forcemerge": {"max_num_segments": 1},
                            "set_priority": {"priority": 50}
                        }
                    },
                    "cold": {
                        "min_age": format!("{}d", self.ilm_cold_days),
                        "actions": {"set_priority": {"priority": 0}}
                    },
                    "delete": {
                        "min_age": format!("{}d", self.ilm_delete_days),
                        "actions": {"delete": {}}
                    }
                }
            }
        });
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/_ilm/policy/{}", policy_name),
            )
            .json(&policy)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PipelineError::storage(format!(
                "failed to install lifecycle policy: {}",
                response.status()
            )));
        }

        let template = json!({
            "index_patterns": [format!("{}-*", self.prefix)],
            "template": {
                "settings": {
                    "number_of_shards": 1,
                    "number_of_replicas": 1,
                    "index.lifecycle.name": policy_name,
                },
                "mappings": {
                    "properties": {
                        "id": {"type": "keyword"},
                        "timestamp": {"type": "date"},
                        "source": {"type": "keyword"},
                        "event_type": {"type": "keyword"},
                        "vendor": {"type": "keyword"},
                        "severity": {"type": "keyword"},
                        "fingerprint": {"type": "keyword"},
                        "data": {"type": "object", "dynamic": true},
                        "enriched": {
                            "type": "object",
                            "properties": {
                                "processing_timestamp": {"type": "date"},
                                "ip_info": {"type": "object", "dynamic": true},
                                "dns_info": {"type": "object", "dynamic": true},
                                "threat_intel": {"type": "object", "dynamic": true},
                                "errors": {"type": "keyword"}
                            }
                        }
                    }
                }
            }
        });
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/_index_template/{}", self.prefix),
            )
            .json(&template)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PipelineError::storage(format!(
                "failed to install index template: {}",
                response.status()
            )));
        }

        tracing::info!(prefix = %self.prefix, "index template and lifecycle policy installed");
        Ok(())
    }

    /// Write a document, idempotent on `id`: replaying the same event
    /// overwrites the identical document instead of duplicating it.
    pub async fn put(&self, index: &str, id: &str, doc: &Value) -> Result<()> {
        let response = self
            .request(reqwest::Method::PUT, &format!("/{}/_doc/{}", index, id))
            .json(doc)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::storage(format!(
                "index write to '{}' failed: {} {}",
                index, status, body
            )));
        }
        Ok(())
    }

    pub async fn search(
        &self,
        index_pattern: &str,
        query: &SearchQuery,
        time_range: TimeRange,
        limit: usize,
        cursor: Option<u64>,
    ) -> Result<SearchResult> {
        let mut must = vec![query.to_dsl()];
        if time_range.start.is_some() || time_range.end.is_some() {
            let mut range = serde_json::Map::new();
            if let Some(start) = time_range.start {
                range.insert("gte".into(), json!(start.to_rfc3339()));
            }
            if let Some(end) = time_range.end {
                range.insert("lte".into(), json!(end.to_rfc3339()));
            }
            must.push(json!({"range": {"timestamp": range}}));
        }
        let from = cursor.unwrap_or(0);
        let body = json!({
            "query": {"bool": {"must": must}},
            "size": limit,
            "from": from,
            "sort": [{"timestamp": {"order": "asc", "unmapped_type": "date"}}],
        });

        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/{}/_search", index_pattern),
            )
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PipelineError::storage(format!(
                "search failed: {}",
                response.status()
            )));
        }

        #[derive(Deserialize)]
        struct RawHits {
            total: RawTotal,
            hits: Vec<SearchHit>,
        }
        #[derive(Deserialize)]
        struct RawTotal {
            value: u64,
        }
        #[derive(Deserialize)]
        struct RawResponse {
            hits: RawHits,
        }

        let raw: RawResponse = response.json().await?;
        let total = raw.hits.total.value;
        let returned = raw.hits.hits.len() as u64;
        let next_cursor = if from + returned < total {
            Some(from + returned)
        } else {
            None
        };
        Ok(SearchResult {
            hits: raw.hits.hits,
            total,
            next_cursor,
        })
    }

    pub async fn ping(&self) -> bool {
        self.request(reqwest::Method::GET, "/")
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store() -> IndexStore {
        IndexStore::new(&IndexSettings {
            hosts: "http://localhost:9200".to_string(),
            username: None,
            password: None,
            ssl_verify: true,
            index_prefix: "logs".to_string(),
            ilm_warm_days: 30,
            ilm_cold_days: 90,
            ilm_delete_days: 365,
        })
        .unwrap()
    }

    #[test]
    fn monthly_index_naming() {
        let store = store();
        let ts = Utc.with_ymd_and_hms(2000, 10, 10, 20, 55, 36).unwrap();
        assert_eq!(store.index_for(ts), "logs-2000.10");
        let ts = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        assert_eq!(store.index_for(ts), "logs-2024.02");
        assert_eq!(store.alerts_index_for(ts), "logs-alerts-2024.02");
    }

    #[test]
    fn query_dsl_composition() {
        let query = SearchQuery::Bool {
            must: vec![
                SearchQuery::Term {
                    field: "source".into(),
                    value: json!("firewall"),
                },
                SearchQuery::Range {
                    field: "data.status".into(),
                    gte: Some(json!(400)),
                    lte: None,
                },
            ],
            should: vec![],
            must_not: vec![],
        };
        let dsl = query.to_dsl();
        assert_eq!(dsl["bool"]["must"][0]["term"]["source"], "firewall");
        assert_eq!(dsl["bool"]["must"][1]["range"]["data.status"]["gte"], 400);
    }
}
