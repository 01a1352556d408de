//! Event enrichment.
//!
//! Enrichers add context under `enriched.*`: GeoIP for IP-typed fields,
//! reverse DNS (cached), and threat-intel lookups (cached per
//! indicator). Enrichment failures are non-fatal; they append to
//! `enriched.errors[]` and the event continues through the pipeline.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use tokio::sync::Mutex;

use crate::config::ProcessorSettings;
use crate::error::Result;
use crate::models::Event;

#[async_trait]
pub trait Enricher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produce a value to store under `enriched.<name>`, or None when
    /// the event carries nothing this enricher applies to.
    async fn enrich(&self, event: &Event) -> Result<Option<Value>>;
}

/// Collect the distinct IP addresses appearing in string values of
/// `data` (one level of nesting deep).
pub fn extract_ips(event: &Event) -> BTreeSet<IpAddr> {
    fn scan(value: &Value, out: &mut BTreeSet<IpAddr>, depth: u8) {
        match value {
            Value::String(s) => {
                if let Ok(ip) = s.parse::<IpAddr>() {
                    out.insert(ip);
                }
            }
            Value::Object(map) if depth > 0 => {
                for v in map.values() {
                    scan(v, out, depth - 1);
                }
            }
            Value::Array(items) if depth > 0 => {
                for v in items {
                    scan(v, out, depth - 1);
                }
            }
            _ => {}
        }
    }
    let mut out = BTreeSet::new();
    for value in event.data.values() {
        scan(value, &mut out, 2);
    }
    out
}

/// GeoIP enrichment through a lookup service
/// (`GET {url}/{ip}` returning `{country, city, lat, lon, asn}`).
pub struct GeoIpEnricher {
    client: reqwest::Client,
    lookup_url: String,
}

impl GeoIpEnricher {
    pub fn new(client: reqwest::Client, lookup_url: String) -> Self {
        Self { client, lookup_url }
    }
}

#[async_trait]
impl Enricher for GeoIpEnricher {
    fn name(&self) -> &'static str {
        "ip_info"
    }

    async fn enrich(&self, event: &Event) -> Result<Option<Value>> {
        let ips = extract_ips(event);
        if ips.is_empty() {
            return Ok(None);
        }
        let mut info = Map::new();
        for ip in ips {
            let url = format!("{}/{}", self.lookup_url.trim_end_matches('/'), ip);
            let response = self.client.get(&url).send().await?;
            if !response.status().is_success() {
                continue;
            }
            let body: Value = response.json().await?;
            info.insert(ip.to_string(), body);
        }
        Ok(if info.is_empty() {
            None
        } else {
            Some(Value::Object(info))
        })
    }
}

/// Reverse DNS through DNS-over-HTTPS PTR queries, cached per IP.
pub struct ReverseDnsEnricher {
    client: reqwest::Client,
    doh_url: String,
    cache_ttl_secs: u64,
    cache: Mutex<HashMap<IpAddr, (Option<String>, u64)>>,
}

impl ReverseDnsEnricher {
    pub fn new(client: reqwest::Client, doh_url: String, cache_ttl_secs: u64) -> Self {
        Self {
            client,
            doh_url,
            cache_ttl_secs,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn ptr_name(ip: &IpAddr) -> Option<String> {
        match ip {
            IpAddr::V4(v4) => {
                let octets = v4.octets();
                Some(format!(
                    "{}.{}.{}.{}.in-addr.arpa",
                    octets[3], octets[2], octets[1], octets[0]
                ))
            }
            // v6 nibble reversal is rarely worth the lookup volume here.
            IpAddr::V6(_) => None,
        }
    }

    async fn resolve(&self, ip: IpAddr) -> Result<Option<String>> {
        let now = Utc::now().timestamp() as u64;
        {
            let cache = self.cache.lock().await;
            if let Some((hostname, cached_at)) = cache.get(&ip) {
                if now.saturating_sub(*cached_at) < self.cache_ttl_secs {
                    return Ok(hostname.clone());
                }
            }
        }

        let name = match Self::ptr_name(&ip) {
            Some(name) => name,
            None => return Ok(None),
        };
        let response = self
            .client
            .get(&self.doh_url)
            .query(&[("name", name.as_str()), ("type", "PTR")])
            .header("accept", "application/dns-json")
            .send()
            .await?;
        let body: Value = response.json().await?;
        let hostname = body
            .get("Answer")
            .and_then(|a| a.as_array())
            .and_then(|answers| answers.first())
            .and_then(|answer| answer.get("data"))
            .and_then(|data| data.as_str())
            .map(|s| s.trim_end_matches('.').to_string());

        self.cache.lock().await.insert(ip, (hostname.clone(), now));
        Ok(hostname)
    }
}

#[async_trait]
impl Enricher for ReverseDnsEnricher {
    fn name(&self) -> &'static str {
        "dns_info"
    }

    async fn enrich(&self, event: &Event) -> Result<Option<Value>> {
        let ips = extract_ips(event);
        if ips.is_empty() {
            return Ok(None);
        }
        let mut info = Map::new();
        for ip in ips {
            if let Some(hostname) = self.resolve(ip).await? {
                info.insert(
                    ip.to_string(),
                    json!({"hostname": hostname, "resolved_at": Utc::now().to_rfc3339()}),
                );
            }
        }
        Ok(if info.is_empty() {
            None
        } else {
            Some(Value::Object(info))
        })
    }
}

/// Threat-intel lookups against a reputation service, cached per
/// indicator so repeated sightings do not refetch.
pub struct ThreatIntelEnricher {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    cache: Mutex<HashMap<String, (Value, u64)>>,
    cache_ttl_secs: u64,
}

impl ThreatIntelEnricher {
    pub fn new(client: reqwest::Client, url: String, api_key: Option<String>) -> Self {
        Self {
            client,
            url,
            api_key,
            cache: Mutex::new(HashMap::new()),
            cache_ttl_secs: 3600,
        }
    }

    async fn lookup(&self, indicator: &str) -> Result<Option<Value>> {
        let now = Utc::now().timestamp() as u64;
        {
            let cache = self.cache.lock().await;
            if let Some((value, cached_at)) = cache.get(indicator) {
                if now.saturating_sub(*cached_at) < self.cache_ttl_secs {
                    return Ok(Some(value.clone()));
                }
            }
        }

        let mut request = self
            .client
            .get(format!("{}/{}", self.url.trim_end_matches('/'), indicator));
        if let Some(key) = &self.api_key {
            request = request.header("API-Key", key);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let body: Value = response.json().await?;
        let parsed = json!({
            "score": body.pointer("/data/abuseConfidenceScore").cloned().unwrap_or(json!(0)),
            "categories": body.pointer("/data/categories").cloned().unwrap_or(json!([])),
            "last_seen": body.pointer("/data/lastReportedAt").cloned().unwrap_or(Value::Null),
        });
        self.cache
            .lock()
            .await
            .insert(indicator.to_string(), (parsed.clone(), now));
        Ok(Some(parsed))
    }
}

#[async_trait]
impl Enricher for ThreatIntelEnricher {
    fn name(&self) -> &'static str {
        "threat_intel"
    }

    async fn enrich(&self, event: &Event) -> Result<Option<Value>> {
        let ips = extract_ips(event);
        if ips.is_empty() {
            return Ok(None);
        }
        let mut info = Map::new();
        for ip in ips {
            if let Some(intel) = self.lookup(&ip.to_string()).await? {
                info.insert(ip.to_string(), intel);
            }
        }
        Ok(if info.is_empty() {
            None
        } else {
            Some(Value::Object(info))
        })
    }
}

/// Run the configured enrichers over an event, stamping
/// `enriched.processing_timestamp` and collecting per-enricher failures
/// into `enriched.errors[]`.
pub struct EnrichmentPipeline {
    enrichers: Vec<Box<dyn Enricher>>,
}

impl EnrichmentPipeline {
    pub fn from_settings(settings: &ProcessorSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()?;
        let mut enrichers: Vec<Box<dyn Enricher>> = Vec::new();
        if let Some(url) = &settings.geoip_lookup_url {
            enrichers.push(Box::new(GeoIpEnricher::new(client.clone(), url.clone())));
        }
        if let Some(url) = &settings.doh_lookup_url {
            enrichers.push(Box::new(ReverseDnsEnricher::new(
                client.clone(),
                url.clone(),
                settings.dns_cache_ttl_secs,
            )));
        }
        if let Some(url) = &settings.threat_intel_url {
            enrichers.push(Box::new(ThreatIntelEnricher::new(
                client,
                url.clone(),
                settings.threat_intel_api_key.clone(),
            )));
        }
        Ok(Self { enrichers })
    }

    pub fn with_enrichers(enrichers: Vec<Box<dyn Enricher>>) -> Self {
        Self { enrichers }
    }

    pub async fn enrich(&self, event: &mut Event) {
        event.enriched.insert(
            "processing_timestamp".to_string(),
            Value::from(Utc::now().to_rfc3339()),
        );

        let mut errors = Vec::new();
        for enricher in &self.enrichers {
            match enricher.enrich(event).await {
                Ok(Some(value)) => {
                    event.enriched.insert(enricher.name().to_string(), value);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(enricher = enricher.name(), error = %e, "enrichment failed");
                    errors.push(Value::from(format!("{}: {}", enricher.name(), e)));
                }
            }
        }
        if !errors.is_empty() {
            event
                .enriched
                .insert("errors".to_string(), Value::Array(errors));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use serde_json::json;

    fn event(data: Value) -> Event {
        serde_json::from_value(json!({
            "source": "fw",
            "event_type": "network",
            "timestamp": "2024-02-05T14:11:05Z",
            "data": data,
        }))
        .unwrap()
    }

    struct StaticEnricher;

    #[async_trait]
    impl Enricher for StaticEnricher {
        fn name(&self) -> &'static str {
            "static"
        }
        async fn enrich(&self, _event: &Event) -> Result<Option<Value>> {
            Ok(Some(json!({"ok": true})))
        }
    }

    struct FailingEnricher;

    #[async_trait]
    impl Enricher for FailingEnricher {
        fn name(&self) -> &'static str {
            "failing"
        }
        async fn enrich(&self, _event: &Event) -> Result<Option<Value>> {
            Err(PipelineError::enrichment("upstream down"))
        }
    }

    #[test]
    fn ip_extraction_finds_nested_addresses() {
        let event = event(json!({
            "src_ip": "10.0.0.1",
            "details": {"dest": "192.168.1.5"},
            "note": "not an ip",
            "port": 443,
        }));
        let ips = extract_ips(&event);
        assert_eq!(ips.len(), 2);
        assert!(ips.contains(&"10.0.0.1".parse::<IpAddr>().unwrap()));
        assert!(ips.contains(&"192.168.1.5".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn ptr_name_reverses_octets() {
        let ip: IpAddr = "192.168.1.5".parse().unwrap();
        assert_eq!(
            ReverseDnsEnricher::ptr_name(&ip).unwrap(),
            "5.1.168.192.in-addr.arpa"
        );
    }

    #[tokio::test]
    async fn pipeline_stamps_processing_timestamp() {
        let pipeline = EnrichmentPipeline::with_enrichers(vec![Box::new(StaticEnricher)]);
        let mut event = event(json!({}));
        pipeline.enrich(&mut event).await;
        assert!(event.enriched.contains_key("processing_timestamp"));
        assert_eq!(event.enriched["static"]["ok"], true);
    }

    #[tokio::test]
    async fn failures_are_recorded_not_fatal() {
        let pipeline = EnrichmentPipeline::with_enrichers(vec![
            Box::new(FailingEnricher),
            Box::new(StaticEnricher),
        ]);
        let mut event = event(json!({}));
        pipeline.enrich(&mut event).await;
        // The failing enricher recorded its error; the next one ran.
        assert_eq!(event.enriched["static"]["ok"], true);
        let errors = event.enriched["errors"].as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].as_str().unwrap().starts_with("failing:"));
    }
}
