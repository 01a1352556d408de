use rdkafka::ClientConfig;

use crate::error::{PipelineError, Result};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub cors_allow_origins: Vec<String>,
    pub max_batch_events: usize,
    pub max_event_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub bootstrap_servers: String,
    pub client_id_prefix: String,
    pub security_protocol: String,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_cafile: Option<String>,
    pub ssl_certfile: Option<String>,
    pub ssl_keyfile: Option<String>,
    pub raw_logs_topic: String,
    pub enriched_logs_topic: String,
    pub alerts_topic: String,
    pub dlq_topic: String,
    pub ack_timeout_ms: u64,
}

impl KafkaSettings {
    /// Base client configuration shared by producers and consumers.
    pub fn client_config(&self, client_id_suffix: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set(
                "client.id",
                format!("{}-{}", self.client_id_prefix, client_id_suffix),
            )
            .set("security.protocol", &self.security_protocol)
            .set("socket.timeout.ms", "30000")
            .set("reconnect.backoff.ms", "1000")
            .set("reconnect.backoff.max.ms", "10000");

        if let Some(mechanism) = &self.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
            if let Some(username) = &self.sasl_username {
                config.set("sasl.username", username);
            }
            if let Some(password) = &self.sasl_password {
                config.set("sasl.password", password);
            }
        }
        if let Some(cafile) = &self.ssl_cafile {
            config.set("ssl.ca.location", cafile);
            if let Some(certfile) = &self.ssl_certfile {
                config.set("ssl.certificate.location", certfile);
            }
            if let Some(keyfile) = &self.ssl_keyfile {
                config.set("ssl.key.location", keyfile);
            }
        }
        config
    }
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub jwt_secret: String,
    pub jwt_algorithm: String,
    pub access_token_expire_minutes: i64,
    pub failed_login_max: u32,
    pub failed_login_window_secs: u64,
    pub login_rate_times: u32,
    pub login_rate_seconds: u64,
}

/// Sliding-window quotas for the ingest surface. Three independent
/// quotas: single requests, batch requests, and total events.
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub default_times: u32,
    pub default_seconds: u64,
    pub batch_times: u32,
    pub batch_seconds: u64,
    pub events_times: u32,
    pub events_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub hosts: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_verify: bool,
    pub index_prefix: String,
    pub ilm_warm_days: u32,
    pub ilm_cold_days: u32,
    pub ilm_delete_days: u32,
}

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub consumer_group_id: String,
    pub dedup_window_secs: u64,
    pub dedup_cache_max: usize,
    pub index_retry_max: u32,
    pub dns_cache_ttl_secs: u64,
    pub geoip_lookup_url: Option<String>,
    pub doh_lookup_url: Option<String>,
    pub threat_intel_url: Option<String>,
    pub threat_intel_api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub rules_dir: String,
    pub playbooks_dir: String,
    pub throttle_default_secs: u64,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_tls: bool,
    pub email_from: Option<String>,
    pub email_to: Option<String>,
    pub slack_webhook_url: Option<String>,
    pub discord_webhook_url: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub alert_webhook_url: Option<String>,
    pub retry_max: u32,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub collector: CollectorSettings,
    pub kafka: KafkaSettings,
    pub redis: RedisSettings,
    pub auth: AuthSettings,
    pub rate_limit: RateLimitSettings,
    pub index: IndexSettings,
    pub processor: ProcessorSettings,
    pub detection: DetectionSettings,
    pub dispatch: DispatchSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let jwt_secret = env_opt("JWT_SECRET_KEY")
            .ok_or_else(|| PipelineError::config("JWT_SECRET_KEY is not set"))?;

        Ok(Self {
            collector: CollectorSettings {
                host: env_or("COLLECTOR_HOST", "0.0.0.0"),
                port: env_parse("COLLECTOR_PORT", 8000),
                log_level: env_or("LOG_LEVEL", "info"),
                cors_allow_origins: env_or("CORS_ALLOW_ORIGINS", "*")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                max_batch_events: env_parse("MAX_BATCH_EVENTS", 1000),
                max_event_bytes: env_parse("MAX_EVENT_BYTES", 1_048_576),
            },
            kafka: KafkaSettings {
                bootstrap_servers: env_or("KAFKA_BOOTSTRAP_SERVERS", "localhost:9092"),
                client_id_prefix: env_or("KAFKA_CLIENT_ID_PREFIX", "siem"),
                security_protocol: env_or("KAFKA_SECURITY_PROTOCOL", "PLAINTEXT"),
                sasl_mechanism: env_opt("KAFKA_SASL_MECHANISM"),
                sasl_username: env_opt("KAFKA_SASL_USERNAME"),
                sasl_password: env_opt("KAFKA_SASL_PASSWORD"),
                ssl_cafile: env_opt("KAFKA_SSL_CAFILE"),
                ssl_certfile: env_opt("KAFKA_SSL_CERTFILE"),
                ssl_keyfile: env_opt("KAFKA_SSL_KEYFILE"),
                raw_logs_topic: env_or("RAW_LOGS_TOPIC", "raw_logs"),
                enriched_logs_topic: env_or("ENRICHED_LOGS_TOPIC", "enriched_logs"),
                alerts_topic: env_or("ALERTS_TOPIC", "alerts"),
                dlq_topic: env_or("DLQ_TOPIC", "raw_logs_dlq"),
                ack_timeout_ms: env_parse("KAFKA_ACK_TIMEOUT_MS", 5000),
            },
            redis: RedisSettings {
                url: env_opt("REDIS_URL"),
                max_connections: env_parse("REDIS_MAX_CONNECTIONS", 16),
            },
            auth: AuthSettings {
                jwt_secret,
                jwt_algorithm: env_or("JWT_ALGORITHM", "HS256"),
                access_token_expire_minutes: env_parse("ACCESS_TOKEN_EXPIRE_MINUTES", 30),
                failed_login_max: env_parse("FAILED_LOGIN_MAX", 5),
                failed_login_window_secs: env_parse("FAILED_LOGIN_WINDOW_SECS", 900),
                login_rate_times: env_parse("LOGIN_RATE_TIMES", 5),
                login_rate_seconds: env_parse("LOGIN_RATE_SECONDS", 60),
            },
            rate_limit: RateLimitSettings {
                default_times: env_parse("RATE_LIMIT_DEFAULT_TIMES", 100),
                default_seconds: env_parse("RATE_LIMIT_DEFAULT_SECONDS", 60),
                batch_times: env_parse("RATE_LIMIT_BATCH_TIMES", 20),
                batch_seconds: env_parse("RATE_LIMIT_BATCH_SECONDS", 60),
                events_times: env_parse("RATE_LIMIT_EVENTS_TIMES", 5000),
                events_seconds: env_parse("RATE_LIMIT_EVENTS_SECONDS", 60),
            },
            index: IndexSettings {
                hosts: env_or("ES_HOSTS", "http://localhost:9200"),
                username: env_opt("ES_USERNAME"),
                password: env_opt("ES_PASSWORD"),
                ssl_verify: env_parse("ES_SSL_VERIFY", true),
                index_prefix: env_or("ES_INDEX_PREFIX", "logs"),
                ilm_warm_days: env_parse("ES_ILM_WARM_DAYS", 30),
                ilm_cold_days: env_parse("ES_ILM_COLD_DAYS", 90),
                ilm_delete_days: env_parse("ES_ILM_DELETE_DAYS", 365),
            },
            processor: ProcessorSettings {
                consumer_group_id: env_or("CONSUMER_GROUP_ID", "log_processor"),
                dedup_window_secs: env_parse("DEDUP_WINDOW_SECS", 300),
                dedup_cache_max: env_parse("DEDUP_CACHE_MAX", 100_000),
                index_retry_max: env_parse("INDEX_RETRY_MAX", 5),
                dns_cache_ttl_secs: env_parse("DNS_CACHE_TTL_SECS", 3600),
                geoip_lookup_url: env_opt("GEOIP_LOOKUP_URL"),
                doh_lookup_url: env_opt("DOH_LOOKUP_URL"),
                threat_intel_url: env_opt("THREAT_INTEL_URL"),
                threat_intel_api_key: env_opt("THREAT_INTEL_API_KEY"),
            },
            detection: DetectionSettings {
                rules_dir: env_or("RULES_DIR", "rules"),
                playbooks_dir: env_or("PLAYBOOKS_DIR", "playbooks"),
                throttle_default_secs: env_parse("ALERT_THROTTLE_DEFAULT_SECS", 300),
            },
            dispatch: DispatchSettings {
                smtp_host: env_opt("SMTP_HOST"),
                smtp_port: env_parse("SMTP_PORT", 587),
                smtp_username: env_opt("SMTP_USERNAME"),
                smtp_password: env_opt("SMTP_PASSWORD"),
                smtp_tls: env_parse("SMTP_TLS", true),
                email_from: env_opt("EMAIL_FROM"),
                email_to: env_opt("EMAIL_TO"),
                slack_webhook_url: env_opt("SLACK_WEBHOOK_URL"),
                discord_webhook_url: env_opt("DISCORD_WEBHOOK_URL"),
                telegram_bot_token: env_opt("TELEGRAM_BOT_TOKEN"),
                telegram_chat_id: env_opt("TELEGRAM_CHAT_ID"),
                alert_webhook_url: env_opt("ALERT_WEBHOOK_URL"),
                retry_max: env_parse("DISPATCH_RETRY_MAX", 3),
            },
        })
    }

    /// Settings for tests: no external services, fixed secret.
    pub fn for_tests() -> Self {
        std::env::set_var("JWT_SECRET_KEY", "test-secret-key");
        let mut settings = Self::from_env().expect("test settings");
        settings.redis.url = None;
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::for_tests();
        assert_eq!(settings.kafka.raw_logs_topic, "raw_logs");
        assert_eq!(settings.kafka.alerts_topic, "alerts");
        assert_eq!(settings.index.index_prefix, "logs");
        assert_eq!(settings.auth.access_token_expire_minutes, 30);
        assert_eq!(settings.rate_limit.default_seconds, 60);
    }

    #[test]
    fn kafka_client_config_carries_client_id() {
        let settings = Settings::for_tests();
        let config = settings.kafka.client_config("collector");
        assert_eq!(
            config.get("client.id").map(|s| s.to_string()),
            Some("siem-collector".to_string())
        );
    }
}
