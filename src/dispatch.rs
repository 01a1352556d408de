//! Multi-channel alert dispatcher with severity-based routing.
//!
//! critical → email + slack + telegram, high → email + slack,
//! medium/low → slack by default; the table is configured per
//! deployment. Sends are retried with backoff; a channel that keeps
//! failing records an error and never blocks the others.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;

use crate::config::DispatchSettings;
use crate::error::{PipelineError, Result};
use crate::models::{Alert, Severity};
use crate::util::retry::retry_with_backoff;

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, alert: &Alert) -> Result<()>;
}

fn severity_color(severity: Severity) -> u32 {
    match severity {
        Severity::Critical => 0xFF0000,
        Severity::High => 0xFFA500,
        Severity::Medium => 0xFFFF00,
        Severity::Low => 0x00FF00,
    }
}

/// HTML body for email alerts: severity-colored header, rule name,
/// source event, matched fields, tags.
pub fn render_email_html(alert: &Alert) -> String {
    let matched = alert
        .matched_fields
        .iter()
        .map(|(k, v)| format!("<li><b>{}</b>: {}</li>", k, v))
        .collect::<String>();
    let tags = alert.tags.join(", ");
    let source_event =
        serde_json::to_string_pretty(&alert.source_event).unwrap_or_else(|_| "{}".to_string());
    format!(
        concat!(
            "<html><body>",
            "<div style=\"background-color:#{color:06X};padding:12px;color:#fff;\">",
            "<h2>{title} ({severity})</h2></div>",
            "<p>{description}</p>",
            "<p><b>Rule:</b> {rule_name}</p>",
            "<ul>{matched}</ul>",
            "<p><b>Tags:</b> {tags}</p>",
            "<pre>{source_event}</pre>",
            "</body></html>"
        ),
        color = severity_color(alert.severity),
        title = alert.title,
        severity = alert.severity.as_str().to_uppercase(),
        description = alert.description,
        rule_name = alert.rule_name,
        matched = matched,
        tags = tags,
        source_event = source_event,
    )
}

pub struct EmailChannel {
    settings: DispatchSettings,
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        use lettre::message::header::ContentType;
        use lettre::transport::smtp::authentication::Credentials;
        use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

        let (host, from, to) = match (
            &self.settings.smtp_host,
            &self.settings.email_from,
            &self.settings.email_to,
        ) {
            (Some(host), Some(from), Some(to)) => (host, from, to),
            _ => return Err(PipelineError::dispatch("email channel not configured")),
        };

        let message = Message::builder()
            .from(from.parse().map_err(|e| {
                PipelineError::dispatch(format!("bad EMAIL_FROM address: {}", e))
            })?)
            .to(to.parse().map_err(|e| {
                PipelineError::dispatch(format!("bad EMAIL_TO address: {}", e))
            })?)
            .subject(format!(
                "SIEM Alert: {} ({})",
                alert.title,
                alert.severity.as_str().to_uppercase()
            ))
            .header(ContentType::TEXT_HTML)
            .body(render_email_html(alert))
            .map_err(|e| PipelineError::dispatch(format!("failed to build email: {}", e)))?;

        let mut builder = if self.settings.smtp_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|e| PipelineError::dispatch(format!("smtp relay: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        }
        .port(self.settings.smtp_port);
        if let (Some(username), Some(password)) = (
            &self.settings.smtp_username,
            &self.settings.smtp_password,
        ) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }
        let transport = builder.build();

        transport
            .send(message)
            .await
            .map_err(|e| PipelineError::dispatch(format!("smtp send failed: {}", e)))?;
        Ok(())
    }
}

pub struct SlackChannel {
    client: reqwest::Client,
    webhook_url: String,
}

#[async_trait]
impl NotificationChannel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let message = json!({
            "blocks": [
                {
                    "type": "header",
                    "text": {"type": "plain_text", "text": format!("🚨 {}", alert.title)}
                },
                {
                    "type": "section",
                    "fields": [
                        {"type": "mrkdwn", "text": format!("*Severity:* {}", alert.severity.as_str().to_uppercase())},
                        {"type": "mrkdwn", "text": format!("*Rule:* {}", alert.rule_name)},
                    ]
                },
                {
                    "type": "section",
                    "text": {"type": "mrkdwn", "text": alert.description}
                }
            ]
        });
        let response = self.client.post(&self.webhook_url).json(&message).send().await?;
        if !response.status().is_success() {
            return Err(PipelineError::dispatch(format!(
                "slack returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

pub struct DiscordChannel {
    client: reqwest::Client,
    webhook_url: String,
}

#[async_trait]
impl NotificationChannel for DiscordChannel {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let embed = json!({
            "title": alert.title,
            "description": alert.description,
            "color": severity_color(alert.severity),
            "fields": [
                {"name": "Severity", "value": alert.severity.as_str().to_uppercase(), "inline": true},
                {"name": "Rule", "value": alert.rule_name, "inline": true},
            ],
            "timestamp": alert.timestamp.to_rfc3339(),
        });
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&json!({"embeds": [embed]}))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PipelineError::dispatch(format!(
                "discord returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

pub struct TelegramChannel {
    client: reqwest::Client,
    bot_token: String,
    chat_id: String,
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let text = format!(
            "🚨 *{}*\n\n*Severity:* {}\n*Rule:* {}\n\n{}",
            alert.title,
            alert.severity.as_str().to_uppercase(),
            alert.rule_name,
            alert.description,
        );
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let response = self
            .client
            .post(&url)
            .json(&json!({"chat_id": self.chat_id, "text": text, "parse_mode": "Markdown"}))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PipelineError::dispatch(format!(
                "telegram returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let response = self.client.post(&self.url).json(alert).send().await?;
        if !response.status().is_success() {
            return Err(PipelineError::dispatch(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

pub struct AlertDispatcher {
    channels: HashMap<&'static str, Box<dyn NotificationChannel>>,
    routing: HashMap<Severity, Vec<&'static str>>,
    retry_max: u32,
}

impl AlertDispatcher {
    pub fn from_settings(settings: &DispatchSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        let mut channels: HashMap<&'static str, Box<dyn NotificationChannel>> = HashMap::new();

        if settings.smtp_host.is_some() {
            channels.insert(
                "email",
                Box::new(EmailChannel {
                    settings: settings.clone(),
                }),
            );
        }
        if let Some(url) = &settings.slack_webhook_url {
            channels.insert(
                "slack",
                Box::new(SlackChannel {
                    client: client.clone(),
                    webhook_url: url.clone(),
                }),
            );
        }
        if let Some(url) = &settings.discord_webhook_url {
            channels.insert(
                "discord",
                Box::new(DiscordChannel {
                    client: client.clone(),
                    webhook_url: url.clone(),
                }),
            );
        }
        if let (Some(bot_token), Some(chat_id)) =
            (&settings.telegram_bot_token, &settings.telegram_chat_id)
        {
            channels.insert(
                "telegram",
                Box::new(TelegramChannel {
                    client: client.clone(),
                    bot_token: bot_token.clone(),
                    chat_id: chat_id.clone(),
                }),
            );
        }
        if let Some(url) = &settings.alert_webhook_url {
            channels.insert(
                "webhook",
                Box::new(WebhookChannel {
                    client,
                    url: url.clone(),
                }),
            );
        }

        Ok(Self {
            channels,
            routing: Self::default_routing(),
            retry_max: settings.retry_max,
        })
    }

    pub fn default_routing() -> HashMap<Severity, Vec<&'static str>> {
        HashMap::from([
            (Severity::Critical, vec!["email", "slack", "telegram", "webhook"]),
            (Severity::High, vec!["email", "slack", "webhook"]),
            (Severity::Medium, vec!["slack", "webhook"]),
            (Severity::Low, vec!["slack", "webhook"]),
        ])
    }

    pub fn with_channels(
        channels: Vec<Box<dyn NotificationChannel>>,
        routing: HashMap<Severity, Vec<&'static str>>,
        retry_max: u32,
    ) -> Self {
        Self {
            channels: channels.into_iter().map(|c| (c.name(), c)).collect(),
            routing,
            retry_max,
        }
    }

    /// Send the alert over every channel routed for its severity.
    /// Channels that are routed but not configured are skipped; send
    /// failures are retried and then logged without affecting the rest.
    pub async fn dispatch(&self, alert: &Alert) {
        let routed = match self.routing.get(&alert.severity) {
            Some(channels) => channels,
            None => return,
        };
        for name in routed {
            let channel = match self.channels.get(name) {
                Some(channel) => channel,
                None => continue,
            };
            let result = retry_with_backoff(self.retry_max.max(1), 200, 5_000, || {
                channel.send(alert)
            })
            .await;
            match result {
                Ok(()) => {
                    tracing::info!(channel = *name, alert_id = %alert.id, "notification sent");
                }
                Err(e) => {
                    tracing::error!(
                        channel = *name,
                        alert_id = %alert.id,
                        error = %e,
                        "notification permanently failed"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn alert(severity: Severity) -> Alert {
        Alert {
            id: "a1".into(),
            rule_id: "r1".into(),
            rule_name: "Suspicious login".into(),
            severity,
            title: "Suspicious login".into(),
            description: "many failures".into(),
            timestamp: Utc::now(),
            source_event: json!({"source": "auth"}),
            matched_fields: json!({"src_ip": "1.2.3.4"}).as_object().unwrap().clone(),
            tags: vec!["auth".into()],
        }
    }

    struct CountingChannel {
        channel_name: &'static str,
        sends: Arc<AtomicU32>,
        failures_before_success: u32,
    }

    #[async_trait]
    impl NotificationChannel for CountingChannel {
        fn name(&self) -> &'static str {
            self.channel_name
        }
        async fn send(&self, _alert: &Alert) -> Result<()> {
            let n = self.sends.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err(PipelineError::dispatch("transient"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn routes_by_severity() {
        let email = Arc::new(AtomicU32::new(0));
        let slack = Arc::new(AtomicU32::new(0));
        let dispatcher = AlertDispatcher::with_channels(
            vec![
                Box::new(CountingChannel { channel_name: "email", sends: email.clone(), failures_before_success: 0 }),
                Box::new(CountingChannel { channel_name: "slack", sends: slack.clone(), failures_before_success: 0 }),
            ],
            AlertDispatcher::default_routing(),
            3,
        );

        dispatcher.dispatch(&alert(Severity::Low)).await;
        assert_eq!(email.load(Ordering::SeqCst), 0);
        assert_eq!(slack.load(Ordering::SeqCst), 1);

        dispatcher.dispatch(&alert(Severity::High)).await;
        assert_eq!(email.load(Ordering::SeqCst), 1);
        assert_eq!(slack.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retries_then_recovers() {
        let sends = Arc::new(AtomicU32::new(0));
        let dispatcher = AlertDispatcher::with_channels(
            vec![Box::new(CountingChannel {
                channel_name: "slack",
                sends: sends.clone(),
                failures_before_success: 2,
            })],
            AlertDispatcher::default_routing(),
            3,
        );
        dispatcher.dispatch(&alert(Severity::Medium)).await;
        assert_eq!(sends.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_does_not_block_other_channels() {
        let bad = Arc::new(AtomicU32::new(0));
        let good = Arc::new(AtomicU32::new(0));
        let dispatcher = AlertDispatcher::with_channels(
            vec![
                Box::new(CountingChannel { channel_name: "email", sends: bad.clone(), failures_before_success: 99 }),
                Box::new(CountingChannel { channel_name: "slack", sends: good.clone(), failures_before_success: 0 }),
            ],
            AlertDispatcher::default_routing(),
            2,
        );
        dispatcher.dispatch(&alert(Severity::High)).await;
        assert_eq!(bad.load(Ordering::SeqCst), 2);
        assert_eq!(good.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn email_html_carries_severity_color_and_fields() {
        let html = render_email_html(&alert(Severity::Critical));
        assert!(html.contains("#FF0000"));
        assert!(html.contains("Suspicious login"));
        assert!(html.contains("src_ip"));
        assert!(html.contains("CRITICAL"));
    }
}
