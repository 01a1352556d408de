//! Action drivers for the playbook runner.
//!
//! Each driver exposes one async call with rendered parameters and
//! returns a serializable result; the runner owns the timeout. Drivers
//! for case management (TheHive), observable analysis (Cortex), and
//! host automation (Ansible) talk to their services; `python` runs a
//! user-supplied script as a subprocess; `webhook` posts the alert to
//! an arbitrary endpoint.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{PipelineError, Result};
use crate::models::Alert;

#[async_trait]
pub trait ActionDriver: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Execute the action. `parameters` are already rendered against
    /// the alert.
    async fn call(&self, parameters: &Value, alert: &Alert) -> Result<Value>;
}

pub struct TheHiveDriver {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl TheHiveDriver {
    pub fn new(client: reqwest::Client, url: String, api_key: String) -> Self {
        Self { client, url, api_key }
    }
}

#[async_trait]
impl ActionDriver for TheHiveDriver {
    fn kind(&self) -> &'static str {
        "thehive"
    }

    async fn call(&self, parameters: &Value, alert: &Alert) -> Result<Value> {
        let body = json!({
            "title": parameters.get("title").cloned().unwrap_or(json!(alert.title)),
            "description": parameters
                .get("description")
                .cloned()
                .unwrap_or(json!(alert.description)),
            "severity": parameters
                .get("severity")
                .cloned()
                .unwrap_or(json!(alert.severity.as_str())),
            "tags": parameters.get("tags").cloned().unwrap_or(json!(alert.tags)),
            "source": "siem_event_pipeline",
            "sourceRef": alert.id,
        });
        let response = self
            .client
            .post(format!("{}/api/case", self.url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PipelineError::response(format!(
                "thehive returned {}",
                response.status()
            )));
        }
        let case: Value = response.json().await?;
        tracing::info!(case_id = ?case.get("id"), "created case");
        Ok(case)
    }
}

pub struct CortexDriver {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl CortexDriver {
    pub fn new(client: reqwest::Client, url: String, api_key: String) -> Self {
        Self { client, url, api_key }
    }
}

#[async_trait]
impl ActionDriver for CortexDriver {
    fn kind(&self) -> &'static str {
        "cortex"
    }

    async fn call(&self, parameters: &Value, _alert: &Alert) -> Result<Value> {
        let analyzer_id = parameters
            .get("analyzer_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PipelineError::response("cortex action requires analyzer_id"))?;
        let data = parameters.get("data").cloned().unwrap_or(Value::Null);

        let response = self
            .client
            .post(format!(
                "{}/api/analyzer/{}/run",
                self.url.trim_end_matches('/'),
                analyzer_id
            ))
            .bearer_auth(&self.api_key)
            .json(&json!({"data": data}))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PipelineError::response(format!(
                "cortex returned {}",
                response.status()
            )));
        }
        let job: Value = response.json().await?;
        tracing::info!(job_id = ?job.get("id"), analyzer_id, "started analyzer job");
        Ok(job)
    }
}

pub struct AnsibleDriver;

#[async_trait]
impl ActionDriver for AnsibleDriver {
    fn kind(&self) -> &'static str {
        "ansible"
    }

    async fn call(&self, parameters: &Value, _alert: &Alert) -> Result<Value> {
        let playbook = parameters
            .get("playbook")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PipelineError::response("ansible action requires a playbook path"))?;

        let mut command = Command::new("ansible-playbook");
        command.arg(playbook);
        if let Some(Value::Object(variables)) = parameters.get("variables") {
            let extra_vars = serde_json::to_string(variables)?;
            command.arg("--extra-vars").arg(extra_vars);
        }
        if let Some(inventory) = parameters.get("inventory").and_then(|v| v.as_str()) {
            command.arg("-i").arg(inventory);
        }

        let output = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::response(format!(
                "ansible-playbook exited with {}: {}",
                output.status, stderr
            )));
        }
        Ok(json!({"rc": 0, "stdout": stdout}))
    }
}

/// User-defined subprocess driver: runs a configured interpreter on a
/// script with the alert JSON piped to stdin. The script's stdout is
/// returned as the action result.
pub struct PythonDriver {
    interpreter: String,
}

impl PythonDriver {
    pub fn new(interpreter: String) -> Self {
        Self { interpreter }
    }
}

#[async_trait]
impl ActionDriver for PythonDriver {
    fn kind(&self) -> &'static str {
        "python"
    }

    async fn call(&self, parameters: &Value, alert: &Alert) -> Result<Value> {
        let script = parameters
            .get("script")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PipelineError::response("python action requires a script path"))?;

        let mut child = Command::new(&self.interpreter)
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let payload = serde_json::to_vec(&json!({
            "alert": alert,
            "kwargs": parameters.get("kwargs").cloned().unwrap_or(json!({})),
        }))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::response(format!(
                "script exited with {}: {}",
                output.status, stderr
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(serde_json::from_str(&stdout)
            .unwrap_or_else(|_| json!({"output": stdout.trim()})))
    }
}

pub struct WebhookDriver {
    client: reqwest::Client,
}

impl WebhookDriver {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ActionDriver for WebhookDriver {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    async fn call(&self, parameters: &Value, alert: &Alert) -> Result<Value> {
        let url = parameters
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PipelineError::response("webhook action requires a url"))?;
        let body = parameters.get("body").cloned().unwrap_or_else(|| {
            serde_json::to_value(alert).unwrap_or(Value::Null)
        });
        let response = self.client.post(url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::response(format!(
                "webhook returned {}",
                status
            )));
        }
        Ok(json!({"status": status.as_u16()}))
    }
}

/// Registry of configured drivers keyed by action type.
pub struct DriverRegistry {
    drivers: HashMap<&'static str, Box<dyn ActionDriver>>,
}

impl DriverRegistry {
    /// Wire up every driver whose integration is configured in the
    /// environment. Webhook, ansible, and python drivers need no remote
    /// credentials and are always available.
    pub fn from_env() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        let mut registry = Self {
            drivers: HashMap::new(),
        };

        if let (Ok(url), Ok(api_key)) = (
            std::env::var("THEHIVE_URL"),
            std::env::var("THEHIVE_API_KEY"),
        ) {
            registry.register(Box::new(TheHiveDriver::new(client.clone(), url, api_key)));
        }
        if let (Ok(url), Ok(api_key)) = (
            std::env::var("CORTEX_URL"),
            std::env::var("CORTEX_API_KEY"),
        ) {
            registry.register(Box::new(CortexDriver::new(client.clone(), url, api_key)));
        }
        registry.register(Box::new(AnsibleDriver));
        registry.register(Box::new(PythonDriver::new(
            std::env::var("PYTHON_ACTION_INTERPRETER").unwrap_or_else(|_| "python3".to_string()),
        )));
        registry.register(Box::new(WebhookDriver::new(client)));
        Ok(registry)
    }

    pub fn register(&mut self, driver: Box<dyn ActionDriver>) {
        self.drivers.insert(driver.kind(), driver);
    }

    pub fn get(&self, kind: &str) -> Option<&dyn ActionDriver> {
        self.drivers.get(kind).map(|d| d.as_ref())
    }

    pub fn empty() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }
}
