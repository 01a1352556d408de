//! Playbook runner: matches triggered alerts against playbooks and
//! executes their actions with per-action timeouts and failure
//! isolation.

pub mod drivers;
pub mod playbook;
pub mod template;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::error::PipelineError;
use crate::models::Alert;
use crate::storage::IndexStore;
use drivers::DriverRegistry;
use playbook::{Playbook, PlaybookAction, PlaybookStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Ok,
    Skipped,
    Error,
    Timeout,
}

/// One row of the append-only playbook run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub playbook_id: String,
    pub alert_id: String,
    pub action_name: String,
    pub status: ActionStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<Utc>,
}

pub struct ResponseEngine {
    store: Arc<PlaybookStore>,
    drivers: DriverRegistry,
    run_log_store: Option<IndexStore>,
}

impl ResponseEngine {
    pub fn new(
        store: Arc<PlaybookStore>,
        drivers: DriverRegistry,
        run_log_store: Option<IndexStore>,
    ) -> Self {
        Self {
            store,
            drivers,
            run_log_store,
        }
    }

    pub fn store(&self) -> &Arc<PlaybookStore> {
        &self.store
    }

    /// Run every playbook whose triggers all match the alert. Returns
    /// the run log entries produced for this alert.
    pub async fn process_alert(&self, alert: &Alert) -> Vec<RunLogEntry> {
        let playbooks = self.store.snapshot();
        let mut log = Vec::new();

        for playbook in playbooks.iter().filter(|p| p.matches(alert)) {
            tracing::info!(
                playbook_id = %playbook.id,
                alert_id = %alert.id,
                "executing playbook"
            );
            self.execute_playbook(playbook, alert, &mut log).await;
        }

        if let Some(store) = &self.run_log_store {
            let index = store.playbook_runs_index();
            for entry in &log {
                let id = uuid::Uuid::new_v4().to_string();
                if let Ok(doc) = serde_json::to_value(entry) {
                    if let Err(e) = store.put(&index, &id, &doc).await {
                        tracing::warn!(error = %e, "failed to index run log entry");
                    }
                }
            }
        }

        log
    }

    async fn execute_playbook(
        &self,
        playbook: &Playbook,
        alert: &Alert,
        log: &mut Vec<RunLogEntry>,
    ) {
        for action in &playbook.actions {
            let entry = self.execute_action(playbook, action, alert).await;
            let stop = action.fail_stop
                && matches!(entry.status, ActionStatus::Error | ActionStatus::Timeout);
            log.push(entry);
            if stop {
                tracing::warn!(
                    playbook_id = %playbook.id,
                    action = %action.name,
                    "fail_stop action failed, aborting remaining actions"
                );
                break;
            }
        }
    }

    async fn execute_action(
        &self,
        playbook: &Playbook,
        action: &PlaybookAction,
        alert: &Alert,
    ) -> RunLogEntry {
        let started = std::time::Instant::now();
        let mut entry = RunLogEntry {
            playbook_id: playbook.id.clone(),
            alert_id: alert.id.clone(),
            action_name: action.name.clone(),
            status: ActionStatus::Ok,
            duration_ms: 0,
            error: None,
            timestamp: Utc::now(),
        };

        // Conditions gate execution against the triggering alert.
        if !action.conditions.iter().all(|c| c.matches(alert)) {
            tracing::debug!(action = %action.name, "skipping action, conditions not met");
            entry.status = ActionStatus::Skipped;
            return entry;
        }

        let result = async {
            let parameters = template::render_parameters(&action.parameters, alert)?;
            let driver = self.drivers.get(&action.action_type).ok_or_else(|| {
                PipelineError::response(format!(
                    "no driver for action type: {}",
                    action.action_type
                ))
            })?;
            match timeout(
                Duration::from_secs(action.timeout),
                driver.call(&parameters, alert),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(PipelineError::timeout(format!(
                    "action '{}' timed out after {}s",
                    action.name, action.timeout
                ))),
            }
        }
        .await;

        entry.duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(_) => {}
            Err(PipelineError::TimeoutError(message)) => {
                tracing::error!(action = %action.name, "{}", message);
                entry.status = ActionStatus::Timeout;
                entry.error = Some(message);
            }
            Err(e) => {
                tracing::error!(action = %action.name, error = %e, "action failed");
                entry.status = ActionStatus::Error;
                entry.error = Some(e.to_string());
            }
        }
        entry
    }
}
