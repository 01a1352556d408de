//! Processor worker: consumes raw events, enriches and indexes them,
//! and drives detection, response, and alert dispatch.
//!
//! SIGHUP reloads detection rules and playbooks without a restart.

use std::process::exit;
use std::sync::Arc;

use siem_event_pipeline::config::Settings;
use siem_event_pipeline::detection::rules::RuleStore;
use siem_event_pipeline::detection::DetectionEngine;
use siem_event_pipeline::dispatch::AlertDispatcher;
use siem_event_pipeline::exit_codes;
use siem_event_pipeline::processor::Processor;
use siem_event_pipeline::response::drivers::DriverRegistry;
use siem_event_pipeline::response::playbook::PlaybookStore;
use siem_event_pipeline::response::ResponseEngine;
use siem_event_pipeline::storage::IndexStore;

const STARTUP_RETRIES: u32 = 5;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("fatal configuration error: {}", e);
            exit(exit_codes::CONFIG);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(&settings.collector.log_level)
            }),
        )
        .init();

    let store = match IndexStore::new(&settings.index) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "failed to build index client");
            exit(exit_codes::CONFIG);
        }
    };

    // The index template must be in place before the first write.
    let mut template_ok = false;
    for attempt in 1..=STARTUP_RETRIES {
        match store.ensure_template().await {
            Ok(()) => {
                template_ok = true;
                break;
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "index template install failed, retrying");
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            }
        }
    }
    if !template_ok {
        tracing::error!("index store unreachable after {} attempts", STARTUP_RETRIES);
        exit(exit_codes::UPSTREAM);
    }

    // A rule or playbook that fails to parse is a fatal startup error;
    // silently running without detections is worse than not running.
    let rule_store = match RuleStore::load(&settings.detection.rules_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, "failed to load detection rules");
            exit(exit_codes::CONFIG);
        }
    };
    let playbook_store = match PlaybookStore::load(&settings.detection.playbooks_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, "failed to load playbooks");
            exit(exit_codes::CONFIG);
        }
    };

    let drivers = match DriverRegistry::from_env() {
        Ok(drivers) => drivers,
        Err(e) => {
            tracing::error!(error = %e, "failed to configure action drivers");
            exit(exit_codes::CONFIG);
        }
    };
    let dispatcher = match AlertDispatcher::from_settings(&settings.dispatch) {
        Ok(dispatcher) => Arc::new(dispatcher),
        Err(e) => {
            tracing::error!(error = %e, "failed to configure alert channels");
            exit(exit_codes::CONFIG);
        }
    };

    let detection = Arc::new(DetectionEngine::new(rule_store.clone(), &settings.detection));
    let response = Arc::new(ResponseEngine::new(
        playbook_store.clone(),
        drivers,
        Some(store.clone()),
    ));

    let processor = match Processor::new(&settings, store, detection, response, dispatcher) {
        Ok(processor) => processor,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize processor");
            exit(exit_codes::UPSTREAM);
        }
    };

    // Hot reload on SIGHUP.
    tokio::spawn(async move {
        let mut hup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(error = %e, "SIGHUP handler unavailable");
                return;
            }
        };
        while hup.recv().await.is_some() {
            if let Err(e) = rule_store.reload() {
                tracing::error!(error = %e, "rule reload failed, keeping previous snapshot");
            }
            if let Err(e) = playbook_store.reload() {
                tracing::error!(error = %e, "playbook reload failed, keeping previous snapshot");
            }
        }
    });

    let worker = tokio::spawn(async move { processor.run().await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            exit(exit_codes::OK);
        }
        result = worker => {
            match result {
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "processor stopped with error");
                    exit(exit_codes::UPSTREAM);
                }
                _ => exit(exit_codes::OK),
            }
        }
    }
}
