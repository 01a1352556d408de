//! Collector service: the authenticated HTTP front door of the
//! pipeline.

use std::net::SocketAddr;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use siem_event_pipeline::auth::{AuthManager, MemoryUserStore};
use siem_event_pipeline::bus::EventProducer;
use siem_event_pipeline::config::Settings;
use siem_event_pipeline::router;
use siem_event_pipeline::state::AppState;
use siem_event_pipeline::util::rate_limit::RateLimiter;
use siem_event_pipeline::exit_codes;

const STARTUP_RETRIES: u32 = 5;

async fn connect_redis(url: &str) -> Option<redis::aio::ConnectionManager> {
    for attempt in 1..=STARTUP_RETRIES {
        match redis::Client::open(url) {
            Ok(client) => match redis::aio::ConnectionManager::new(client).await {
                Ok(manager) => return Some(manager),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "redis connection failed, retrying")
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "invalid REDIS_URL");
                return None;
            }
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
    None
}

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

    let redis = match &settings.redis.url {
        Some(url) => match connect_redis(url).await {
            Some(manager) => Some(manager),
            None => {
                tracing::error!("cache unreachable after {} attempts", STARTUP_RETRIES);
                exit(exit_codes::UPSTREAM);
            }
        },
        None => {
            tracing::warn!("REDIS_URL not set, using in-process rate limit counters");
            None
        }
    };
    let limiter = RateLimiter::new(redis);

    let producer = match EventProducer::new(&settings.kafka, "collector") {
        Ok(producer) => producer,
        Err(e) => {
            tracing::error!(error = %e, "failed to create bus producer");
            exit(exit_codes::UPSTREAM);
        }
    };

    let auth = match AuthManager::new(
        settings.auth.clone(),
        Box::new(MemoryUserStore::with_default_admin()),
    ) {
        Ok(auth) => auth,
        Err(e) => {
            tracing::error!(error = %e, "fatal auth configuration error");
            exit(exit_codes::CONFIG);
        }
    };

    let addr: SocketAddr = match format!(
        "{}:{}",
        settings.collector.host, settings.collector.port
    )
    .parse()
    {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(error = %e, "invalid COLLECTOR_HOST/COLLECTOR_PORT");
            exit(exit_codes::CONFIG);
        }
    };

    let state = Arc::new(AppState {
        settings,
        auth,
        limiter,
        producer,
    });
    let app = router::build(state);

    tracing::info!(%addr, version = siem_event_pipeline::VERSION, "collector listening");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind listener");
            exit(exit_codes::CONFIG);
        }
    };

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    });

    if let Err(e) = server.await {
        tracing::error!(error = %e, "server error");
        exit(exit_codes::CONFIG);
    }
    exit(exit_codes::OK);
}
