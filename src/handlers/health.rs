use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::SharedState;

/// GET /health: liveness plus reachability of the shared cache and
/// the bus.
pub async fn health_check(State(state): State<SharedState>) -> Json<Value> {
    let cache_ok = state.limiter.ping().await;
    let state_for_bus = state.clone();
    let bus_ok = tokio::task::spawn_blocking(move || state_for_bus.producer.ping())
        .await
        .unwrap_or(false);

    let status = if cache_ok && bus_ok {
        "healthy"
    } else {
        "degraded"
    };
    Json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "services": {
            "cache": if cache_ok { "up" } else { "down" },
            "bus": if bus_ok { "up" } else { "down" },
        }
    }))
}
