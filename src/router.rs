use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers::{health::health_check, ingest, token::issue_token};
use crate::state::SharedState;

pub fn build(state: SharedState) -> Router {
    let cors = if state
        .settings
        .collector
        .cors_allow_origins
        .iter()
        .any(|origin| origin == "*")
    {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = state
            .settings
            .collector
            .cors_allow_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/token", post(issue_token))
        .route("/health", get(health_check))
        .route("/ingest", post(ingest::ingest))
        .route("/ingest/batch", post(ingest::ingest_batch))
        .route("/ingest/raw", post(ingest::ingest_raw))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
