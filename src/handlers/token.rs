use axum::extract::{ConnectInfo, State};
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use axum::Form;
use axum::Json;
use serde::Deserialize;
use std::net::SocketAddr;

use crate::error::{PipelineError, Result};
use crate::state::SharedState;

#[derive(Debug, Deserialize)]
pub struct TokenForm {
    pub username: String,
    pub password: String,
}

/// POST /token: form-encoded credential exchange.
///
/// The endpoint itself is limited per client IP, independently of the
/// per-username failed-login lockout inside the login flow.
pub async fn issue_token(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Form(form): Form<TokenForm>,
) -> Result<Response> {
    let client_ip = addr.ip().to_string();

    let decision = state
        .limiter
        .check(
            "token",
            &client_ip,
            state.settings.auth.login_rate_times,
            state.settings.auth.login_rate_seconds,
            1,
        )
        .await?;
    if !decision.allowed {
        let now = chrono::Utc::now().timestamp() as u64;
        return Err(PipelineError::rate_limit(
            "Too many login requests",
            decision.retry_after(now),
        ));
    }

    let token = state
        .auth
        .login(&state.limiter, &form.username, &form.password, &client_ip)
        .await?;
    let mut response = Json(token).into_response();
    let headers = response.headers_mut();
    headers.insert("X-RateLimit-Limit", HeaderValue::from(decision.limit));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(decision.remaining));
    headers.insert("X-RateLimit-Reset", HeaderValue::from(decision.reset));
    Ok(response)
}
