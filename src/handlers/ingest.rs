//! Ingestion endpoints. All three require the `logs:write` scope and
//! are governed by three independent sliding-window quotas: request
//! rate, batch request rate, and total event rate.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::io::Read;

use crate::auth::{Claims, SCOPE_LOGS_WRITE};
use crate::error::{PipelineError, Result};
use crate::models::{
    BatchItemResult, BatchLogEvents, BatchResponse, BatchSummary, Event, IngestResponse,
    RawLogRequest,
};
use crate::parsers;
use crate::state::SharedState;
use crate::util::rate_limit::QuotaDecision;

fn decode_body(headers: &HeaderMap, body: &Bytes) -> Result<Vec<u8>> {
    let encoding = headers
        .get(axum::http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_ascii_lowercase());
    if matches!(encoding.as_deref(), Some("gzip")) {
        let mut decoder = flate2::read::GzDecoder::new(body.as_ref());
        let mut decoded = Vec::new();
        decoder
            .read_to_end(&mut decoded)
            .map_err(|e| PipelineError::parsing(format!("gzip decode failed: {}", e)))?;
        Ok(decoded)
    } else {
        Ok(body.to_vec())
    }
}

fn parse_json_body<T: serde::de::DeserializeOwned>(headers: &HeaderMap, body: &Bytes) -> Result<T> {
    let bytes = decode_body(headers, body)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| PipelineError::validation(format!("malformed request body: {}", e)))
}

fn rate_limit_headers(decision: &QuotaDecision) -> [(&'static str, HeaderValue); 3] {
    [
        ("X-RateLimit-Limit", HeaderValue::from(decision.limit)),
        ("X-RateLimit-Remaining", HeaderValue::from(decision.remaining)),
        ("X-RateLimit-Reset", HeaderValue::from(decision.reset)),
    ]
}

fn with_rate_limit_headers(decision: &QuotaDecision, mut response: Response) -> Response {
    for (name, value) in rate_limit_headers(decision) {
        response.headers_mut().insert(name, value);
    }
    response
}

/// Enforce the request-level quota plus the event-count quota; returns
/// the request-level decision for the response headers.
async fn enforce_quotas(
    state: &SharedState,
    claims: &Claims,
    batch: bool,
    event_count: u32,
) -> Result<QuotaDecision> {
    let limits = &state.settings.rate_limit;
    let (scope, times, seconds) = if batch {
        ("ingest_batch", limits.batch_times, limits.batch_seconds)
    } else {
        ("ingest", limits.default_times, limits.default_seconds)
    };

    let request_decision = state
        .limiter
        .check(scope, &claims.sub, times, seconds, 1)
        .await?;
    let now = chrono::Utc::now().timestamp() as u64;
    if !request_decision.allowed {
        return Err(PipelineError::rate_limit(
            "Request rate limit exceeded",
            request_decision.retry_after(now),
        ));
    }

    let events_decision = state
        .limiter
        .check(
            "ingest_events",
            &claims.sub,
            limits.events_times,
            limits.events_seconds,
            event_count,
        )
        .await?;
    if !events_decision.allowed {
        return Err(PipelineError::rate_limit(
            "Event rate limit exceeded",
            events_decision.retry_after(now),
        ));
    }

    Ok(request_decision)
}

/// Accept one event: publish to the raw-events topic keyed by `source`
/// (per-source ordering) and wait for the broker acknowledgement before
/// answering. A publish failure is a 5xx with no partial write.
async fn accept_event(state: &SharedState, event: Event) -> Result<IngestResponse> {
    let event = event.accept(state.settings.collector.max_event_bytes)?;
    let id = event.id.clone().expect("accepted event has an id");
    state
        .producer
        .publish(&state.settings.kafka.raw_logs_topic, &event.source, &event)
        .await?;
    tracing::info!(source = %event.source, id = %id, "event accepted");
    Ok(IngestResponse {
        status: "success".to_string(),
        id,
    })
}

/// POST /ingest: single event.
pub async fn ingest(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let claims = state.auth.authorize(&headers, &[SCOPE_LOGS_WRITE])?;
    let decision = enforce_quotas(&state, &claims, false, 1).await?;

    let event: Event = parse_json_body(&headers, &body)?;
    let response = accept_event(&state, event).await?;
    Ok(with_rate_limit_headers(
        &decision,
        Json(response).into_response(),
    ))
}

/// POST /ingest/batch: up to the configured maximum of events, each
/// attempted independently. Partial failure still answers 200 with
/// per-event results; only auth and quota failures reject the request.
pub async fn ingest_batch(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let claims = state.auth.authorize(&headers, &[SCOPE_LOGS_WRITE])?;
    let batch: BatchLogEvents = parse_json_body(&headers, &body)?;

    if batch.events.is_empty() {
        return Err(PipelineError::validation("batch contains no events"));
    }
    let max = state.settings.collector.max_batch_events;
    if batch.events.len() > max {
        return Err(PipelineError::validation(format!(
            "batch exceeds maximum of {} events",
            max
        )));
    }

    let decision = enforce_quotas(&state, &claims, true, batch.events.len() as u32).await?;

    let mut results = Vec::with_capacity(batch.events.len());
    let mut successful = 0usize;
    for event in batch.events {
        match accept_event(&state, event).await {
            Ok(response) => {
                successful += 1;
                results.push(BatchItemResult {
                    status: "success".to_string(),
                    id: Some(response.id),
                    error: None,
                });
            }
            Err(e) => {
                results.push(BatchItemResult {
                    status: "error".to_string(),
                    id: None,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    let total = results.len();
    let response = BatchResponse {
        summary: BatchSummary {
            total,
            successful,
            failed: total - successful,
        },
        results,
    };
    Ok(with_rate_limit_headers(
        &decision,
        (StatusCode::OK, Json(response)).into_response(),
    ))
}

/// POST /ingest/raw: parse a raw line (auto-detecting the format when
/// none is given) into an event and accept it. Parse failures are 422.
pub async fn ingest_raw(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let claims = state.auth.authorize(&headers, &[SCOPE_LOGS_WRITE])?;
    let decision = enforce_quotas(&state, &claims, false, 1).await?;

    let request: RawLogRequest = parse_json_body(&headers, &body)?;
    let event = parsers::parse_line(
        &request.source,
        &request.log_line,
        request.format.as_deref(),
    )?;
    let response = accept_event(&state, event).await?;
    Ok(with_rate_limit_headers(
        &decision,
        Json(json!({
            "status": response.status,
            "id": response.id,
        }))
        .into_response(),
    ))
}
