use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    #[error("Authorization error: {0}")]
    AuthorizationError(String),

    #[error("Rate limit exceeded: {message}")]
    RateLimitError { message: String, retry_after: u64 },

    #[error("Kafka error: {0}")]
    KafkaError(#[from] rdkafka::error::KafkaError),

    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Enrichment error: {0}")]
    EnrichmentError(String),

    #[error("Detection error: {0}")]
    DetectionError(String),

    #[error("Response error: {0}")]
    ResponseError(String),

    #[error("Dispatch error: {0}")]
    DispatchError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailableError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl PipelineError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        PipelineError::ConfigError(msg.into())
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        PipelineError::ValidationError(msg.into())
    }

    pub fn parsing<S: Into<String>>(msg: S) -> Self {
        PipelineError::ParsingError(msg.into())
    }

    pub fn authentication<S: Into<String>>(msg: S) -> Self {
        PipelineError::AuthenticationError(msg.into())
    }

    pub fn authorization<S: Into<String>>(msg: S) -> Self {
        PipelineError::AuthorizationError(msg.into())
    }

    pub fn rate_limit<S: Into<String>>(msg: S, retry_after: u64) -> Self {
        PipelineError::RateLimitError { message: msg.into(), retry_after }
    }

    pub fn storage<S: Into<String>>(msg: S) -> Self {
        PipelineError::StorageError(msg.into())
    }

    pub fn enrichment<S: Into<String>>(msg: S) -> Self {
        PipelineError::EnrichmentError(msg.into())
    }

    pub fn detection<S: Into<String>>(msg: S) -> Self {
        PipelineError::DetectionError(msg.into())
    }

    pub fn response<S: Into<String>>(msg: S) -> Self {
        PipelineError::ResponseError(msg.into())
    }

    pub fn dispatch<S: Into<String>>(msg: S) -> Self {
        PipelineError::DispatchError(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        PipelineError::TimeoutError(msg.into())
    }

    pub fn service_unavailable<S: Into<String>>(msg: S) -> Self {
        PipelineError::ServiceUnavailableError(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        PipelineError::InternalError(msg.into())
    }

    /// Short machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::ConfigError(_) => "CONFIG_ERROR",
            PipelineError::ValidationError(_) => "VALIDATION_ERROR",
            PipelineError::ParsingError(_) => "PARSING_ERROR",
            PipelineError::AuthenticationError(_) => "AUTHENTICATION_ERROR",
            PipelineError::AuthorizationError(_) => "AUTHORIZATION_ERROR",
            PipelineError::RateLimitError { .. } => "RATE_LIMIT_ERROR",
            PipelineError::KafkaError(_) => "KAFKA_ERROR",
            PipelineError::RedisError(_) => "REDIS_ERROR",
            PipelineError::SerializationError(_) => "SERIALIZATION_ERROR",
            PipelineError::YamlError(_) => "YAML_ERROR",
            PipelineError::IoError(_) => "IO_ERROR",
            PipelineError::HttpError(_) => "HTTP_ERROR",
            PipelineError::StorageError(_) => "STORAGE_ERROR",
            PipelineError::EnrichmentError(_) => "ENRICHMENT_ERROR",
            PipelineError::DetectionError(_) => "DETECTION_ERROR",
            PipelineError::ResponseError(_) => "RESPONSE_ERROR",
            PipelineError::DispatchError(_) => "DISPATCH_ERROR",
            PipelineError::TimeoutError(_) => "TIMEOUT_ERROR",
            PipelineError::ServiceUnavailableError(_) => "SERVICE_UNAVAILABLE",
            PipelineError::InternalError(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            PipelineError::ValidationError(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            PipelineError::ParsingError(_) => (StatusCode::UNPROCESSABLE_ENTITY, self.to_string()),
            PipelineError::AuthenticationError(_) => {
                (StatusCode::UNAUTHORIZED, "Authentication failed".to_string())
            }
            PipelineError::AuthorizationError(_) => {
                (StatusCode::FORBIDDEN, "Access denied".to_string())
            }
            PipelineError::RateLimitError { message, .. } => {
                (StatusCode::TOO_MANY_REQUESTS, message.clone())
            }
            PipelineError::KafkaError(_) | PipelineError::ServiceUnavailableError(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service temporarily unavailable".to_string(),
            ),
            PipelineError::TimeoutError(_) => {
                (StatusCode::REQUEST_TIMEOUT, "Request timeout".to_string())
            }
            PipelineError::SerializationError(_) => {
                (StatusCode::BAD_REQUEST, "Data serialization failed".to_string())
            }
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = Json(json!({
            "status": "error",
            "error": self.code(),
            "message": message,
        }));

        let mut response = (status, body).into_response();
        if let PipelineError::RateLimitError { retry_after, .. } = &self {
            if let Ok(v) = axum::http::HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert("Retry-After", v);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(PipelineError::validation("x").code(), "VALIDATION_ERROR");
        assert_eq!(PipelineError::rate_limit("x", 1).code(), "RATE_LIMIT_ERROR");
        assert_eq!(PipelineError::parsing("x").code(), "PARSING_ERROR");
    }
}
