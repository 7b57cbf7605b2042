use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {0}: {1}")]
    InvalidVar(&'static str, String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache i/o error: {0}")]
    Io(#[from] redis::RedisError),
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("counter table initialization timed out")]
    Unavailable,
    #[error("malformed counter table entry: {0}")]
    Corrupt(String),
    #[error("store error during cache population: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum EventLogError {
    #[error("event log i/o error: {0}")]
    Io(#[from] redis::RedisError),
    #[error("event log backend error: {0}")]
    Backend(String),
    #[error("event serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum PubSubError {
    #[error("pubsub i/o error: {0}")]
    Io(#[from] redis::RedisError),
    #[error("pubsub backend error: {0}")]
    Backend(String),
    #[error("pubsub connection lost")]
    ConnectionLost,
}

#[derive(Error, Debug)]
pub enum FanoutError {
    #[error("global connection limit reached ({0})")]
    GlobalCapacity(usize),
    #[error("per-user connection limit reached ({0})")]
    UserCapacity(usize),
    #[error("fan-out manager is shut down")]
    ShutDown,
    #[error(transparent)]
    Transport(#[from] PubSubError),
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Forbidden")]
    Forbidden,
    #[error("Poll not found")]
    PollNotFound,
    #[error("Poll option not found")]
    OptionNotFound,
    #[error("Connection limit reached")]
    CapacityExceeded,
    #[error("Vote counts temporarily unavailable")]
    CacheUnavailable,
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Event log error: {0}")]
    EventLogError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "Forbidden"),
            ApiError::PollNotFound => (StatusCode::NOT_FOUND, "Poll not found"),
            ApiError::OptionNotFound => (StatusCode::NOT_FOUND, "Poll option not found"),
            ApiError::CapacityExceeded => {
                (StatusCode::TOO_MANY_REQUESTS, "Connection limit reached")
            }
            ApiError::CacheUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Vote counts temporarily unavailable",
            ),
            ApiError::DatabaseError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.as_str()),
            ApiError::EventLogError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.as_str()),
        };

        let body = Json(json!({
            "error": error_message,
            "details": self.to_string()
        }));

        (status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        ApiError::DatabaseError(error.to_string())
    }
}

impl From<CacheError> for ApiError {
    fn from(error: CacheError) -> Self {
        match error {
            CacheError::Unavailable => ApiError::CacheUnavailable,
            other => ApiError::DatabaseError(other.to_string()),
        }
    }
}

impl From<EventLogError> for ApiError {
    fn from(error: EventLogError) -> Self {
        ApiError::EventLogError(error.to_string())
    }
}

impl From<FanoutError> for ApiError {
    fn from(error: FanoutError) -> Self {
        match error {
            FanoutError::GlobalCapacity(_) | FanoutError::UserCapacity(_) => {
                ApiError::CapacityExceeded
            }
            other => ApiError::DatabaseError(other.to_string()),
        }
    }
}
