use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

pub type Result<T, E = ThrottlerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ThrottlerError {
    /// Backend I/O failure (connection, query, file system).
    #[error("Store error: {0}")]
    Store(String),

    /// An existing table cannot address records with the expected key type.
    #[error("Table '{table}' has an incompatible layout: {detail}")]
    SchemaMismatch { table: String, detail: String },

    #[error("Invalid store URI: {0}")]
    InvalidStoreUri(String),

    /// Commit attempted by a holder that does not own the entity's lock.
    #[error("Lock for entity {entity} in rule '{rule_id}' is not held by this holder")]
    LockNotHeld { rule_id: String, entity: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ThrottlerError {
    /// True for failures caused by the caller breaking the lock/use protocol.
    pub fn is_protocol_misuse(&self) -> bool {
        matches!(self, ThrottlerError::LockNotHeld { .. })
    }
}

impl From<rusqlite::Error> for ThrottlerError {
    fn from(err: rusqlite::Error) -> Self {
        ThrottlerError::Store(err.to_string())
    }
}

impl From<redis::RedisError> for ThrottlerError {
    fn from(err: redis::RedisError) -> Self {
        ThrottlerError::Store(err.to_string())
    }
}

impl From<std::io::Error> for ThrottlerError {
    fn from(err: std::io::Error) -> Self {
        ThrottlerError::Store(err.to_string())
    }
}

impl From<validator::ValidationErrors> for ThrottlerError {
    fn from(err: validator::ValidationErrors) -> Self {
        ThrottlerError::Config(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_error(err: &ThrottlerError) -> Self {
        let message = err.to_string();
        match err {
            ThrottlerError::Store(_) => Self::new("service_unavailable", &message, 503),
            ThrottlerError::SchemaMismatch { .. } => Self::new("schema_mismatch", &message, 503),
            ThrottlerError::InvalidStoreUri(_) => Self::new("bad_request", &message, 400),
            ThrottlerError::LockNotHeld { .. } => Self::new("lock_not_held", &message, 409),
            ThrottlerError::Config(_) => Self::new("configuration_error", &message, 400),
            ThrottlerError::ValidationError(_) => Self::new("validation_error", &message, 422),
            ThrottlerError::Internal(_) => Self::new("internal_error", &message, 500),
        }
    }
}

impl IntoResponse for ThrottlerError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_error(&self);
        let status = StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}
