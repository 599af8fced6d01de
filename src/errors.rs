//! Structured HTTP errors
//!
//! Every failure leaving the service is an [`AppError`] rendered as
//! `{code, message}` JSON with a status code derived from the error kind.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::bandit::BanditError;
use crate::generation::GenerationError;
use crate::metrics;
use crate::storage::StoreError;

/// Structured error response for API clients
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Additional error context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    /// Request ID for tracing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Application error types with proper categorization
#[derive(Debug)]
pub enum AppError {
    // Validation Errors (400)
    InvalidInput { field: String, reason: String },
    InvalidTestId(String),
    InvalidVariantId(String),
    InvalidEventType(String),

    // Not Found Errors (404)
    TestNotFound(String),
    TestNotActive { id: String, status: String },
    NoVariants(String),
    VariantNotFound(String),

    // Persistence (503, retryable by the caller)
    StoreTimeout(String),
    StoreConflict(String),
    StoreUnavailable(String),
    StorageError(String),

    // Upstream generator (502)
    GeneratorFailed(String),

    // Generic wrapper for external errors (500)
    Internal(anyhow::Error),
}

impl AppError {
    /// Get error code for client identification
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::InvalidTestId(_) => "INVALID_TEST_ID",
            Self::InvalidVariantId(_) => "INVALID_VARIANT_ID",
            Self::InvalidEventType(_) => "INVALID_EVENT_TYPE",
            Self::TestNotFound(_) => "TEST_NOT_FOUND",
            Self::TestNotActive { .. } => "TEST_NOT_ACTIVE",
            Self::NoVariants(_) => "NO_VARIANTS",
            Self::VariantNotFound(_) => "VARIANT_NOT_FOUND",
            Self::StoreTimeout(_) => "STORE_TIMEOUT",
            Self::StoreConflict(_) => "STORE_CONFLICT",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::StorageError(_) => "STORAGE_ERROR",
            Self::GeneratorFailed(_) => "GENERATOR_FAILED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Get HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput { .. }
            | Self::InvalidTestId(_)
            | Self::InvalidVariantId(_)
            | Self::InvalidEventType(_) => StatusCode::BAD_REQUEST,

            Self::TestNotFound(_)
            | Self::TestNotActive { .. }
            | Self::NoVariants(_)
            | Self::VariantNotFound(_) => StatusCode::NOT_FOUND,

            Self::StoreTimeout(_)
            | Self::StoreConflict(_)
            | Self::StoreUnavailable(_)
            | Self::StorageError(_) => StatusCode::SERVICE_UNAVAILABLE,

            Self::GeneratorFailed(_) => StatusCode::BAD_GATEWAY,

            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether repeating the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreTimeout(_) | Self::StoreConflict(_) | Self::StoreUnavailable(_)
        )
    }

    /// Get detailed error message
    pub fn message(&self) -> String {
        match self {
            Self::InvalidInput { field, reason } => {
                format!("Invalid input for field '{field}': {reason}")
            }
            Self::InvalidTestId(msg) => format!("Invalid test ID: {msg}"),
            Self::InvalidVariantId(msg) => format!("Invalid variant ID: {msg}"),
            Self::InvalidEventType(msg) => format!("Invalid event type: {msg}"),
            Self::TestNotFound(id) => format!("Test not found: {id}"),
            Self::TestNotActive { id, status } => {
                format!("Test {id} is {status} and does not serve variants")
            }
            Self::NoVariants(id) => format!("Test {id} has no variants"),
            Self::VariantNotFound(id) => format!("Variant not found: {id}"),
            Self::StoreTimeout(msg) => format!("Storage timed out: {msg}"),
            Self::StoreConflict(msg) => format!("Storage conflict: {msg}"),
            Self::StoreUnavailable(msg) => format!("Storage unavailable: {msg}"),
            Self::StorageError(msg) => format!("Storage error: {msg}"),
            Self::GeneratorFailed(msg) => format!("Subject line generation failed: {msg}"),
            Self::Internal(err) => format!("Internal error: {err}"),
        }
    }

    /// Convert to structured error response
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.code().to_string(),
            message: self.message(),
            details: self
                .is_retryable()
                .then(|| "retryable: the request did not change any state".to_string()),
            request_id: None,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for AppError {}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Timeout(msg) => Self::StoreTimeout(msg),
            StoreError::Conflict(msg) => Self::StoreConflict(msg),
            StoreError::Backend(msg) => Self::StoreUnavailable(msg),
            other => Self::StorageError(other.to_string()),
        }
    }
}

impl From<BanditError> for AppError {
    fn from(err: BanditError) -> Self {
        match err {
            BanditError::TestNotFound(id) => Self::TestNotFound(id.to_string()),
            BanditError::TestNotActive { id, status } => Self::TestNotActive {
                id: id.to_string(),
                status: status.to_string(),
            },
            BanditError::NoVariants(id) => Self::NoVariants(id.to_string()),
            BanditError::VariantNotFound(id) => Self::VariantNotFound(id.to_string()),
            BanditError::InvalidInput { field, reason } if field == "event_type" => {
                Self::InvalidEventType(reason)
            }
            BanditError::InvalidInput { field, reason } => Self::InvalidInput { field, reason },
            BanditError::Persistence(e) => e.into(),
        }
    }
}

impl From<GenerationError> for AppError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::InvalidInput { field, reason } => Self::InvalidInput { field, reason },
            GenerationError::Generator(e) => Self::GeneratorFailed(format!("{e:#}")),
            GenerationError::Store(e) => e.into(),
        }
    }
}

/// Axum IntoResponse implementation for proper HTTP responses
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        metrics::ERRORS_TOTAL.with_label_values(&[self.code()]).inc();
        if status.is_server_error() {
            tracing::error!(code = self.code(), "{}", self.message());
        }

        (status, Json(self.to_response())).into_response()
    }
}

/// Helper trait to convert validation errors
pub trait ValidationErrorExt<T> {
    fn map_validation_err(self, field: &str) -> Result<T>;
}

impl<T> ValidationErrorExt<T> for anyhow::Result<T> {
    fn map_validation_err(self, field: &str) -> Result<T> {
        self.map_err(|e| AppError::InvalidInput {
            field: field.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Type alias for Results using AppError
pub type Result<T> = std::result::Result<T, AppError>;
