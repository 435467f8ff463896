//! Error handling for the MCP classification gate
//!
//! Every fallible operation in the crate returns [`McpResult`]. Variants are
//! grouped by the component that raises them; constructor helpers keep call
//! sites short.

use crate::approval_tier::ApprovalTier;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Main error type for the MCP runtime
#[derive(Error, Debug)]
pub enum McpError {
    #[error("Invalid structural model: {}", reasons.join("; "))]
    InvalidModel { reasons: Vec<String> },

    #[error("Precondition failed for {operation}: {message}")]
    Precondition { operation: String, message: String },

    #[error("MCP for model {model_id} is locked; {operation} refused")]
    Locked { model_id: String, operation: String },

    #[error("Conflict on {resource} {id}: {message}")]
    Conflict {
        resource: String,
        id: String,
        message: String,
    },

    #[error("Insufficient authority: required {required}, got {actual}")]
    InsufficientAuthority {
        required: ApprovalTier,
        actual: ApprovalTier,
    },

    #[error("Resource not found: {resource} - {id}")]
    NotFound { resource: String, id: String },

    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Classifier call failed: {message}")]
    Classifier { message: String },

    #[error("Training gateway {operation} failed: {message}")]
    Gateway { operation: String, message: String },

    #[error("Audit operation failed: {operation}")]
    Audit { operation: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Serialization failed: {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Network operation failed: {operation}")]
    Network {
        operation: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Mutex lock failed: {resource}")]
    MutexPoisoned { resource: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Type alias for Result with McpError
pub type McpResult<T> = Result<T, McpError>;

impl McpError {
    /// Create an invalid model error from the collected reasons
    pub fn invalid_model(reasons: Vec<String>) -> Self {
        Self::InvalidModel { reasons }
    }

    pub fn precondition(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Precondition {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn locked(model_id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Locked {
            model_id: model_id.into(),
            operation: operation.into(),
        }
    }

    pub fn conflict(
        resource: impl Into<String>,
        id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            resource: resource.into(),
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn insufficient_authority(required: ApprovalTier, actual: ApprovalTier) -> Self {
        Self::InsufficientAuthority { required, actual }
    }

    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn classifier(message: impl Into<String>) -> Self {
        Self::Classifier {
            message: message.into(),
        }
    }

    pub fn gateway(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Gateway {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn audit(operation: impl Into<String>) -> Self {
        Self::Audit {
            operation: operation.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }

    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn network(operation: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            operation: operation.into(),
            source,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for the errors a retried client request should treat as final.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl IntoResponse for McpError {
    fn into_response(self) -> Response {
        let status = match self {
            McpError::InvalidModel { .. }
            | McpError::Validation { .. }
            | McpError::Serialization { .. }
            | McpError::Config { .. } => StatusCode::BAD_REQUEST,
            McpError::InsufficientAuthority { .. } => StatusCode::FORBIDDEN,
            McpError::NotFound { .. } => StatusCode::NOT_FOUND,
            McpError::Conflict { .. }
            | McpError::Locked { .. }
            | McpError::Precondition { .. } => StatusCode::CONFLICT,
            McpError::Network { .. } | McpError::Gateway { .. } | McpError::Classifier { .. } => {
                StatusCode::BAD_GATEWAY
            }
            McpError::Audit { .. }
            | McpError::Io { .. }
            | McpError::MutexPoisoned { .. }
            | McpError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Poison-safe mutex locking
pub trait SafeLock<T: ?Sized> {
    fn safe_lock(&self) -> McpResult<std::sync::MutexGuard<'_, T>>;
}

impl<T: ?Sized> SafeLock<T> for std::sync::Mutex<T> {
    fn safe_lock(&self) -> McpResult<std::sync::MutexGuard<'_, T>> {
        self.lock().map_err(|_| McpError::MutexPoisoned {
            resource: "mutex".to_string(),
        })
    }
}

/// Poison-safe RwLock read
pub trait SafeReadLock<T: ?Sized> {
    fn safe_read(&self) -> McpResult<std::sync::RwLockReadGuard<'_, T>>;
}

impl<T: ?Sized> SafeReadLock<T> for std::sync::RwLock<T> {
    fn safe_read(&self) -> McpResult<std::sync::RwLockReadGuard<'_, T>> {
        self.read().map_err(|_| McpError::MutexPoisoned {
            resource: "rwlock_read".to_string(),
        })
    }
}

/// Poison-safe RwLock write
pub trait SafeWriteLock<T: ?Sized> {
    fn safe_write(&self) -> McpResult<std::sync::RwLockWriteGuard<'_, T>>;
}

impl<T: ?Sized> SafeWriteLock<T> for std::sync::RwLock<T> {
    fn safe_write(&self) -> McpResult<std::sync::RwLockWriteGuard<'_, T>> {
        self.write().map_err(|_| McpError::MutexPoisoned {
            resource: "rwlock_write".to_string(),
        })
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        McpError::serialization("json_operation", err)
    }
}

impl From<std::io::Error> for McpError {
    fn from(err: std::io::Error) -> Self {
        McpError::io("io_operation", err)
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        McpError::network("http_request", err)
    }
}
