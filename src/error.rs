use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ItemStatus, OutboxOp};

// ============================================================================
// Error Categories
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    RateLimited,
    ClientError,
    ServerError,
    NetworkError,
    Timeout,
    MissingHandler,
    Unknown,
}

impl ErrorCategory {
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Transient
                | Self::RateLimited
                | Self::ServerError
                | Self::NetworkError
                | Self::Timeout
        )
    }

    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Transient => "TRANSIENT",
            Self::RateLimited => "RATE_LIMITED",
            Self::ClientError => "CLIENT_ERROR",
            Self::ServerError => "SERVER_ERROR",
            Self::NetworkError => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::MissingHandler => "MISSING_HANDLER",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn from_http_status(status: u16) -> Self {
        match status {
            408 => Self::Timeout,
            429 => Self::RateLimited,
            400..=499 => Self::ClientError,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }
}

pub(crate) fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}

// ============================================================================
// Remote call failures
// ============================================================================

/// Failure of a remote create/update/delete/list call.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct DispatchError {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
}

impl DispatchError {
    pub const MAX_MESSAGE_LENGTH: usize = 512;

    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        let mut message = message.into();
        truncate_utf8_safe(&mut message, Self::MAX_MESSAGE_LENGTH);
        Self {
            category,
            code: category.code().to_string(),
            message,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transient, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NetworkError, message)
    }

    #[must_use]
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorCategory::from_http_status(status), message);
        err.code = format!("HTTP_{status}");
        err
    }

    #[must_use]
    pub fn missing_handler(entity: &str, op: OutboxOp) -> Self {
        Self::new(
            ErrorCategory::MissingHandler,
            format!("no {op} handler registered for entity '{entity}'"),
        )
    }

    #[must_use]
    pub fn unknown_entity(entity: &str) -> Self {
        Self::new(
            ErrorCategory::MissingHandler,
            format!("entity '{entity}' is not registered"),
        )
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }
}

/// Failure of a prefetch/warm fetch function.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("fetch failed ({category:?}): {message}")]
pub struct FetchError {
    pub category: ErrorCategory,
    pub message: String,
}

impl FetchError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        let mut message = message.into();
        truncate_utf8_safe(&mut message, DispatchError::MAX_MESSAGE_LENGTH);
        Self { category, message }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NetworkError, message)
    }
}

impl From<DispatchError> for FetchError {
    fn from(e: DispatchError) -> Self {
        Self::new(e.category, e.message)
    }
}

// ============================================================================
// Local failures
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(not(target_arch = "wasm32"))]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage task failed: {0}")]
    Join(String),

    #[error("store not initialized")]
    NotInitialized,

    #[error("storage error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox is full ({0} entries)")]
    Full(usize),

    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("payload for '{entity}' has neither id nor clientId")]
    MissingIdentity { entity: String },

    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("entry is being dispatched: {0}")]
    InFlight(String),

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: ItemStatus, to: ItemStatus },

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("malformed configuration document: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_truncation() {
        let mut s = "Hello 🌍 World".to_string();
        truncate_utf8_safe(&mut s, 10);
        assert!(s.is_char_boundary(s.len()));
        assert!(s.len() <= 10);
    }

    #[test]
    fn test_utf8_truncation_multi_byte() {
        let mut s = "日本語".to_string();
        truncate_utf8_safe(&mut s, 4);
        assert_eq!(s, "日");
    }

    #[test]
    fn test_error_category_retryable() {
        assert!(ErrorCategory::Transient.is_retryable());
        assert!(ErrorCategory::RateLimited.is_retryable());
        assert!(ErrorCategory::NetworkError.is_retryable());
        assert!(!ErrorCategory::ClientError.is_retryable());
        assert!(!ErrorCategory::MissingHandler.is_retryable());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(ErrorCategory::from_http_status(429), ErrorCategory::RateLimited);
        assert_eq!(ErrorCategory::from_http_status(404), ErrorCategory::ClientError);
        assert_eq!(ErrorCategory::from_http_status(503), ErrorCategory::ServerError);

        let err = DispatchError::http(503, "unavailable");
        assert_eq!(err.code, "HTTP_503");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_dispatch_error_truncates_message() {
        let err = DispatchError::transient("x".repeat(2_000));
        assert!(err.message.len() <= DispatchError::MAX_MESSAGE_LENGTH);
    }

    #[test]
    fn test_missing_handler_message_names_entity_and_op() {
        let err = DispatchError::missing_handler("photos", OutboxOp::Update);
        assert_eq!(err.category, ErrorCategory::MissingHandler);
        assert!(err.message.contains("update"));
        assert!(err.message.contains("photos"));
    }
}
