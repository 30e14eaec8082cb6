pub mod registry;

pub use registry::RegistryError;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Coarse failure taxonomy shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Deadline exceeded. Always retryable.
    Timeout,
    /// Missing or invalid construction option. Never retryable.
    BackendConfig,
    /// Connectivity or process-launch failure.
    BackendTransport,
    /// Malformed or incomplete response. Never retryable.
    BackendProtocol,
    /// Explicit throttling by the provider. Always retryable.
    RateLimited,
    /// Uncaught fault. Not retried.
    Exception,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::BackendConfig => "backend_config",
            ErrorKind::BackendTransport => "backend_transport",
            ErrorKind::BackendProtocol => "backend_protocol",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Exception => "exception",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed attempt, classified so the runner can decide whether to retry.
///
/// `error_type` is the backend-specific tag (`rate_limit`, `adb_exit`, ...) and
/// is what ends up as `type` in the serialized record; `kind` is the coarse
/// class the retry policy reasons about.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ClassifiedError {
    pub message: String,
    pub retryable: bool,
    #[serde(rename = "type")]
    pub error_type: String,
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

impl ClassifiedError {
    pub fn new(
        kind: ErrorKind,
        error_type: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self {
            message: message.into(),
            retryable,
            error_type: error_type.into(),
            kind,
            status_code: None,
            details: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, "timeout", message, true)
    }

    pub fn backend_config(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BackendConfig, error_type, message, false)
    }

    pub fn transport(
        error_type: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self::new(ErrorKind::BackendTransport, error_type, message, retryable)
    }

    pub fn protocol(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BackendProtocol, error_type, message, false)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, "rate_limit", message, true)
    }

    pub fn exception(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Exception, "exception", message, false)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }
}

/// Best-effort text for a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
