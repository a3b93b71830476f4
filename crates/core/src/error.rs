//! Core error types for settle operations.
//!
//! Only two variants are meant for callers to handle routinely: [`Error::Timeout`]
//! from bounded waits and [`Error::IllegalRequest`] from the admission scheduler.
//! Everything raised by user callbacks is folded into [`Error::TransitionFault`]
//! and contained at the loop boundary.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Boxed error type accepted from user-supplied callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Core error type for settle operations.
#[derive(Debug, Error)]
pub enum Error {
    // Caller-facing
    #[error("{operation} timed out after {waited_ms}ms")]
    Timeout { operation: String, waited_ms: u64 },

    #[error("illegal request: {reason}")]
    IllegalRequest { reason: String },

    // Contained at the loop/dispatch boundary
    #[error("transition fault in {source_name}: {reason}")]
    TransitionFault { source_name: String, reason: String },

    // Lifecycle
    #[error("{component} has been stopped")]
    Stopped { component: String },

    #[error("no tokio runtime available: {reason}")]
    NoRuntime { reason: String },

    // Configuration
    #[error("invalid configuration: {reason}")]
    ConfigInvalid { reason: String },

    #[error("failed to read file '{path}': {reason}")]
    FileReadFailed { path: PathBuf, reason: String },

    #[error("YAML parse error: {reason}")]
    YamlParseFailed { reason: String },

    #[error("TOML parse error: {reason}")]
    TomlParseFailed { reason: String },
}

impl Error {
    /// Create a timeout error for a bounded wait.
    pub fn timeout(operation: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create an illegal request error.
    pub fn illegal_request(reason: impl Into<String>) -> Self {
        Self::IllegalRequest {
            reason: reason.into(),
        }
    }

    /// Create a transition fault raised by the named callback source.
    pub fn transition_fault(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransitionFault {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    /// Create a stopped error.
    pub fn stopped(component: impl Into<String>) -> Self {
        Self::Stopped {
            component: component.into(),
        }
    }

    /// Create a missing runtime error.
    pub fn no_runtime(reason: impl Into<String>) -> Self {
        Self::NoRuntime {
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn config_invalid(reason: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            reason: reason.into(),
        }
    }

    /// Create a file read error.
    pub fn file_read_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FileReadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether this error is an illegal request.
    #[must_use]
    pub const fn is_illegal_request(&self) -> bool {
        matches!(self, Self::IllegalRequest { .. })
    }
}

/// Render a caught panic payload as text.
#[must_use]
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
