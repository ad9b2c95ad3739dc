//! Unified error handling for the healthmesh crate
//!
//! Every component owns a narrow error enum; this module folds them into a
//! single [`Error`] so that task boundaries can classify failures the same
//! way everywhere.
//!
//! # Architecture
//!
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! Transient I/O failures are recoverable and get retried by the owning
//! task; structural failures (bad payloads, missing fields) are not, and the
//! offending event is dropped after logging.

use std::io;
use thiserror::Error;

// Re-export domain-specific errors for convenience
pub use crate::alarm::AlarmError;
pub use crate::collector::client::ClientError;
pub use crate::config::ConfigError;
pub use crate::coordination::CoordError;
pub use crate::store::StoreError;

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network-related errors (HTTP, dial, timeout)
    Network,
    /// Coordination store errors
    Coordination,
    /// Durable store errors
    Storage,
    /// Malformed payloads and missing fields
    Parsing,
    /// Configuration and validation errors
    Config,
    /// Alarm delivery errors
    Alarm,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Short label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Coordination => "coordination",
            Self::Storage => "storage",
            Self::Parsing => "parsing",
            Self::Config => "config",
            Self::Alarm => "alarm",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the healthmesh crate
#[derive(Error, Debug)]
pub enum Error {
    /// Coordination store errors
    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordError),

    /// Durable store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Alarm sink errors
    #[error("Alarm error: {0}")]
    Alarm(#[from] AlarmError),

    /// Master protocol client errors
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A payload was structurally invalid
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Create a malformed payload error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Check if this error is transient and worth retrying
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Coordination(e) => e.is_recoverable(),
            Self::Store(e) => e.is_recoverable(),
            Self::Alarm(e) => e.is_recoverable(),
            Self::Client(e) => e.is_recoverable(),
            Self::Io(_) => true,
            Self::Config(_) | Self::Json(_) | Self::Malformed(_) => false,
            Self::Other { .. } => false,
        }
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Coordination(_) => ErrorCategory::Coordination,
            Self::Store(_) => ErrorCategory::Storage,
            Self::Alarm(_) => ErrorCategory::Alarm,
            Self::Client(_) | Self::Io(_) => ErrorCategory::Network,
            Self::Config(_) => ErrorCategory::Config,
            Self::Json(_) | Self::Malformed(_) => ErrorCategory::Parsing,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        let err = Error::Coordination(CoordError::Connection("refused".into()));
        assert_eq!(err.category(), ErrorCategory::Coordination);

        let err = Error::malformed("missing ip");
        assert_eq!(err.category(), ErrorCategory::Parsing);
        assert_eq!(err.category().as_str(), "parsing");
    }

    #[test]
    fn test_is_recoverable() {
        let transient = Error::Coordination(CoordError::Connection("reset".into()));
        assert!(transient.is_recoverable());

        let missing = Error::Coordination(CoordError::NoNode("/lb".into()));
        assert!(!missing.is_recoverable());

        let structural = Error::malformed("bad json");
        assert!(!structural.is_recoverable());
    }

    #[test]
    fn test_error_conversion() {
        let store_err = StoreError::WatchInvalidated;
        let unified: Error = store_err.into();
        assert!(matches!(unified, Error::Store(_)));
        assert!(unified.is_recoverable());
    }

    #[test]
    fn test_other_error() {
        let err = Error::other("Something went wrong");
        assert_eq!(err.category(), ErrorCategory::Other);
        assert_eq!(err.to_string(), "Something went wrong");
    }
}
