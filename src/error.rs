//! Error types for Chatvault
//!
//! This module defines the error taxonomy shared by the session store, the
//! search index, the exporter and the session manager, using `thiserror`
//! for ergonomic error handling.

use thiserror::Error;

/// Boxed source error carried by storage and export failures
pub type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for Chatvault operations
///
/// Every public operation returns one of these variants. Callers decide
/// whether to retry, prompt the user or abort; nothing is retried internally.
#[derive(Error, Debug)]
pub enum ChatvaultError {
    /// Malformed input rejected before any store access
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced session or message does not exist
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity ("session", "message")
        entity: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// Attempted creation with an identifier that already exists
    #[error("{entity} already exists: {id}")]
    Conflict {
        /// Kind of entity ("session", "message")
        entity: &'static str,
        /// Identifier that collided
        id: String,
    },

    /// Underlying storage failure (I/O, corruption, transaction failure)
    #[error("Storage error: {context}: {source}")]
    Storage {
        /// Operation that failed
        context: String,
        /// Underlying cause
        #[source]
        source: BoxedSource,
    },

    /// Sink write failure or template rendering failure
    #[error("Export error: {message}")]
    Export {
        /// What went wrong
        message: String,
        /// Underlying cause, if any
        #[source]
        source: Option<BoxedSource>,
    },

    /// Operation aborted because its context was cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Operation aborted because its context deadline elapsed
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ChatvaultError {
    /// Build a storage error that wraps its cause
    pub fn storage<E>(context: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxedSource>,
    {
        Self::Storage {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Build an export error with an underlying cause
    pub fn export<E>(message: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxedSource>,
    {
        Self::Export {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Build an export error without an underlying cause
    pub fn export_msg(message: impl Into<String>) -> Self {
        Self::Export {
            message: message.into(),
            source: None,
        }
    }

    /// Shorthand for a missing session
    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "session",
            id: id.into(),
        }
    }

    /// Shorthand for a missing message
    pub fn message_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "message",
            id: id.into(),
        }
    }

    /// Whether the error came from context cancellation or an elapsed deadline
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_) | Self::DeadlineExceeded(_))
    }

    /// Whether the error should be shown to the user verbatim
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::NotFound { .. } | Self::Conflict { .. } | Self::Config(_)
        )
    }
}

/// Result type alias for Chatvault library operations
pub type Result<T> = std::result::Result<T, ChatvaultError>;
