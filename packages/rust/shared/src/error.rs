//! Error types for Loreforge.
//!
//! Library crates use [`LoreforgeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Only unrecoverable conditions travel through this type. Per-page and
//! per-candidate failures are modelled as skip/reject values by the stages.

use std::path::PathBuf;

/// Top-level error type for all Loreforge operations.
#[derive(Debug, thiserror::Error)]
pub enum LoreforgeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to the wiki API.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed input (JSON line, API payload, rule file).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Canonical store, append log, or run registry failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (schema mismatch, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LoreforgeError>;

impl LoreforgeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for failures of the canonical store or its logs, which abort a merge run.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io { .. })
    }
}
