//! Error types and handling
//!
//! This module provides the error taxonomy shared by the engine, the CLI and
//! the HTTP transport. Every error implements [`RagtimeErrorExt`], which adds a
//! user-facing hint, a recoverability flag and the HTTP status the transport
//! answers with.
//!
//! # Security
//!
//! Messages never carry API keys. Storage errors deliberately carry the
//! attempted path so operators can find the offending file.

use std::path::PathBuf;
use thiserror::Error;

/// Trait for Ragtime error extensions
pub trait RagtimeErrorExt {
    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be fixed by changing the request and retrying.
    fn is_recoverable(&self) -> bool;

    /// HTTP status code the transport layer reports for this error
    fn status_code(&self) -> u16;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Configuration**: missing or invalid request/config fields (400)
/// - **Duplicate name**: an experiment with this name already exists (400)
/// - **Not found**: unknown experiment or validation set (404)
/// - **Stage execution**: a pipeline stage failed (500)
/// - **Storage**: reading or writing a document failed (500)
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, RagtimeErrorExt};
///
/// let error = EngineError::DuplicateName("T1".to_string());
/// assert_eq!(error.status_code(), 400);
/// assert!(error.is_recoverable());
///
/// let stage = EngineError::StageExecution {
///     stage: "answers".to_string(),
///     message: "provider down".to_string(),
/// };
/// assert_eq!(stage.status_code(), 500);
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("An experiment with this name already exists: {0}")]
    DuplicateName(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // Pipeline errors
    #[error("Stage '{stage}' failed: {message}")]
    StageExecution { stage: String, message: String },

    // Capability errors
    #[error("LLM provider error: {0}")]
    LLMProvider(String),

    #[error("Retriever error: {0}")]
    Retriever(String),

    // Persistence errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error at {path:?}: {message}")]
    Storage { path: PathBuf, message: String },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Build a storage error for `path`
    pub fn storage(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Build a stage failure
    pub fn stage(stage: impl Into<String>, message: impl ToString) -> Self {
        Self::StageExecution {
            stage: stage.into(),
            message: message.to_string(),
        }
    }
}

impl RagtimeErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check the request fields or your config.toml",
            Self::DuplicateName(_) => "Choose another experiment name",
            Self::NotFound(_) => "Check the name; it may have been deleted",
            Self::StageExecution { .. } => "A pipeline stage failed. Check the server logs",
            Self::LLMProvider(_) => "LLM provider unavailable. Check your API keys and network",
            Self::Retriever(_) => "Retriever unavailable. Check its configuration",
            Self::Database(_) => "Database operation failed",
            Self::Storage { .. } => "Reading or writing a result file failed",
            Self::Network(_) => "Network operation failed. Check your connection",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Database(_) | Self::Storage { .. } | Self::Io(_) => false,
            _ => true,
        }
    }

    fn status_code(&self) -> u16 {
        match self {
            Self::Config(_) | Self::DuplicateName(_) => 400,
            Self::NotFound(_) => 404,
            _ => 500,
        }
    }
}
