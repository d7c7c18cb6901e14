//! Error handling for the FaceFilter Live pipeline
//!
//! This module defines the crate-wide error type and a Result alias.
//! Resource exhaustion (full arena, full connection) is deliberately not
//! represented here: those are retry conditions reported through
//! [`crate::backend::HeapError`] or plain `bool` checks.

use thiserror::Error;

/// Main error type for FaceFilter Live operations
#[derive(Error, Debug)]
pub enum LiveError {
    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to the persisted state database
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A stage failed to start or run
    #[error("Stage '{stage}' error: {message}")]
    Stage { stage: String, message: String },

    /// Errors related to control sheet declarations or requests
    #[error("Control sheet error: {0}")]
    Sheet(#[from] crate::control::SheetError),

    /// Errors related to the shared frame heap
    #[error("Heap error: {0}")]
    Heap(#[from] crate::backend::HeapError),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<LiveError>,
    },
}

impl LiveError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        LiveError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a stage error
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        LiveError::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for LiveError {
    fn from(err: serde_json::Error) -> Self {
        LiveError::Serialization(err.to_string())
    }
}

/// Result type alias for FaceFilter Live operations
pub type Result<T> = std::result::Result<T, LiveError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
