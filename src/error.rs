//! Error handling for GHG pre-processing operations.
//!
//! Provides error types with context for archive parsing, inventory
//! building, configuration validation and table persistence failures.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GhgError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Configuration file error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid regular expression: {0}")]
    Regex(#[from] regex::Error),

    #[error("Invalid field pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Directory traversal error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Timestamp '{value}' does not match format '{format}'")]
    TimestampFormat { value: String, format: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("No source files found{context}")]
    NoSourceFiles { context: String },

    #[error("Invalid archive: {path} - {reason}")]
    InvalidArchive { path: PathBuf, reason: String },

    #[error("Missing metadata section [{section}] in {path}")]
    MissingSection { path: PathBuf, section: String },

    #[error("Delimiter error in {path}: {reason}")]
    Delimiter { path: PathBuf, reason: String },

    #[error("Invalid threshold expression '{expression}': {reason}")]
    InvalidThreshold { expression: String, reason: String },

    #[error("Malformed table {path}: {reason}")]
    MalformedTable { path: PathBuf, reason: String },

    #[error("Processing failed for file: {path} - {reason}")]
    ProcessingFailed { path: PathBuf, reason: String },
}

impl GhgError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid archive error
    pub fn invalid_archive(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidArchive {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GhgError>;
