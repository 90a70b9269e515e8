//! Error types for the schema cache

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the schema cache
///
/// Lookups never return these: a cache failure degrades to a miss. They
/// surface from configuration loading, disk tier setup, origin fetches and
/// the command-line front end.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("Failed to parse YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persisted cache document has an unexpected shape
    #[error("Malformed cache document at {location}: {reason}")]
    MalformedDocument { location: String, reason: String },

    /// No per-user configuration directory could be determined
    #[error("No per-user configuration directory available")]
    ConfigDirUnavailable,

    /// Disk tier could not be prepared at the given path
    #[error("Disk tier unavailable at {path}: {reason}")]
    DiskUnavailable { path: PathBuf, reason: String },

    /// Origin fetch failed
    #[error("Origin fetch failed for project {project_id}: {reason}")]
    Origin { project_id: String, reason: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
