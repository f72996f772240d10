//! Error types for the mirroring pipeline.
//!
//! Every stage reports through [`MirrorError`]. Per-file errors are rendered to strings when they
//! land in a [`DatasetTransferResult`](crate::orchestrator::DatasetTransferResult); dataset-level
//! errors (manifest, bucket access, configuration) are returned to the caller as-is.

use thiserror::Error;

use crate::multipart::SessionState;

#[derive(Debug, Error)]
pub enum MirrorError {
    // ========== Configuration ==========
    /// Invalid configuration value.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Config file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file could not be parsed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // ========== Retry ==========
    /// A retried operation failed on every attempt.
    #[error("{operation} failed after {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        last_error: Box<MirrorError>,
    },

    // ========== Manifest ==========
    #[error("Manifest for dataset {dataset_id} unavailable: {cause}")]
    ManifestUnavailable { dataset_id: String, cause: String },

    // ========== Relay ==========
    #[error("Failed to read source {location}: {reason}")]
    SourceRead { location: String, reason: String },

    #[error("Sink rejected chunk at byte offset {offset}: {source}")]
    SinkWrite {
        offset: u64,
        #[source]
        source: Box<MirrorError>,
    },

    // ========== Object store ==========
    /// Transport-level failure talking to the object store.
    #[error("Object store request failed: {message}")]
    Storage { message: String },

    #[error("Bucket {bucket} is not accessible: {reason}")]
    BucketUnavailable { bucket: String, reason: String },

    #[error("Failed to open multipart upload for {key}: {reason}")]
    SessionOpen { key: String, reason: String },

    #[error("Failed to upload part {part_number} of {key}: {reason}")]
    PartUpload {
        key: String,
        part_number: u32,
        reason: String,
    },

    #[error("Failed to complete multipart upload for {key}: {reason}")]
    Completion { key: String, reason: String },

    #[error("Cannot {operation} upload for {key} in state {state}")]
    InvalidSessionState {
        key: String,
        operation: &'static str,
        state: SessionState,
    },

    #[error("Part {actual} of {key} is out of order, expected part {expected}")]
    PartOutOfOrder {
        key: String,
        expected: u32,
        actual: u32,
    },

    // ========== Planning ==========
    /// Several distinct manifest paths map onto one destination key.
    #[error("Destination key {key} is claimed by several manifest paths: {}", .paths.join(", "))]
    DestinationConflict { key: String, paths: Vec<String> },

    // ========== Runtime ==========
    #[error("Transfer cancelled")]
    Cancelled,
}

impl MirrorError {
    pub fn config(message: impl Into<String>) -> Self {
        MirrorError::Config {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        MirrorError::Storage {
            message: message.into(),
        }
    }

    pub fn manifest(dataset_id: impl Into<String>, cause: impl Into<String>) -> Self {
        MirrorError::ManifestUnavailable {
            dataset_id: dataset_id.into(),
            cause: cause.into(),
        }
    }

    pub fn source_read(location: impl Into<String>, reason: impl Into<String>) -> Self {
        MirrorError::SourceRead {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if a retry of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MirrorError::ManifestUnavailable { .. }
                | MirrorError::Storage { .. }
                | MirrorError::PartUpload { .. }
        )
    }

    /// The innermost error, looking through retry and sink wrappers.
    pub fn root_cause(&self) -> &MirrorError {
        match self {
            MirrorError::RetriesExhausted { last_error, .. } => last_error.root_cause(),
            MirrorError::SinkWrite { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Result type alias for mirroring operations
pub type Result<T> = std::result::Result<T, MirrorError>;
