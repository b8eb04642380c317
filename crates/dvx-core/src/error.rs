//! Error types for DVX data tracking and experiments

use thiserror::Error;

/// Result type alias using the DVX Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type shared by all DVX crates
#[derive(Error, Debug)]
pub enum Error {
    // Repository errors
    #[error("Not a DVX repository (or any parent up to {path})")]
    NotInitialized { path: String },

    #[error("DVX repository already initialized at {path}")]
    AlreadyInitialized { path: String },

    #[error("Invalid target {target}: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("Target is not tracked: {target}")]
    NotTracked { target: String },

    // Object cache errors
    #[error("Object not found in cache: {hash}")]
    ObjectNotFound { hash: String },

    #[error("Object corrupted: {hash} (content hashes to {actual})")]
    ObjectCorrupted { hash: String, actual: String },

    #[error("Invalid content hash: {value}")]
    InvalidHash { value: String },

    // Location and remote errors
    #[error("Invalid location {location}: {reason}")]
    InvalidLocation { location: String, reason: String },

    #[error("Remote not found: {name}")]
    RemoteNotFound { name: String },

    #[error("No default remote configured")]
    NoDefaultRemote,

    #[error("No external cache configured for scheme '{scheme}'")]
    ExternalCacheNotConfigured { scheme: String },

    // Pipeline errors
    #[error("Stage not found: {stage}")]
    StageNotFound { stage: String },

    #[error("Invalid pipeline: {message}")]
    InvalidPipeline { message: String },

    #[error("Command failed with exit code {code:?}: {cmd}")]
    CommandFailed { cmd: String, code: Option<i32> },

    // Checkpoint and experiment errors
    #[error("Checkpoint not found: {checkpoint_id}")]
    CheckpointNotFound { checkpoint_id: String },

    #[error("Checkpoint prefix is ambiguous: {prefix} ({count} matches)")]
    AmbiguousCheckpoint { prefix: String, count: usize },

    #[error("Checkpoint write failed: {message}")]
    CheckpointWriteFailed { message: String },

    #[error("Checkpoint corrupted: {checkpoint_id} - {reason}")]
    CheckpointCorrupted { checkpoint_id: String, reason: String },

    #[error("Checkpoint step must increase: tip is at {tip}, got {step}")]
    NonMonotonicStep { tip: u64, step: u64 },

    #[error("Experiment not found: {name}")]
    ExperimentNotFound { name: String },

    #[error("Experiment already exists: {name}")]
    ExperimentExists { name: String },

    #[error("Invalid reference name: {name}")]
    InvalidRefName { name: String },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage backend not available: {backend}")]
    StorageUnavailable { backend: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    // Timeout errors
    #[error("Operation timeout: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    // Channel errors
    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },
}

impl Error {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Storage { .. } | Error::Timeout { .. } | Error::ChannelClosed { .. }
        )
    }

    /// Returns true if this error indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CheckpointCorrupted { .. }
                | Error::ObjectCorrupted { .. }
                | Error::InvalidConfig { .. }
                | Error::Internal { .. }
        )
    }

    /// Returns a retry delay hint in milliseconds, if applicable
    pub fn retry_delay_hint_ms(&self) -> Option<u64> {
        match self {
            Error::Storage { .. } => Some(100),
            Error::Timeout { .. } => Some(1000),
            Error::ChannelClosed { .. } => Some(50),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let err = Error::Storage {
            message: "connection reset".to_string(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.retry_delay_hint_ms(), Some(100));

        let err = Error::ObjectCorrupted {
            hash: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.retry_delay_hint_ms().is_none());
    }

    #[test]
    fn test_error_fatal() {
        let err = Error::InvalidConfig {
            message: "external cache shares the default remote".to_string(),
        };
        assert!(err.is_fatal());

        let err = Error::StoragePathNotFound {
            path: "ab/cdef".to_string(),
        };
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_yaml_error_maps_to_serialization() {
        let parsed: std::result::Result<Vec<u32>, _> = serde_yaml::from_str("{not: [a list");
        let err: Error = parsed.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
