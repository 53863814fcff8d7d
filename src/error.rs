//! Error types for stemsplit.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SeparationError {
    // Client input errors
    #[error("Unsupported format: {message}")]
    UnsupportedFormat { message: String },

    #[error("Corrupt input: {message}")]
    CorruptInput { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Payload too large: {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("Input too long: {duration_secs:.1}s exceeds the {limit_secs}s limit")]
    InputTooLong { duration_secs: f64, limit_secs: u64 },

    // Engine errors
    #[error("Separation model unavailable: {message}")]
    ModelUnavailable { message: String },

    #[error("Separation failed: {message}")]
    SeparationFailure { message: String },

    // Scheduling errors
    #[error("Service overloaded: {message}")]
    Overloaded { message: String },

    #[error("Job exceeded the {limit_secs}s time limit")]
    Timeout { limit_secs: u64 },

    #[error("Job cancelled")]
    Cancelled,

    // Cache errors
    #[error("Cache entry {fingerprint} is corrupt: {message}")]
    CacheCorrupt { fingerprint: String, message: String },

    // Configuration errors
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl SeparationError {
    /// Stable machine-readable identifier, used in HTTP payloads and logs.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            Self::CorruptInput { .. } => ErrorKind::CorruptInput,
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            Self::InputTooLong { .. } => ErrorKind::InputTooLong,
            Self::ModelUnavailable { .. } => ErrorKind::ModelUnavailable,
            Self::SeparationFailure { .. } => ErrorKind::SeparationFailure,
            Self::Overloaded { .. } => ErrorKind::Overloaded,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::CacheCorrupt { .. } | Self::Io(_) | Self::Other(_) => ErrorKind::Internal,
            Self::ConfigParse { .. } | Self::ConfigInvalidValue { .. } | Self::Config(_) => {
                ErrorKind::Config
            }
        }
    }

    /// True when the caller sent something we cannot process. Never retried.
    pub fn is_client_error(&self) -> bool {
        self.kind().is_client_error()
    }

    /// Snapshot suitable for fanning out to every waiter of a job.
    pub fn to_job_error(&self) -> JobError {
        JobError {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Coarse error classification shared by the job record and the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedFormat,
    CorruptInput,
    InvalidRequest,
    PayloadTooLarge,
    InputTooLong,
    ModelUnavailable,
    SeparationFailure,
    Overloaded,
    Timeout,
    Cancelled,
    Config,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnsupportedFormat => "unsupported_format",
            Self::CorruptInput => "corrupt_input",
            Self::InvalidRequest => "invalid_request",
            Self::PayloadTooLarge => "payload_too_large",
            Self::InputTooLong => "input_too_long",
            Self::ModelUnavailable => "model_unavailable",
            Self::SeparationFailure => "separation_failure",
            Self::Overloaded => "overloaded",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Config => "config",
            Self::Internal => "internal",
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedFormat
                | Self::CorruptInput
                | Self::InvalidRequest
                | Self::PayloadTooLarge
                | Self::InputTooLong
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A terminal job failure, retained on the job and surfaced to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

pub type Result<T> = std::result::Result<T, SeparationError>;
