//! Error taxonomy for topology building and rollout supervision

use serde::Serialize;
use std::path::PathBuf;

/// Stable error codes, one per failure class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed or missing topology, manifest, or settings input
    ConfigError,
    /// Overlapping or ambiguous port assignment
    AllocationError,
    /// Teardown, configure, or start of a deploy target failed
    BringUpError,
    /// The readiness wait ceiling was exceeded
    ReadinessTimeoutError,
    /// An HTTP liveness probe failed
    LivenessCheckError,
}

impl ErrorCode {
    /// Get the error code as a string for logs and reports
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigError => "CONFIG_ERROR",
            ErrorCode::AllocationError => "ALLOCATION_ERROR",
            ErrorCode::BringUpError => "BRING_UP_ERROR",
            ErrorCode::ReadinessTimeoutError => "READINESS_TIMEOUT_ERROR",
            ErrorCode::LivenessCheckError => "LIVENESS_CHECK_ERROR",
        }
    }

    /// Whether a failure of this class feeds the retry batch
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCode::ConfigError)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("port allocation conflict: {0}")]
    Allocation(String),

    #[error("bring-up of '{deploy_id}' failed during {phase}: {message}")]
    BringUp {
        deploy_id: String,
        phase: &'static str,
        message: String,
    },

    #[error("'{deploy_id}' was not ready after {waited_secs}s")]
    ReadinessTimeout { deploy_id: String, waited_secs: u64 },

    #[error("liveness check of {url} failed: {reason}")]
    Liveness { url: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Config(_) | Error::Read { .. } | Error::Parse { .. } => ErrorCode::ConfigError,
            Error::Allocation(_) => ErrorCode::AllocationError,
            Error::BringUp { .. } | Error::Io(_) => ErrorCode::BringUpError,
            Error::ReadinessTimeout { .. } => ErrorCode::ReadinessTimeoutError,
            Error::Liveness { .. } => ErrorCode::LivenessCheckError,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
