//! Error types for the build progress pipeline.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for build pipeline operations.
pub type Result<T> = std::result::Result<T, BuildError>;

/// Main error type for a build invocation.
///
/// Exactly one of these is the terminal outcome of a failed build.
#[derive(Error, Debug)]
pub enum BuildError {
    // Backend errors
    #[error("Malformed message from build backend: {reason}")]
    BackendProtocol { reason: String },

    #[error("Build failed: {message}")]
    BuildFailed { message: String },

    // Caller-driven termination
    #[error("progress callback failed")]
    CallbackFailed,

    #[error("Build cancelled")]
    Cancelled,

    // Broken invariants between the backend and this pipeline
    #[error("Internal contract violation: {reason}")]
    ContractViolation { reason: String },

    // Request and configuration errors
    #[error("Invalid image build request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Collaborator (transport) errors
    #[error("Daemon operation '{operation}' failed: {reason}")]
    Daemon { operation: String, reason: String },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Caller-facing classification of a [`BuildError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BackendProtocol,
    BackendReportedFailure,
    CallbackAbort,
    Cancelled,
    InternalContractViolation,
    Request,
    Transport,
}

impl ErrorKind {
    /// Label used for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BackendProtocol => "backend_protocol",
            ErrorKind::BackendReportedFailure => "build_failed",
            ErrorKind::CallbackAbort => "callback_abort",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InternalContractViolation => "contract_violation",
            ErrorKind::Request => "request",
            ErrorKind::Transport => "transport",
        }
    }
}

impl BuildError {
    /// Create a protocol error from anything displayable.
    pub fn protocol(reason: impl std::fmt::Display) -> Self {
        Self::BackendProtocol { reason: reason.to_string() }
    }

    /// Create a contract violation error.
    pub fn contract(reason: impl Into<String>) -> Self {
        Self::ContractViolation { reason: reason.into() }
    }

    /// Create a daemon (transport) error for the named operation.
    pub fn daemon(operation: &str, err: impl std::fmt::Display) -> Self {
        Self::Daemon { operation: operation.to_string(), reason: err.to_string() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::BackendProtocol { .. } => ErrorKind::BackendProtocol,
            BuildError::BuildFailed { .. } => ErrorKind::BackendReportedFailure,
            BuildError::CallbackFailed => ErrorKind::CallbackAbort,
            BuildError::Cancelled => ErrorKind::Cancelled,
            BuildError::ContractViolation { .. } => ErrorKind::InternalContractViolation,
            BuildError::InvalidRequest { .. } | BuildError::InvalidConfig { .. } => {
                ErrorKind::Request
            }
            BuildError::Daemon { .. } | BuildError::Io { .. } | BuildError::Other(_) => {
                ErrorKind::Transport
            }
        }
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(self, BuildError::ContractViolation { .. })
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(err: serde_json::Error) -> Self {
        Self::protocol(err)
    }
}
