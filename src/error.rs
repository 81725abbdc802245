//! Error types for pypool.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use utoipa::ToSchema;

/// Main error type for pypool.
#[derive(Error, Debug)]
pub enum PyPoolError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Worker startup failed: {0}")]
    Startup(String),

    #[error("No worker became available within {}ms", waited.as_millis())]
    PoolExhausted { waited: Duration },

    #[error("Worker pool is shutting down")]
    ShuttingDown,

    #[error("Worker {worker_id} crashed: {reason}")]
    WorkerCrashed { worker_id: usize, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Execution timed out after {}ms", timeout.as_millis())]
    Timeout { timeout: Duration },

    #[error("Call to '{module}.{function}' is not permitted by the module policy")]
    PolicyDenied { module: String, function: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Interpreter provisioning failed: {0}")]
    Provision(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for pypool operations.
pub type Result<T> = std::result::Result<T, PyPoolError>;

/// Boundary-visible error discriminator.
///
/// `ExecutionError` is the only script-level kind; every other kind is a
/// transport or capacity failure that callers may want to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, ToSchema)]
pub enum ErrorKind {
    ExecutionError,
    ProtocolError,
    PoolExhausted,
    WorkerCrashed,
    Timeout,
    ConfigurationError,
    ShuttingDown,
    PolicyViolation,
    InvalidRequest,
    PayloadTooLarge,
}

impl ErrorKind {
    /// Every kind, in a fixed order usable as an array index.
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::ExecutionError,
        ErrorKind::ProtocolError,
        ErrorKind::PoolExhausted,
        ErrorKind::WorkerCrashed,
        ErrorKind::Timeout,
        ErrorKind::ConfigurationError,
        ErrorKind::ShuttingDown,
        ErrorKind::PolicyViolation,
        ErrorKind::InvalidRequest,
        ErrorKind::PayloadTooLarge,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExecutionError => "ExecutionError",
            Self::ProtocolError => "ProtocolError",
            Self::PoolExhausted => "PoolExhausted",
            Self::WorkerCrashed => "WorkerCrashed",
            Self::Timeout => "Timeout",
            Self::ConfigurationError => "ConfigurationError",
            Self::ShuttingDown => "ShuttingDown",
            Self::PolicyViolation => "PolicyViolation",
            Self::InvalidRequest => "InvalidRequest",
            Self::PayloadTooLarge => "PayloadTooLarge",
        }
    }

    /// True when the failure happened outside the script itself.
    pub fn is_transport(self) -> bool {
        !matches!(self, Self::ExecutionError)
    }

    /// True when resubmitting the same request later may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::PoolExhausted | Self::WorkerCrashed | Self::Timeout | Self::ProtocolError
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PyPoolError {
    /// Map this error onto the boundary taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::Provision(_) | Self::ChecksumMismatch { .. } => {
                ErrorKind::ConfigurationError
            }
            Self::Startup(_) | Self::WorkerCrashed { .. } | Self::Io(_) => ErrorKind::WorkerCrashed,
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::ShuttingDown => ErrorKind::ShuttingDown,
            Self::Protocol(_) | Self::Json(_) => ErrorKind::ProtocolError,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::PolicyDenied { .. } => ErrorKind::PolicyViolation,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            Self::Network(_) => ErrorKind::ConfigurationError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_pool_exhausted_message() {
        let err = PyPoolError::PoolExhausted {
            waited: Duration::from_millis(250),
        };
        let msg = err.to_string();
        assert!(msg.contains("250ms"));
        assert_eq!(err.kind(), ErrorKind::PoolExhausted);
    }

    #[test]
    fn test_worker_crashed_message() {
        let err = PyPoolError::WorkerCrashed {
            worker_id: 2,
            reason: "killed by signal SIGKILL".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Worker 2"));
        assert!(msg.contains("SIGKILL"));
        assert_eq!(err.kind(), ErrorKind::WorkerCrashed);
    }

    #[test]
    fn test_policy_denied_message() {
        let err = PyPoolError::PolicyDenied {
            module: "os".to_string(),
            function: "system".to_string(),
        };
        assert!(err.to_string().contains("os.system"));
        assert_eq!(err.kind(), ErrorKind::PolicyViolation);
    }

    #[test]
    fn test_timeout_message() {
        let err = PyPoolError::Timeout {
            timeout: Duration::from_secs(2),
        };
        assert!(err.to_string().contains("2000ms"));
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let err: PyPoolError = io_err.into();
        assert!(err.to_string().contains("pipe closed"));
    }

    #[test]
    fn test_json_error_is_protocol_kind() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
        let err: PyPoolError = json_err.into();
        assert!(err.to_string().contains("JSON"));
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }

    #[test]
    fn test_configuration_errors_share_kind() {
        assert_eq!(
            PyPoolError::Configuration("no python".into()).kind(),
            ErrorKind::ConfigurationError
        );
        assert_eq!(
            PyPoolError::Provision("download failed".into()).kind(),
            ErrorKind::ConfigurationError
        );
    }

    #[test]
    fn test_only_execution_error_is_script_level() {
        for kind in ErrorKind::ALL {
            assert_eq!(kind.is_transport(), kind != ErrorKind::ExecutionError);
        }
    }

    #[test]
    fn test_error_kind_index_matches_position() {
        for (i, kind) in ErrorKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn test_error_kind_serializes_as_name() {
        let json = serde_json::to_string(&ErrorKind::ExecutionError).unwrap();
        assert_eq!(json, "\"ExecutionError\"");
    }
}
