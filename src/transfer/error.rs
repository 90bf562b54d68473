//! Transfer Error Types
//!
//! Every failure a door can observe while moving a file: replies from the
//! namespace, the pool manager and the pools, plus local precondition
//! violations. Errors are `Clone` because a terminal error recorded on a
//! transfer is re-raised to every task waiting on it.

use thiserror::Error;

/// Transfer error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    // === Remote timeouts ===
    /// The request expired; the remote side may or may not have acted on it.
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("No route to {0}")]
    NoRoute(String),

    // === Transient placement failures ===
    #[error("File attributes are out of date: {0}")]
    OutOfDate(String),

    #[error("Pool is disabled: {0}")]
    PoolDisabled(String),

    #[error("File not in repository: {0}")]
    FileNotInRepository(String),

    // === Conflicts ===
    #[error("File already in cache: {0}")]
    FileInCache(String),

    #[error("File exists: {0}")]
    FileExists(String),

    // === Permission ===
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    // === Non-retryable request errors ===
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("File is new (upload incomplete)")]
    FileIsNew,

    #[error("Not a regular file")]
    NotFile,

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("No pool configured: {0}")]
    NoPoolConfigured(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    // === Retryable pool-side failures ===
    #[error("No pool online: {0}")]
    NoPoolOnline(String),

    #[error("Pool unavailable: {0}")]
    PoolUnavailable(String),

    #[error("Mover failed [rc={rc}]: {message}")]
    MoverFailed { rc: i32, message: String },

    #[error("Unexpected system error: {0}")]
    Unexpected(String),
}

/// How the retry loop treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Request deadline exceeded; remote side effect unknown.
    Timeout,
    /// Infrastructure noise. Retried without consuming the retry budget.
    TransientPlacement,
    /// Business-rule conflict. Never retried.
    Conflict,
    /// Authorization failure. Never retried.
    Permission,
    /// Malformed or impossible request. Never retried.
    Fatal,
    /// Anything else. Retried while the policy allows.
    Retryable,
}

impl TransferError {
    /// Get the error code for logs and monitoring
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::Timeout(_) => "TIMEOUT",
            TransferError::NoRoute(_) => "NO_ROUTE",
            TransferError::OutOfDate(_) => "OUT_OF_DATE",
            TransferError::PoolDisabled(_) => "POOL_DISABLED",
            TransferError::FileNotInRepository(_) => "FILE_NOT_IN_REPOSITORY",
            TransferError::FileInCache(_) => "FILE_IN_CACHE",
            TransferError::FileExists(_) => "FILE_EXISTS",
            TransferError::PermissionDenied(_) => "PERMISSION_DENIED",
            TransferError::FileNotFound(_) => "FILE_NOT_FOUND",
            TransferError::FileIsNew => "FILE_IS_NEW",
            TransferError::NotFile => "NOT_FILE",
            TransferError::InvalidArgs(_) => "INVALID_ARGS",
            TransferError::NoPoolConfigured(_) => "NO_POOL_CONFIGURED",
            TransferError::IllegalState(_) => "ILLEGAL_STATE",
            TransferError::NoPoolOnline(_) => "NO_POOL_ONLINE",
            TransferError::PoolUnavailable(_) => "POOL_UNAVAILABLE",
            TransferError::MoverFailed { .. } => "MOVER_FAILED",
            TransferError::Unexpected(_) => "UNEXPECTED",
        }
    }

    /// Numeric result code reported to billing. Zero is success and is
    /// never produced by an error.
    pub fn rc(&self) -> i32 {
        match self {
            TransferError::Timeout(_) | TransferError::NoRoute(_) => 10006,
            TransferError::OutOfDate(_) => 10013,
            TransferError::PoolDisabled(_) => 104,
            TransferError::FileNotInRepository(_) => 10019,
            TransferError::FileInCache(_) => 10015,
            TransferError::FileExists(_) => 10004,
            TransferError::PermissionDenied(_) => 10018,
            TransferError::FileNotFound(_) => 10001,
            TransferError::FileIsNew => 10021,
            TransferError::NotFile => 10010,
            TransferError::InvalidArgs(_) => 10007,
            TransferError::NoPoolConfigured(_) => 10012,
            TransferError::IllegalState(_) => 10011,
            TransferError::NoPoolOnline(_) => 10014,
            TransferError::PoolUnavailable(_) => 10017,
            TransferError::MoverFailed { rc, .. } if *rc != 0 => *rc,
            TransferError::MoverFailed { .. } | TransferError::Unexpected(_) => 666,
        }
    }

    /// Classify for the retry loop
    pub fn class(&self) -> ErrorClass {
        match self {
            TransferError::Timeout(_) | TransferError::NoRoute(_) => ErrorClass::Timeout,
            TransferError::OutOfDate(_)
            | TransferError::PoolDisabled(_)
            | TransferError::FileNotInRepository(_) => ErrorClass::TransientPlacement,
            TransferError::FileInCache(_) | TransferError::FileExists(_) => ErrorClass::Conflict,
            TransferError::PermissionDenied(_) => ErrorClass::Permission,
            TransferError::FileNotFound(_)
            | TransferError::FileIsNew
            | TransferError::NotFile
            | TransferError::InvalidArgs(_)
            | TransferError::NoPoolConfigured(_)
            | TransferError::IllegalState(_) => ErrorClass::Fatal,
            TransferError::NoPoolOnline(_)
            | TransferError::PoolUnavailable(_)
            | TransferError::MoverFailed { .. }
            | TransferError::Unexpected(_) => ErrorClass::Retryable,
        }
    }

    /// Whether this error is the remote-timeout class.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        self.class() == ErrorClass::Timeout
    }
}

impl From<anyhow::Error> for TransferError {
    fn from(e: anyhow::Error) -> Self {
        TransferError::Unexpected(e.to_string())
    }
}
