//! Error kinds surfaced by the core.
//!
//! Every operation in this crate returns a `Result<T, VaultError>` instead
//! of throwing; transactions convert any bubbled error into a rollback
//! before returning it (see `db::pool::Pool::transaction`).

use std::fmt;
use std::time::SystemTimeError;

use thiserror::Error;

pub type VaultResult<T> = std::result::Result<T, VaultError>;

/// The error kinds surfaced across the core's public operations.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("insufficient space: {0}")]
    InsufficientSpace(String),

    #[error("authentication error: {0}")]
    AuthError(String),

    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("fatal I/O error: {0}")]
    FatalIo(String),

    #[error("sync conflict: {0}")]
    Conflict(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("metadata corruption: {0}")]
    Corrupt(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl VaultError {
    /// Maps an error kind to a POSIX errno for FUSE replies.
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            VaultError::NotFound(_) => libc::ENOENT,
            VaultError::AlreadyExists(_) => libc::EEXIST,
            VaultError::PermissionDenied(_) => libc::EACCES,
            VaultError::QuotaExceeded(_) => libc::EDQUOT,
            VaultError::InsufficientSpace(_) => libc::ENOSPC,
            VaultError::AuthError(_) => libc::EIO,
            VaultError::TransientIo(_) => libc::EIO,
            VaultError::FatalIo(_) => libc::EIO,
            VaultError::Conflict(_) => libc::EIO,
            VaultError::Cancelled => libc::EINTR,
            VaultError::Corrupt(_) => libc::EIO,
            VaultError::Busy(_) => libc::EBUSY,
            VaultError::InvalidArgument(_) => libc::EINVAL,
        }
    }

    /// A stable, lowercase programmatic identifier, used as
    /// `SyncEvent.error_code`.
    pub fn code(&self) -> &'static str {
        match self {
            VaultError::NotFound(_) => "not_found",
            VaultError::AlreadyExists(_) => "already_exists",
            VaultError::PermissionDenied(_) => "permission_denied",
            VaultError::QuotaExceeded(_) => "quota_exceeded",
            VaultError::InsufficientSpace(_) => "insufficient_space",
            VaultError::AuthError(_) => "auth_error",
            VaultError::TransientIo(_) => "transient_io",
            VaultError::FatalIo(_) => "fatal_io",
            VaultError::Conflict(_) => "conflict",
            VaultError::Cancelled => "cancelled",
            VaultError::Corrupt(_) => "corrupt",
            VaultError::Busy(_) => "busy",
            VaultError::InvalidArgument(_) => "invalid_argument",
        }
    }

    /// Whether this error category should be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, VaultError::TransientIo(_) | VaultError::Busy(_))
    }
}

impl From<rusqlite::Error> for VaultError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => VaultError::NotFound(err.to_string()),
            other => VaultError::Corrupt(other.to_string()),
        }
    }
}

impl From<r2d2::Error> for VaultError {
    fn from(err: r2d2::Error) -> Self {
        VaultError::Busy(err.to_string())
    }
}

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => VaultError::NotFound(err.to_string()),
            AlreadyExists => VaultError::AlreadyExists(err.to_string()),
            PermissionDenied => VaultError::PermissionDenied(err.to_string()),
            WouldBlock | Interrupted | TimedOut => VaultError::TransientIo(err.to_string()),
            _ => VaultError::FatalIo(err.to_string()),
        }
    }
}

impl From<SystemTimeError> for VaultError {
    fn from(err: SystemTimeError) -> Self {
        VaultError::Corrupt(err.to_string())
    }
}

impl From<reqwest::Error> for VaultError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            VaultError::TransientIo(err.to_string())
        } else {
            VaultError::FatalIo(err.to_string())
        }
    }
}

impl From<aes_gcm::Error> for VaultError {
    fn from(_: aes_gcm::Error) -> Self {
        VaultError::AuthError("AEAD tag verification failed".to_string())
    }
}

/// A compact, serializable subset of `VaultError`, mirroring the
/// teacher's `CompressedError` (for wire transport across process/thread
/// boundaries where a full error chain is unnecessary).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CompressedError {
    pub code: String,
    pub message: String,
}

impl fmt::Display for CompressedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<&VaultError> for CompressedError {
    fn from(err: &VaultError) -> Self {
        CompressedError {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}
