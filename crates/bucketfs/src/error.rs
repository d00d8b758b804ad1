//! Filesystem errors and the backend error mapper.
//!
//! Every backend failure reaches the caller through [`FsError::from`] (or
//! [`FsError::from_handle`] on a pinned handle), so the taxonomy seen by the
//! kernel stays closed: no-such-entry, stale-handle, access-denied, I/O.

use backend::BackendError;
use thiserror::Error;
use tracing::debug;

pub type Result<T> = std::result::Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such entry: {0}")]
    NotFound(String),

    /// The handle's pinned generation was superseded or deleted
    #[error("stale handle: {0}")]
    Stale(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("entry exists: {0}")]
    Exists(String),

    #[error("is a directory: {0}")]
    IsDir(String),

    #[error("not a directory: {0}")]
    NotDir(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("file too large: {0}")]
    FileTooLarge(String),

    #[error("file not open: {0}")]
    BadHandle(u64),

    #[error("read-only filesystem")]
    ReadOnly,

    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl FsError {
    /// Map an error seen through a file handle. A vanished object there means
    /// the pinned generation is gone, which is a stale handle rather than a
    /// missing entry.
    pub fn from_handle(e: BackendError) -> Self {
        match e {
            BackendError::NotFound { name } => FsError::Stale(name),
            other => other.into(),
        }
    }

    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::Stale(_) => libc::ESTALE,
            FsError::AccessDenied(_) => libc::EACCES,
            FsError::Io(_) => libc::EIO,
            FsError::Exists(_) => libc::EEXIST,
            FsError::IsDir(_) => libc::EISDIR,
            FsError::NotDir(_) => libc::ENOTDIR,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::FileTooLarge(_) => libc::EFBIG,
            FsError::BadHandle(_) => libc::EBADF,
            FsError::ReadOnly => libc::EROFS,
            FsError::Unsupported(_) => libc::ENOTSUP,
        }
    }

    /// Stable label for the metrics error category
    pub fn category(&self) -> &'static str {
        match self {
            FsError::NotFound(_) => "not_found",
            FsError::Stale(_) => "stale_handle",
            FsError::AccessDenied(_) => "access_denied",
            FsError::Io(_) => "io_error",
            FsError::Exists(_) => "exists",
            FsError::IsDir(_) => "is_dir",
            FsError::NotDir(_) => "not_dir",
            FsError::NotEmpty(_) => "not_empty",
            FsError::InvalidArgument(_) => "invalid_argument",
            FsError::FileTooLarge(_) => "file_too_large",
            FsError::BadHandle(_) => "bad_handle",
            FsError::ReadOnly => "read_only",
            FsError::Unsupported(_) => "unsupported",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }
}

impl From<BackendError> for FsError {
    fn from(e: BackendError) -> Self {
        let mapped = match &e {
            BackendError::NotFound { name } => FsError::NotFound(name.clone()),
            BackendError::PreconditionFailed { .. } => FsError::Stale(e.to_string()),
            BackendError::PermissionDenied { name } => FsError::AccessDenied(name.clone()),
            // Dual-writer conflicts, transport and protocol failures
            BackendError::Conflict { .. }
            | BackendError::Unavailable(_)
            | BackendError::Protocol(_)
            | BackendError::Storage(_) => FsError::Io(e.to_string()),
        };
        debug!(backend = e.category(), fs = mapped.category(), error = %e, "mapped backend error");
        mapped
    }
}

impl From<FsError> for i32 {
    fn from(e: FsError) -> Self {
        e.errno()
    }
}
