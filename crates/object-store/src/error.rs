//! Errors reported by backend implementations.

/// Result alias for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Backend failure, classified by category rather than by status code.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("object not found: {name}")]
    NotFound { name: String },

    /// Generation precondition did not hold, or the target is mid-stream
    #[error("precondition failed for {name}: {reason}")]
    PreconditionFailed { name: String, reason: String },

    #[error("permission denied: {name}")]
    PermissionDenied { name: String },

    /// Another writer holds the live stream for this object
    #[error("conflicting writer on {name}: {reason}")]
    Conflict { name: String, reason: String },

    /// Transport failure or server-side unavailability. Retryable.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("storage error: {0}")]
    Storage(#[from] object_store::Error),
}

impl BackendError {
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    pub fn precondition(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PreconditionFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn conflict(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Whether the backend-call layer may retry this error.
    ///
    /// Logical conflicts are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Unavailable(_) => true,
            BackendError::Storage(e) => matches!(e, object_store::Error::Generic { .. }),
            _ => false,
        }
    }

    /// Short stable label for metrics
    pub fn category(&self) -> &'static str {
        match self {
            BackendError::NotFound { .. } => "not_found",
            BackendError::PreconditionFailed { .. } => "precondition_failed",
            BackendError::PermissionDenied { .. } => "permission_denied",
            BackendError::Conflict { .. } => "conflict",
            BackendError::Unavailable(_) => "unavailable",
            BackendError::Protocol(_) => "protocol",
            BackendError::Storage(_) => "storage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BackendError::Unavailable("503".into()).is_transient());
        assert!(!BackendError::not_found("a").is_transient());
        assert!(!BackendError::precondition("a", "generation").is_transient());
        assert!(!BackendError::conflict("a", "stream").is_transient());
        assert!(!BackendError::Protocol("bad frame".into()).is_transient());
    }

    #[test]
    fn test_category_labels() {
        assert_eq!(BackendError::not_found("a").category(), "not_found");
        assert_eq!(
            BackendError::conflict("a", "stream").category(),
            "conflict"
        );
    }
}
