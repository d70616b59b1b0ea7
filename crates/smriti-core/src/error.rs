use thiserror::Error;

/// Failure reported by an external collaborator (recognition service,
/// object store, relational store, mailer).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("transient service failure: {0}")]
    Transient(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("call timed out: {0}")]
    Timeout(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ServiceError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Transient(_) | ServiceError::QuotaExceeded(_) | ServiceError::Timeout(_)
        )
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, ServiceError::QuotaExceeded(_))
    }
}
