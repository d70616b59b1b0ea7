use smriti_core::{Attempted, ServiceError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("passkey does not match any active tenant")]
    InvalidPasskey,
    #[error("no face detected in the probe image")]
    NoFaceInProbe,
    /// Internal invariant broken: a lookup resolved outside the caller's
    /// tenant. Never retried.
    #[error("tenant isolation violation: {0}")]
    TenantIsolationViolation(String),
    #[error("{op} failed after {attempts} attempts: {source}")]
    FailedPermanently {
        op: String,
        attempts: u32,
        source: ServiceError,
    },
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("session expired")]
    SessionExpired,
    #[error("command not allowed in session state {0}")]
    SessionState(&'static str),
    #[error("archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("archive i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Map a failed retried call: spent retries become `FailedPermanently`,
    /// anything else surfaces as the collaborator error itself.
    pub fn from_attempt(op: &str, attempted: Attempted) -> Self {
        if attempted.exhausted() {
            PipelineError::FailedPermanently {
                op: op.to_string(),
                attempts: attempted.attempts,
                source: attempted.error,
            }
        } else {
            PipelineError::Service(attempted.error)
        }
    }

    /// Message suitable for showing to a guest or organizer.
    pub fn user_message(&self) -> &'static str {
        match self {
            PipelineError::InvalidPasskey => "That passkey was not recognised.",
            PipelineError::NoFaceInProbe => {
                "We couldn't read a face in your photo, try again with better lighting."
            }
            PipelineError::SessionExpired => "Your session has expired, please sign in again.",
            _ => "Something went wrong, please try again later.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_attempt_exhausted() {
        let err = PipelineError::from_attempt(
            "index_faces",
            Attempted {
                attempts: 5,
                error: ServiceError::Transient("503".into()),
            },
        );
        assert!(matches!(
            err,
            PipelineError::FailedPermanently { attempts: 5, .. }
        ));
    }

    #[test]
    fn test_from_attempt_fatal() {
        let err = PipelineError::from_attempt(
            "index_faces",
            Attempted {
                attempts: 1,
                error: ServiceError::NotFound("collection".into()),
            },
        );
        assert!(matches!(
            err,
            PipelineError::Service(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn test_user_messages_distinct() {
        assert_ne!(
            PipelineError::NoFaceInProbe.user_message(),
            PipelineError::InvalidPasskey.user_message()
        );
    }
}
