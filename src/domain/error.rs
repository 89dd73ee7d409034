//! Error taxonomy for queue operations

use crate::domain::token::TokenState;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Broad classification of a [`QueueError`], used by the wire layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    StateConflict,
    Precondition,
    Concurrency,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::StateConflict => "state_conflict",
            ErrorKind::Precondition => "precondition",
            ErrorKind::Concurrency => "concurrency",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueueError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("service not found")]
    ServiceNotFound,

    #[error("token not found")]
    TokenNotFound,

    #[error("counter not found")]
    CounterNotFound,

    #[error("service is closed")]
    ServiceClosed,

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: TokenState, to: TokenState },

    #[error("a verification attempt for this token is already in flight")]
    AlreadyVerifying,

    #[error("user already has an active token")]
    DuplicateActiveToken,

    #[error("counter is currently busy")]
    CounterOccupied,

    #[error("proof does not match this token")]
    InvalidProof,

    #[error("lost a race for a shared resource: {0}")]
    Concurrency(String),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Validation(_) => ErrorKind::Validation,
            QueueError::ServiceNotFound
            | QueueError::TokenNotFound
            | QueueError::CounterNotFound => ErrorKind::NotFound,
            QueueError::InvalidTransition { .. }
            | QueueError::AlreadyVerifying
            | QueueError::DuplicateActiveToken
            | QueueError::CounterOccupied => ErrorKind::StateConflict,
            QueueError::ServiceClosed | QueueError::InvalidProof => ErrorKind::Precondition,
            QueueError::Concurrency(_) => ErrorKind::Concurrency,
        }
    }

    /// The state the conflicting token is currently in, when known
    pub fn current_state(&self) -> Option<TokenState> {
        match self {
            QueueError::InvalidTransition { from, .. } => Some(*from),
            QueueError::AlreadyVerifying => Some(TokenState::Confirming),
            _ => None,
        }
    }

    /// Whether the caller can safely retry the whole operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Concurrency(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(QueueError::ServiceNotFound.kind(), ErrorKind::NotFound);
        assert_eq!(QueueError::ServiceClosed.kind(), ErrorKind::Precondition);
        assert_eq!(QueueError::AlreadyVerifying.kind(), ErrorKind::StateConflict);
        assert_eq!(QueueError::Validation("bad lat".into()).kind(), ErrorKind::Validation);
        assert_eq!(QueueError::Concurrency("retry".into()).kind(), ErrorKind::Concurrency);
    }

    #[test]
    fn test_invalid_transition_carries_current_state() {
        let err = QueueError::InvalidTransition {
            from: TokenState::Serving,
            to: TokenState::Called,
        };
        assert_eq!(err.current_state(), Some(TokenState::Serving));
        assert_eq!(err.to_string(), "invalid state transition: SERVING -> CALLED");
    }

    #[test]
    fn test_only_concurrency_is_retryable() {
        assert!(QueueError::Concurrency("".into()).is_retryable());
        assert!(!QueueError::CounterOccupied.is_retryable());
        assert!(!QueueError::AlreadyVerifying.is_retryable());
    }
}
