//! Error taxonomy for the queue.
//!
//! Every failure the engine, store or identity layer can surface is a [`QueueError`].
//! [`QueueError::kind`] collapses it to the closed [`ErrorKind`] set the API maps to HTTP.

use crate::types::{OrderId, OrderStatus, UserId};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthenticated,
    InvalidCredential,
    Forbidden,
    InvalidRequest,
    NotFound,
    AlreadyActive,
    IllegalState,
    Unavailable,
    Internal,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("authentication required: {0}")]
    Unauthenticated(String),

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("role {0} required")]
    Forbidden(&'static str),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("order {0} not found")]
    OrderNotFound(OrderId),

    #[error("{0}")]
    NotFound(String),

    #[error("user {0} already has an active order")]
    AlreadyActive(UserId),

    #[error("order {id} is {actual}, expected {expected}")]
    IllegalState {
        id: OrderId,
        actual: OrderStatus,
        expected: OrderStatus,
    },

    /// Serialization conflict; retried by the engine and never surfaced directly.
    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Unauthenticated(_) => ErrorKind::Unauthenticated,
            QueueError::InvalidCredential(_) => ErrorKind::InvalidCredential,
            QueueError::Forbidden(_) => ErrorKind::Forbidden,
            QueueError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            QueueError::OrderNotFound(_) | QueueError::NotFound(_) => ErrorKind::NotFound,
            QueueError::AlreadyActive(_) => ErrorKind::AlreadyActive,
            QueueError::IllegalState { .. } => ErrorKind::IllegalState,
            QueueError::Conflict(_) | QueueError::Unavailable(_) => ErrorKind::Unavailable,
            QueueError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Conflict(_))
    }
}

impl From<rusqlite::Error> for QueueError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &err {
            rusqlite::Error::SqliteFailure(e, _) => match e.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    QueueError::Conflict(err.to_string())
                }
                // Unique index on queued position or active owner. The engine retries, and the
                // retry re-reads the state that caused the violation.
                ErrorCode::ConstraintViolation
                    if matches!(
                        e.extended_code,
                        rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    ) =>
                {
                    QueueError::Conflict(err.to_string())
                }
                ErrorCode::CannotOpen | ErrorCode::DiskFull | ErrorCode::SystemIoFailure => {
                    QueueError::Unavailable(err.to_string())
                }
                _ => QueueError::Internal(err.to_string()),
            },
            _ => QueueError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_retryable_and_reports_unavailable() {
        let err = QueueError::Conflict("busy".into());
        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(!QueueError::AlreadyActive(UserId(1)).is_retryable());
    }

    #[test]
    fn illegal_state_message_names_both_states() {
        let err = QueueError::IllegalState {
            id: OrderId(4),
            actual: OrderStatus::Processing,
            expected: OrderStatus::Queued,
        };
        assert_eq!(err.to_string(), "order 4 is PROCESSING, expected QUEUED");
    }
}
