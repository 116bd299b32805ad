use thiserror::Error;
use vaultline_types::{ErrorCode, TokenKind, TypesError, UserId};

/// Errors returned by every economy operation.
#[derive(Debug, Error)]
pub enum EconomyError {
    #[error("amount must be a positive integer no larger than i64::MAX (got {0})")]
    InvalidAmount(u64),
    #[error("insufficient {token} balance for user {user}: needed {needed}, available {available}")]
    InsufficientBalance {
        user: UserId,
        token: TokenKind,
        needed: u64,
        available: u64,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("lock not acquired after {attempts} attempt(s)")]
    LockNotAcquired { attempts: u32 },
    #[error("idempotency key reused with a different request (actor={actor}, scope={scope}, key={key})")]
    KeyReuseMismatch {
        actor: String,
        scope: String,
        key: String,
    },
    #[error("idempotency record is in state {status}; mint a new key")]
    InvalidState { status: String },
    #[error("an identical request is still in progress")]
    DuplicateInFlight,
    #[error("unknown draw pool: {0}")]
    UnknownPool(String),
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] TypesError),
    #[error("storage error: {0}")]
    Storage(rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EconomyError {
    /// Stable code for the calling layer.
    pub fn code(&self) -> ErrorCode {
        match self {
            EconomyError::InvalidAmount(_) => ErrorCode::InvalidAmount,
            EconomyError::InsufficientBalance { .. } => ErrorCode::InsufficientBalance,
            EconomyError::InvalidConfig(_) => ErrorCode::InvalidConfig,
            EconomyError::LockNotAcquired { .. } => ErrorCode::LockNotAcquired,
            EconomyError::KeyReuseMismatch { .. } => ErrorCode::KeyReuseMismatch,
            EconomyError::InvalidState { .. } => ErrorCode::InvalidState,
            EconomyError::DuplicateInFlight => ErrorCode::DuplicateInFlight,
            EconomyError::UnknownPool(_) => ErrorCode::UnknownPool,
            EconomyError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            EconomyError::Storage(_) | EconomyError::Serialization(_) => ErrorCode::Internal,
        }
    }

    pub fn is_lock_contention(&self) -> bool {
        matches!(self, EconomyError::LockNotAcquired { .. })
    }
}

impl From<rusqlite::Error> for EconomyError {
    fn from(err: rusqlite::Error) -> Self {
        if is_lock_error(&err) {
            return EconomyError::LockNotAcquired { attempts: 1 };
        }
        EconomyError::Storage(err)
    }
}

/// Busy/locked failures raised when a lock wait exceeds the busy timeout.
pub(crate) fn is_lock_error(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_failures_become_lock_contention() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let err = EconomyError::from(busy);
        assert!(err.is_lock_contention());
        assert_eq!(err.code(), ErrorCode::LockNotAcquired);
    }

    #[test]
    fn other_sqlite_failures_are_internal() {
        let err = EconomyError::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(err, EconomyError::Storage(_)));
        assert_eq!(err.code(), ErrorCode::Internal);
    }
}
