use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Parse and validation failures for values in this crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypesError {
    #[error("unknown token kind: {0}")]
    UnknownToken(String),
    #[error("invalid reward descriptor: {0}")]
    InvalidReward(String),
    #[error("unknown idempotency status: {0}")]
    UnknownStatus(String),
    #[error("unknown earn type: {0}")]
    UnknownEarnType(String),
    #[error("invalid earn identity: {0}")]
    InvalidIdentity(String),
    #[error("invalid multiplier window: {0}")]
    InvalidMultiplier(String),
}

/// How a caller should react to a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Transient; the same request may succeed later.
    Retry,
    /// The request can never succeed as issued.
    Permanent,
    /// The request (or an identical one) was already accepted.
    AlreadyDone,
}

/// Stable, transport-independent error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidAmount,
    InsufficientBalance,
    InvalidConfig,
    LockNotAcquired,
    KeyReuseMismatch,
    InvalidState,
    DuplicateInFlight,
    UnknownPool,
    InvalidRequest,
    Internal,
}

impl ErrorCode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidAmount => "INVALID_AMOUNT",
            ErrorCode::InsufficientBalance => "INSUFFICIENT_BALANCE",
            ErrorCode::InvalidConfig => "INVALID_CONFIG",
            ErrorCode::LockNotAcquired => "LOCK_NOT_ACQUIRED",
            ErrorCode::KeyReuseMismatch => "KEY_REUSE_MISMATCH",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::DuplicateInFlight => "DUPLICATE_IN_FLIGHT",
            ErrorCode::UnknownPool => "UNKNOWN_POOL",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    pub const fn disposition(&self) -> Disposition {
        match self {
            ErrorCode::LockNotAcquired | ErrorCode::Internal => Disposition::Retry,
            ErrorCode::DuplicateInFlight => Disposition::AlreadyDone,
            ErrorCode::InvalidAmount
            | ErrorCode::InsufficientBalance
            | ErrorCode::InvalidConfig
            | ErrorCode::KeyReuseMismatch
            | ErrorCode::InvalidState
            | ErrorCode::UnknownPool
            | ErrorCode::InvalidRequest => Disposition::Permanent,
        }
    }

    /// Status code used when the error crosses an HTTP boundary.
    pub const fn http_status(&self) -> u16 {
        match self {
            ErrorCode::InvalidAmount | ErrorCode::InvalidRequest => 400,
            ErrorCode::UnknownPool => 404,
            ErrorCode::DuplicateInFlight | ErrorCode::InvalidState => 409,
            ErrorCode::InsufficientBalance | ErrorCode::KeyReuseMismatch => 422,
            ErrorCode::InvalidConfig | ErrorCode::Internal => 500,
            ErrorCode::LockNotAcquired => 503,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
