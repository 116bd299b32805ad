use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::TypesError;

/// Lifecycle of an idempotency record.
///
/// `InProgress -> Completed` on success, `InProgress -> Failed` when the caller
/// abandons the request. Neither terminal state ever transitions again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    InProgress,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::InProgress => "IN_PROGRESS",
            IdempotencyStatus::Completed => "COMPLETED",
            IdempotencyStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdempotencyStatus {
    type Err = TypesError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "IN_PROGRESS" => Ok(IdempotencyStatus::InProgress),
            "COMPLETED" => Ok(IdempotencyStatus::Completed),
            "FAILED" => Ok(IdempotencyStatus::Failed),
            other => Err(TypesError::UnknownStatus(other.to_string())),
        }
    }
}

/// Deduplication record keyed by `(actor, scope, key)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub actor: String,
    pub scope: String,
    pub key: String,
    /// Hex digest of the canonicalized request payload.
    pub request_hash: String,
    pub status: IdempotencyStatus,
    pub response: Option<Value>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}
