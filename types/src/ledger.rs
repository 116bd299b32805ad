use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{TokenKind, UserId};

/// Balance of one token for one user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAccount {
    pub user: UserId,
    pub token: TokenKind,
    pub balance: u64,
    pub updated_at_ms: u64,
}

/// Immutable audit record of one balance mutation.
///
/// For a `(user, token)` pair the running sum of `delta` over entries ordered by
/// `id` equals the wallet balance, and each entry's `balance_after` equals that
/// running sum at the entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: u64,
    pub user: UserId,
    pub token: TokenKind,
    pub delta: i64,
    pub balance_after: u64,
    pub reason: String,
    pub label: Option<String>,
    pub meta: Value,
    /// Event identity that made this grant apply at most once.
    #[serde(default)]
    pub source_key: Option<String>,
    pub created_at_ms: u64,
}

/// Units of a token currently attributable to trial grants.
///
/// Always `0 <= balance <= wallet balance`. A provenance signal only, never a
/// spendable sub-balance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialBucket {
    pub user: UserId,
    pub token: TokenKind,
    pub balance: u64,
    pub updated_at_ms: u64,
}

/// Result of comparing the ledger against the stored balance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub user: UserId,
    pub token: TokenKind,
    pub balance: u64,
    pub ledger_sum: i128,
    pub entries: u64,
}

impl Reconciliation {
    pub fn is_balanced(&self) -> bool {
        self.ledger_sum == i128::from(self.balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconciliation_balanced_only_on_exact_match() {
        let mut rec = Reconciliation {
            user: 1,
            token: TokenKind::Diamond,
            balance: 40,
            ledger_sum: 40,
            entries: 3,
        };
        assert!(rec.is_balanced());
        rec.ledger_sum = 41;
        assert!(!rec.is_balanced());
    }
}
