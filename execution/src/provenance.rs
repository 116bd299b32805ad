//! Trial-origin provenance for wallet tokens.
//!
//! A trial bucket counts how many currently-held units of a token came from
//! trial grants. It is bookkeeping beside the wallet, never a spendable balance,
//! and it must never block the wallet operation it rides along with: callers
//! wrap every call in [`best_effort`], which swallows [`ProvenanceError`] (and
//! only that) after rolling back the bucket's savepoint.

use rusqlite::{params, OptionalExtension, Transaction};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;
use vaultline_types::{TokenKind, TrialBucket, UserId};

use crate::metrics::EconomyMetrics;

#[derive(Debug, Error)]
pub enum ProvenanceError {
    #[error("trial bucket storage: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// Run provenance bookkeeping, degrading to `None` on [`ProvenanceError`].
pub(crate) fn best_effort<T>(
    metrics: &EconomyMetrics,
    operation: &'static str,
    user: UserId,
    token: TokenKind,
    f: impl FnOnce() -> Result<T, ProvenanceError>,
) -> Option<T> {
    match f() {
        Ok(value) => Some(value),
        Err(err) => {
            metrics.inc_provenance_failures();
            warn!(operation, user, %token, error = %err, "provenance bookkeeping failed; treating as non-trial");
            None
        }
    }
}

#[derive(Clone)]
pub struct ProvenanceTracker {
    metrics: Arc<EconomyMetrics>,
}

impl ProvenanceTracker {
    pub fn new(metrics: Arc<EconomyMetrics>) -> Self {
        Self { metrics }
    }

    pub(crate) fn metrics(&self) -> &EconomyMetrics {
        &self.metrics
    }

    /// Add `amount` trial units, capped at the wallet balance `cap`.
    ///
    /// Only call alongside a grant the caller already classified as trial-origin.
    pub fn mark_trial_grant(
        &self,
        tx: &mut Transaction<'_>,
        user: UserId,
        token: TokenKind,
        amount: u64,
        cap: u64,
        now_ms: u64,
    ) -> Result<u64, ProvenanceError> {
        let sp = tx.savepoint()?;
        let current = load_bucket(&sp, user, token)?;
        let next = current.saturating_add(amount).min(cap);
        store_bucket(&sp, user, token, next, now_ms)?;
        sp.commit()?;
        Ok(next)
    }

    /// Take up to `amount` units out of the bucket and return how many were
    /// trial-origin (0 when the bucket is exhausted).
    pub fn consume_provenance(
        &self,
        tx: &mut Transaction<'_>,
        user: UserId,
        token: TokenKind,
        amount: u64,
        now_ms: u64,
    ) -> Result<u64, ProvenanceError> {
        let sp = tx.savepoint()?;
        let current = load_bucket(&sp, user, token)?;
        let taken = current.min(amount);
        if taken > 0 {
            store_bucket(&sp, user, token, current - taken, now_ms)?;
        }
        sp.commit()?;
        if taken > 0 {
            self.metrics.add_trial_units_consumed(taken);
        }
        Ok(taken)
    }

    /// Lower the bucket to `balance` if it exceeds it. Not an attribution: used
    /// after administrative debits to keep `bucket <= balance`.
    pub fn clamp_to_balance(
        &self,
        tx: &mut Transaction<'_>,
        user: UserId,
        token: TokenKind,
        balance: u64,
        now_ms: u64,
    ) -> Result<(), ProvenanceError> {
        let sp = tx.savepoint()?;
        let current = load_bucket(&sp, user, token)?;
        if current > balance {
            store_bucket(&sp, user, token, balance, now_ms)?;
        }
        sp.commit()?;
        Ok(())
    }

    pub fn bucket(
        &self,
        conn: &rusqlite::Connection,
        user: UserId,
        token: TokenKind,
    ) -> Result<TrialBucket, ProvenanceError> {
        let row = conn
            .query_row(
                "SELECT balance, updated_at_ms FROM trial_buckets WHERE user_id = ?1 AND token = ?2",
                params![user, token.as_str()],
                |row| Ok((row.get::<_, u64>(0)?, row.get::<_, u64>(1)?)),
            )
            .optional()?;
        let (balance, updated_at_ms) = row.unwrap_or((0, 0));
        Ok(TrialBucket {
            user,
            token,
            balance,
            updated_at_ms,
        })
    }
}

fn load_bucket(
    conn: &rusqlite::Connection,
    user: UserId,
    token: TokenKind,
) -> Result<u64, rusqlite::Error> {
    Ok(conn
        .query_row(
            "SELECT balance FROM trial_buckets WHERE user_id = ?1 AND token = ?2",
            params![user, token.as_str()],
            |row| row.get::<_, u64>(0),
        )
        .optional()?
        .unwrap_or(0))
}

fn store_bucket(
    conn: &rusqlite::Connection,
    user: UserId,
    token: TokenKind,
    balance: u64,
    now_ms: u64,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO trial_buckets (user_id, token, balance, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id, token) DO UPDATE
         SET balance = excluded.balance, updated_at_ms = excluded.updated_at_ms",
        params![user, token.as_str(), balance, now_ms],
    )?;
    Ok(())
}
