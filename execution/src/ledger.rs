//! Wallet balances with an append-only ledger.
//!
//! Every mutation updates the `(user, token)` balance and appends exactly one
//! ledger entry in the same transaction, so the running sum of deltas always
//! equals the stored balance. Debits check and apply under the store's write
//! lock; callers must not read the balance first and debit later.

use rusqlite::{params, OptionalExtension, Transaction};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info};
use vaultline_types::{LedgerEntry, Reconciliation, TokenKind, TrialBucket, UserId, WalletAccount};

use crate::metrics::EconomyMetrics;
use crate::provenance::{best_effort, ProvenanceTracker};
use crate::store::Store;
use crate::EconomyError;

/// A requested balance change.
#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    pub user: UserId,
    pub token: TokenKind,
    pub amount: u64,
    /// Caller-supplied reason code (e.g. `PLAY`, `MISSION_REWARD`, `ADMIN_REVOKE`).
    pub reason: String,
    pub label: Option<String>,
    pub meta: Option<Value>,
    /// Identity of the event behind a grant (e.g. `MISSION:DAILY:3`). A grant
    /// whose source key is already in the ledger is not applied again.
    pub source_key: Option<String>,
}

impl Mutation {
    pub fn new(user: UserId, token: TokenKind, amount: u64, reason: impl Into<String>) -> Self {
        Self {
            user,
            token,
            amount,
            reason: reason.into(),
            label: None,
            meta: None,
            source_key: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_source_key(mut self, source_key: impl Into<String>) -> Self {
        self.source_key = Some(source_key.into());
        self
    }

    fn delta(&self) -> Result<i64, EconomyError> {
        match i64::try_from(self.amount) {
            Ok(delta) if delta > 0 => Ok(delta),
            _ => Err(EconomyError::InvalidAmount(self.amount)),
        }
    }
}

/// Result of [`LedgerStore::consume`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsumeOutcome {
    pub balance: u64,
    /// Units of this consumption attributed to trial grants.
    pub trial_units: u64,
}

impl ConsumeOutcome {
    pub fn consumed_from_trial(&self) -> bool {
        self.trial_units > 0
    }
}

#[derive(Clone)]
pub struct LedgerStore {
    store: Arc<Store>,
    provenance: ProvenanceTracker,
    metrics: Arc<EconomyMetrics>,
}

impl LedgerStore {
    pub fn new(store: Arc<Store>, metrics: Arc<EconomyMetrics>) -> Self {
        Self {
            provenance: ProvenanceTracker::new(metrics.clone()),
            store,
            metrics,
        }
    }

    /// Current balance, 0 for an account never written. A plain read: it never
    /// waits on the write lock.
    pub fn balance(&self, user: UserId, token: TokenKind) -> Result<u64, EconomyError> {
        self.store.read(|conn| load_balance(conn, user, token))
    }

    /// The account row, materializing a zero account on first access.
    pub fn account(&self, user: UserId, token: TokenKind) -> Result<WalletAccount, EconomyError> {
        let now_ms = self.store.now_ms();
        self.store.read(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO wallet_accounts (user_id, token, balance, updated_at_ms)
                 VALUES (?1, ?2, 0, ?3)",
                params![user, token.as_str(), now_ms],
            )?;
            let (balance, updated_at_ms) = conn.query_row(
                "SELECT balance, updated_at_ms FROM wallet_accounts WHERE user_id = ?1 AND token = ?2",
                params![user, token.as_str()],
                |row| Ok((row.get::<_, u64>(0)?, row.get::<_, u64>(1)?)),
            )?;
            Ok(WalletAccount {
                user,
                token,
                balance,
                updated_at_ms,
            })
        })
    }

    /// Credit `amount`; returns the new balance.
    pub fn grant(&self, mutation: Mutation) -> Result<u64, EconomyError> {
        self.grant_inner(mutation, false)
    }

    /// Credit `amount` and record it as trial-origin.
    pub fn grant_trial(&self, mutation: Mutation) -> Result<u64, EconomyError> {
        self.grant_inner(mutation, true)
    }

    fn grant_inner(&self, mutation: Mutation, trial: bool) -> Result<u64, EconomyError> {
        let delta = mutation.delta()?;
        let now_ms = self.store.now_ms();
        let meta = tag_meta(mutation.meta.clone(), |meta| {
            if trial {
                meta.insert("trial_grant".to_string(), Value::Bool(true));
            }
        });
        let (balance, applied) = self.store.write(|tx| {
            if let Some(source_key) = &mutation.source_key {
                if source_key_applied(tx, &mutation, source_key)? {
                    return Ok((load_balance(tx, mutation.user, mutation.token)?, false));
                }
            }
            let balance = apply_delta(tx, &mutation, delta, &meta, now_ms)?;
            if trial {
                best_effort(&self.metrics, "mark_trial_grant", mutation.user, mutation.token, || {
                    self.provenance.mark_trial_grant(
                        tx,
                        mutation.user,
                        mutation.token,
                        mutation.amount,
                        balance,
                        now_ms,
                    )
                });
            }
            Ok((balance, true))
        })?;
        if !applied {
            debug!(
                user = mutation.user,
                token = %mutation.token,
                source_key = mutation.source_key.as_deref().unwrap_or_default(),
                balance,
                "grant already applied"
            );
            return Ok(balance);
        }
        self.metrics.inc_grants();
        info!(
            user = mutation.user,
            token = %mutation.token,
            amount = mutation.amount,
            reason = %mutation.reason,
            trial,
            balance,
            "granted"
        );
        Ok(balance)
    }

    /// Debit `amount` for play consumption, attributing trial-origin units.
    ///
    /// Fails with [`EconomyError::InsufficientBalance`] without writing anything
    /// when the balance is too low.
    pub fn consume(&self, mutation: Mutation) -> Result<ConsumeOutcome, EconomyError> {
        let delta = mutation.delta()?;
        let now_ms = self.store.now_ms();
        let outcome = self.store.write(|tx| {
            let available = load_balance(tx, mutation.user, mutation.token)?;
            ensure_covers(&mutation, available)?;
            let trial_units = best_effort(
                &self.metrics,
                "consume_provenance",
                mutation.user,
                mutation.token,
                || {
                    self.provenance.consume_provenance(
                        tx,
                        mutation.user,
                        mutation.token,
                        mutation.amount,
                        now_ms,
                    )
                },
            )
            .unwrap_or(0);
            let meta = tag_meta(mutation.meta.clone(), |meta| {
                meta.insert("trial_units".to_string(), json!(trial_units));
                meta.insert("consumed_from_trial".to_string(), json!(trial_units > 0));
            });
            let balance = apply_delta(tx, &mutation, -delta, &meta, now_ms)?;
            Ok(ConsumeOutcome {
                balance,
                trial_units,
            })
        })?;
        self.metrics.inc_consumes();
        debug!(
            user = mutation.user,
            token = %mutation.token,
            amount = mutation.amount,
            reason = %mutation.reason,
            trial_units = outcome.trial_units,
            balance = outcome.balance,
            "consumed"
        );
        Ok(outcome)
    }

    /// Administrative debit. Not play consumption: trial units are not
    /// attributed, the bucket is only lowered if it would exceed the balance.
    pub fn revoke(&self, mutation: Mutation) -> Result<u64, EconomyError> {
        let delta = mutation.delta()?;
        let now_ms = self.store.now_ms();
        let meta = mutation.meta.clone().unwrap_or(Value::Null);
        let balance = self.store.write(|tx| {
            let available = load_balance(tx, mutation.user, mutation.token)?;
            ensure_covers(&mutation, available)?;
            let balance = apply_delta(tx, &mutation, -delta, &meta, now_ms)?;
            best_effort(&self.metrics, "clamp_trial_bucket", mutation.user, mutation.token, || {
                self.provenance
                    .clamp_to_balance(tx, mutation.user, mutation.token, balance, now_ms)
            });
            Ok(balance)
        })?;
        self.metrics.inc_revokes();
        info!(
            user = mutation.user,
            token = %mutation.token,
            amount = mutation.amount,
            reason = %mutation.reason,
            balance,
            "revoked"
        );
        Ok(balance)
    }

    pub fn trial_bucket(&self, user: UserId, token: TokenKind) -> Result<TrialBucket, EconomyError> {
        self.store.read(|conn| {
            self.provenance
                .bucket(conn, user, token)
                .map_err(|err| match err {
                    crate::provenance::ProvenanceError::Storage(err) => EconomyError::from(err),
                })
        })
    }

    /// Ledger entries for `(user, token)` in commit order.
    pub fn entries(&self, user: UserId, token: TokenKind) -> Result<Vec<LedgerEntry>, EconomyError> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, delta, balance_after, reason, label, meta, source_key, created_at_ms
                 FROM ledger_entries WHERE user_id = ?1 AND token = ?2 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![user, token.as_str()], |row| {
                Ok((
                    row.get::<_, u64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, u64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, u64>(7)?,
                ))
            })?;
            let mut entries = Vec::new();
            for row in rows {
                let (id, delta, balance_after, reason, label, meta, source_key, created_at_ms) =
                    row?;
                entries.push(LedgerEntry {
                    id,
                    user,
                    token,
                    delta,
                    balance_after,
                    reason,
                    label,
                    meta: serde_json::from_str(&meta)?,
                    source_key,
                    created_at_ms,
                });
            }
            Ok(entries)
        })
    }

    /// Compare `sum(delta)` with the stored balance.
    pub fn reconcile(&self, user: UserId, token: TokenKind) -> Result<Reconciliation, EconomyError> {
        self.store.read(|conn| {
            let balance = load_balance(conn, user, token)?;
            let (ledger_sum, entries) = conn.query_row(
                "SELECT COALESCE(SUM(delta), 0), COUNT(*) FROM ledger_entries
                 WHERE user_id = ?1 AND token = ?2",
                params![user, token.as_str()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, u64>(1)?)),
            )?;
            Ok(Reconciliation {
                user,
                token,
                balance,
                ledger_sum: i128::from(ledger_sum),
                entries,
            })
        })
    }
}

fn ensure_covers(mutation: &Mutation, available: u64) -> Result<(), EconomyError> {
    if available < mutation.amount {
        return Err(EconomyError::InsufficientBalance {
            user: mutation.user,
            token: mutation.token,
            needed: mutation.amount,
            available,
        });
    }
    Ok(())
}

fn load_balance(
    conn: &rusqlite::Connection,
    user: UserId,
    token: TokenKind,
) -> Result<u64, EconomyError> {
    Ok(conn
        .query_row(
            "SELECT balance FROM wallet_accounts WHERE user_id = ?1 AND token = ?2",
            params![user, token.as_str()],
            |row| row.get::<_, u64>(0),
        )
        .optional()?
        .unwrap_or(0))
}

fn source_key_applied(
    conn: &rusqlite::Connection,
    mutation: &Mutation,
    source_key: &str,
) -> Result<bool, EconomyError> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM ledger_entries
             WHERE user_id = ?1 AND token = ?2 AND source_key = ?3",
            params![mutation.user, mutation.token.as_str(), source_key],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

/// Apply a signed delta and append the matching ledger entry.
fn apply_delta(
    tx: &Transaction<'_>,
    mutation: &Mutation,
    delta: i64,
    meta: &Value,
    now_ms: u64,
) -> Result<u64, EconomyError> {
    let current = load_balance(tx, mutation.user, mutation.token)?;
    let next = if delta >= 0 {
        current
            .checked_add(delta.unsigned_abs())
            .filter(|next| i64::try_from(*next).is_ok())
            .ok_or(EconomyError::InvalidAmount(mutation.amount))?
    } else {
        current
            .checked_sub(delta.unsigned_abs())
            .ok_or(EconomyError::InsufficientBalance {
                user: mutation.user,
                token: mutation.token,
                needed: mutation.amount,
                available: current,
            })?
    };
    tx.execute(
        "INSERT INTO wallet_accounts (user_id, token, balance, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id, token) DO UPDATE
         SET balance = excluded.balance, updated_at_ms = excluded.updated_at_ms",
        params![mutation.user, mutation.token.as_str(), next, now_ms],
    )?;
    tx.execute(
        "INSERT INTO ledger_entries
         (user_id, token, delta, balance_after, reason, label, meta, source_key, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            mutation.user,
            mutation.token.as_str(),
            delta,
            next,
            mutation.reason,
            mutation.label,
            serde_json::to_string(meta)?,
            mutation.source_key,
            now_ms
        ],
    )?;
    Ok(next)
}

/// Ensure `meta` is an object and let `f` add fields to it. Non-object values
/// are preserved under `data`.
fn tag_meta(meta: Option<Value>, f: impl FnOnce(&mut Map<String, Value>)) -> Value {
    let mut map = match meta {
        Some(Value::Object(map)) => map,
        None | Some(Value::Null) => Map::new(),
        Some(other) => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    f(&mut map);
    if map.is_empty() {
        Value::Null
    } else {
        Value::Object(map)
    }
}
