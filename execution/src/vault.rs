//! Vault accrual from game and mission events.
//!
//! An [`EarnEvent`] row is the exactly-once boundary: the identity is inserted
//! with `ON CONFLICT DO NOTHING` and the vault balance moves only when that
//! insert wins, both inside one transaction.

use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use vaultline_types::{
    EarnEvent, EarnIdentity, EarnType, Reward, UserId, Valuation, VaultState,
};

use crate::metrics::EconomyMetrics;
use crate::settings::{EconomySettings, SettingsSnapshot};
use crate::store::Store;
use crate::EconomyError;

/// One occurrence to credit.
#[derive(Clone, Debug, PartialEq)]
pub struct EarnRequest {
    pub user: UserId,
    pub identity: EarnIdentity,
    pub earn_type: EarnType,
    /// Snapshot of what the user was paid, kept for audit.
    pub payout: Value,
    /// Event time; defaults to the store clock.
    pub at_ms: Option<u64>,
}

impl EarnRequest {
    pub fn new(user: UserId, identity: EarnIdentity, earn_type: EarnType) -> Self {
        Self {
            user,
            identity,
            earn_type,
            payout: Value::Null,
            at_ms: None,
        }
    }

    pub fn with_payout(mut self, payout: Value) -> Self {
        self.payout = payout;
        self
    }

    pub fn at(mut self, at_ms: u64) -> Self {
        self.at_ms = Some(at_ms);
        self
    }
}

/// Result of [`VaultAccrualEngine::record_earn_event_with_valuation`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CreditOutcome {
    Credited { amount: u64, multiplied: bool },
    /// The identity was already recorded; nothing changed.
    Duplicate,
    /// No valuation for `key`: the event was recorded with zero credit.
    ValuationMissing { key: String },
}

impl CreditOutcome {
    pub fn credited(&self) -> u64 {
        match self {
            CreditOutcome::Credited { amount, .. } => *amount,
            CreditOutcome::Duplicate | CreditOutcome::ValuationMissing { .. } => 0,
        }
    }
}

#[derive(Clone)]
pub struct VaultAccrualEngine {
    store: Arc<Store>,
    settings: Arc<dyn EconomySettings>,
    metrics: Arc<EconomyMetrics>,
}

impl VaultAccrualEngine {
    pub fn new(
        store: Arc<Store>,
        settings: Arc<dyn EconomySettings>,
        metrics: Arc<EconomyMetrics>,
    ) -> Self {
        Self {
            store,
            settings,
            metrics,
        }
    }

    /// Credit `amount` (scaled by an active multiplier) once per identity.
    ///
    /// Returns the credited amount, or 0 when the identity was already used.
    pub fn record_earn_event(
        &self,
        request: &EarnRequest,
        amount: u64,
    ) -> Result<u64, EconomyError> {
        let settings = self.settings.snapshot()?;
        let outcome = self.credit(request, amount, &settings)?;
        Ok(outcome.credited())
    }

    /// Credit a reward through the valuation table.
    ///
    /// Unknown valuations still consume the identity (zero credit) so a later
    /// retry cannot be valued differently.
    pub fn record_earn_event_with_valuation(
        &self,
        request: &EarnRequest,
        reward: &Reward,
    ) -> Result<CreditOutcome, EconomyError> {
        let settings = self.settings.snapshot()?;
        match settings.valuations.value_of(reward) {
            Valuation::Direct(points) | Valuation::Mapped { points, .. } => {
                self.credit(request, points, &settings)
            }
            Valuation::Missing { key } => match self.credit(request, 0, &settings)? {
                CreditOutcome::Duplicate => Ok(CreditOutcome::Duplicate),
                _ => {
                    self.metrics.inc_valuation_missing();
                    warn!(
                        user = request.user,
                        identity = %request.identity,
                        valuation_key = %key,
                        "valuation missing; earn event recorded with zero credit"
                    );
                    Ok(CreditOutcome::ValuationMissing { key })
                }
            },
        }
    }

    fn credit(
        &self,
        request: &EarnRequest,
        amount: u64,
        settings: &SettingsSnapshot,
    ) -> Result<CreditOutcome, EconomyError> {
        let now_ms = request.at_ms.unwrap_or_else(|| self.store.now_ms());
        let multiplier = settings
            .multiplier
            .filter(|window| window.is_active(now_ms));
        let credited = multiplier.map_or(amount, |window| window.apply(amount));
        if i64::try_from(credited).is_err() {
            return Err(EconomyError::InvalidAmount(credited));
        }
        let payout = serde_json::to_string(&request.payout)?;

        let recorded = self.store.write(|tx| {
            let inserted = tx.execute(
                "INSERT INTO earn_events (identity, user_id, amount, earn_type, payout, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(identity) DO NOTHING",
                params![
                    request.identity.as_str(),
                    request.user,
                    credited,
                    request.earn_type.as_str(),
                    payout,
                    now_ms
                ],
            )?;
            if inserted == 0 {
                return Ok(false);
            }
            if credited == 0 {
                return Ok(true);
            }
            let locked: u64 = tx
                .query_row(
                    "SELECT locked_balance FROM vault_states WHERE user_id = ?1",
                    params![request.user],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0);
            let next = locked
                .checked_add(credited)
                .filter(|next| i64::try_from(*next).is_ok())
                .ok_or(EconomyError::InvalidAmount(credited))?;
            let expires_at_ms = settings
                .locked_ttl_ms
                .map(|ttl| now_ms.saturating_add(ttl));
            tx.execute(
                "INSERT INTO vault_states
                 (user_id, locked_balance, available_balance, locked_expires_at_ms, updated_at_ms)
                 VALUES (?1, ?2, 0, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                   locked_balance = excluded.locked_balance,
                   locked_expires_at_ms = COALESCE(excluded.locked_expires_at_ms, vault_states.locked_expires_at_ms),
                   updated_at_ms = excluded.updated_at_ms",
                params![request.user, next, expires_at_ms, now_ms],
            )?;
            Ok(true)
        })?;

        if !recorded {
            self.metrics.inc_earn_duplicates();
            debug!(user = request.user, identity = %request.identity, "duplicate earn event ignored");
            return Ok(CreditOutcome::Duplicate);
        }
        self.metrics.inc_earn_credits();
        info!(
            user = request.user,
            identity = %request.identity,
            earn_type = request.earn_type.as_str(),
            amount,
            credited,
            multiplied = multiplier.is_some(),
            "earn event recorded"
        );
        Ok(CreditOutcome::Credited {
            amount: credited,
            multiplied: multiplier.is_some(),
        })
    }

    pub fn state(&self, user: UserId) -> Result<VaultState, EconomyError> {
        self.store.read(|conn| {
            let state = conn
                .query_row(
                    "SELECT locked_balance, available_balance, locked_expires_at_ms, updated_at_ms
                     FROM vault_states WHERE user_id = ?1",
                    params![user],
                    |row| {
                        Ok(VaultState {
                            user,
                            locked_balance: row.get(0)?,
                            available_balance: row.get(1)?,
                            locked_expires_at_ms: row.get(2)?,
                            updated_at_ms: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(state.unwrap_or(VaultState {
                user,
                ..VaultState::default()
            }))
        })
    }

    pub fn earn_event(&self, identity: &EarnIdentity) -> Result<Option<EarnEvent>, EconomyError> {
        self.store.read(|conn| {
            let row = conn
                .query_row(
                    "SELECT user_id, amount, earn_type, payout, created_at_ms
                     FROM earn_events WHERE identity = ?1",
                    params![identity.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, u64>(0)?,
                            row.get::<_, u64>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, u64>(4)?,
                        ))
                    },
                )
                .optional()?;
            let Some((user, amount, earn_type, payout, created_at_ms)) = row else {
                return Ok(None);
            };
            Ok(Some(EarnEvent {
                identity: identity.clone(),
                user,
                amount,
                earn_type: earn_type.parse()?,
                payout: serde_json::from_str(&payout)?,
                created_at_ms,
            }))
        })
    }
}
