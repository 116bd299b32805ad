//! Vaultline execution layer.
//!
//! This crate owns every balance-changing operation of the event economy:
//! wallet mutations with their audit ledger ([`LedgerStore`]), trial-origin
//! bookkeeping ([`ProvenanceTracker`]), request deduplication
//! ([`IdempotencyGuard`]), weighted draws ([`DrawResolver`]) and vault accrual
//! ([`VaultAccrualEngine`]). [`Economy`] wires them over one [`Store`].
//!
//! ## Storage invariants
//! - Each mutating call is one `BEGIN IMMEDIATE` transaction; balance update and
//!   ledger append commit together or not at all.
//! - `sum(ledger delta) == balance` for every `(user, token)`.
//! - Balances, trial buckets and vault balances never go negative.
//! - An earn identity credits the vault at most once.
//!
//! ## Minimal play (example)
//! ```rust,no_run
//! use std::sync::Arc;
//! use rand::{rngs::StdRng, SeedableRng};
//! use vaultline_execution::{
//!     Economy, Mutation, PlayRequest, RetryPolicy, StaticSettings, StoreConfig, SystemClock,
//! };
//! use vaultline_types::{Reward, TokenKind};
//!
//! # fn main() -> Result<(), vaultline_execution::EconomyError> {
//! let economy = Economy::open(
//!     std::path::Path::new("economy.db"),
//!     StoreConfig::default(),
//!     Arc::new(SystemClock),
//!     Arc::new(StaticSettings::default()),
//!     RetryPolicy::default(),
//! )?;
//! economy.draws().upsert_pool("wheel", None)?;
//! economy.draws().add_item("wheel", "50 points", &Reward::Points { amount: 50 }, 1, None)?;
//! economy.ledger().grant(Mutation::new(7, TokenKind::RouletteTicket, 1, "SIGNUP"))?;
//! let outcome = economy.play(
//!     &PlayRequest {
//!         user: 7,
//!         game: "roulette".to_string(),
//!         pool_id: "wheel".to_string(),
//!         ticket: TokenKind::RouletteTicket,
//!         cost: 1,
//!         log_id: 1,
//!     },
//!     &mut StdRng::seed_from_u64(1),
//! )?;
//! assert_eq!(outcome.ticket_balance, 0);
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod cache;
pub mod clock;
pub mod draw;
mod error;
pub mod idempotency;
pub mod ledger;
pub mod metrics;
pub mod play;
pub mod provenance;
pub mod settings;
pub mod store;
pub mod vault;

#[cfg(test)]
mod draw_tests;
#[cfg(test)]
mod ledger_tests;

pub use backoff::{BackoffPolicy, RetryPolicy};
pub use cache::{CachedSettings, TtlCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use draw::{pick_weighted, DrawOutcome, DrawResolver};
pub use error::EconomyError;
pub use idempotency::{canonical_json, fingerprint, BeginOutcome, Execution, IdempotencyGuard};
pub use ledger::{ConsumeOutcome, LedgerStore, Mutation};
pub use metrics::{EconomyMetrics, MetricsSnapshot};
pub use play::{Economy, MissionClaim, PlayOutcome, PlayRequest};
pub use provenance::{ProvenanceError, ProvenanceTracker};
pub use settings::{EconomySettings, SettingsSnapshot, StaticSettings};
pub use store::{Store, StoreConfig};
pub use vault::{CreditOutcome, EarnRequest, VaultAccrualEngine};
