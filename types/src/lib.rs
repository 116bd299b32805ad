//! Common types for the vaultline economy engine.
//!
//! Everything here is plain data plus validation: wallet and ledger records,
//! idempotency records, draw pools, vault state and earn events. Persistence and
//! the transactional operations over these types live in `vaultline-execution`.

pub mod draw;
pub mod error;
pub mod idempotency;
pub mod ledger;
pub mod reward;
pub mod token;
pub mod vault;

pub use draw::{DrawPool, ItemSpec, PoolSpec, WeightedItem, ROULETTE_SLOT_COUNT};
pub use error::{Disposition, ErrorCode, TypesError};
pub use idempotency::{IdempotencyRecord, IdempotencyStatus};
pub use ledger::{LedgerEntry, Reconciliation, TrialBucket, WalletAccount};
pub use reward::Reward;
pub use token::TokenKind;
pub use vault::{
    EarnEvent, EarnIdentity, EarnSource, EarnType, MultiplierWindow, Valuation, ValuationTable,
    VaultState, MULTIPLIER_BPS_ONE,
};

/// Trusted user identifier supplied by the (authenticated) caller.
pub type UserId = u64;
