//! Game-play and mission-claim orchestration over the economy components.
//!
//! A play spans three commit points: the draw, the ticket consumption and the
//! vault credit. They are separate transactions: a failed vault credit never
//! rolls back a consumed ticket.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use vaultline_types::{
    EarnIdentity, EarnSource, EarnType, Reward, TokenKind, UserId, WeightedItem,
};

use crate::backoff::RetryPolicy;
use crate::clock::Clock;
use crate::draw::DrawResolver;
use crate::idempotency::{Execution, IdempotencyGuard};
use crate::ledger::{LedgerStore, Mutation};
use crate::metrics::EconomyMetrics;
use crate::settings::EconomySettings;
use crate::store::{Store, StoreConfig};
use crate::vault::{CreditOutcome, EarnRequest, VaultAccrualEngine};
use crate::EconomyError;

/// Ledger reason for play-ticket consumption.
pub const PLAY_REASON: &str = "PLAY";
/// Ledger reason for mission reward grants.
pub const MISSION_REWARD_REASON: &str = "MISSION_REWARD";
/// Idempotency scope for mission claims.
pub const MISSION_CLAIM_SCOPE: &str = "mission_claim";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayRequest {
    pub user: UserId,
    /// Game name, e.g. `roulette`; second segment of the earn identity.
    pub game: String,
    pub pool_id: String,
    pub ticket: TokenKind,
    pub cost: u64,
    /// Id of the caller's game log row; last segment of the earn identity.
    pub log_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PlayOutcome {
    pub item: WeightedItem,
    pub draw_attempts: u32,
    /// Ticket balance after consumption.
    pub ticket_balance: u64,
    pub trial_units: u64,
    pub identity: EarnIdentity,
    pub earn_type: EarnType,
    /// `None` when the vault credit failed; retry it with `identity`.
    pub credit: Option<CreditOutcome>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionClaim {
    pub user: UserId,
    pub mission: String,
    pub claim_id: u64,
    pub reward: Reward,
}

/// Every economy component, built over one shared store.
#[derive(Clone)]
pub struct Economy {
    store: Arc<Store>,
    metrics: Arc<EconomyMetrics>,
    ledger: LedgerStore,
    idempotency: IdempotencyGuard,
    draws: DrawResolver,
    vault: VaultAccrualEngine,
}

impl Economy {
    pub fn new(store: Arc<Store>, settings: Arc<dyn EconomySettings>, retry: RetryPolicy) -> Self {
        let metrics = Arc::new(EconomyMetrics::default());
        Self {
            ledger: LedgerStore::new(store.clone(), metrics.clone()),
            idempotency: IdempotencyGuard::new(store.clone(), metrics.clone()),
            draws: DrawResolver::new(store.clone(), metrics.clone(), retry),
            vault: VaultAccrualEngine::new(store.clone(), settings, metrics.clone()),
            store,
            metrics,
        }
    }

    pub fn open(
        path: &Path,
        store_config: StoreConfig,
        clock: Arc<dyn Clock>,
        settings: Arc<dyn EconomySettings>,
        retry: RetryPolicy,
    ) -> Result<Self, EconomyError> {
        let store = Store::open(path, store_config, clock)?;
        Ok(Self::new(Arc::new(store), settings, retry))
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<EconomyMetrics> {
        &self.metrics
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    pub fn idempotency(&self) -> &IdempotencyGuard {
        &self.idempotency
    }

    pub fn draws(&self) -> &DrawResolver {
        &self.draws
    }

    pub fn vault(&self) -> &VaultAccrualEngine {
        &self.vault
    }

    /// Draw, consume the ticket, then credit the vault.
    ///
    /// If the ticket cannot be consumed, finite stock taken by the draw is
    /// given back. Reward delivery (tokens, items) is left to the caller.
    pub fn play<R: Rng>(&self, request: &PlayRequest, rng: &mut R) -> Result<PlayOutcome, EconomyError> {
        let draw = self.draws.resolve(&request.pool_id, rng)?;
        let item = draw.item;

        let mutation = Mutation::new(request.user, request.ticket, request.cost, PLAY_REASON)
            .with_label(request.game.clone())
            .with_meta(json!({
                "pool_id": request.pool_id,
                "item_id": item.id,
                "log_id": request.log_id,
            }));
        let consumed = match self.ledger.consume(mutation) {
            Ok(consumed) => consumed,
            Err(err) => {
                if item.stock.is_some() {
                    if let Err(release_err) = self.draws.release_stock(item.id) {
                        warn!(item = item.id, error = %release_err, "failed to return stock after rejected play");
                    }
                }
                return Err(err);
            }
        };

        let earn_type = if consumed.consumed_from_trial() {
            EarnType::TrialPlay
        } else {
            EarnType::GamePlay
        };
        let identity = EarnIdentity::new(earn_type.source(), &request.game, request.log_id);
        let earn = EarnRequest::new(request.user, identity.clone(), earn_type).with_payout(json!({
            "item": item.label,
            "reward": item.reward,
        }));
        let credit = match self.vault.record_earn_event_with_valuation(&earn, &item.reward) {
            Ok(credit) => Some(credit),
            Err(err) => {
                warn!(user = request.user, identity = %identity, error = %err, "vault credit failed after play");
                None
            }
        };

        info!(
            user = request.user,
            game = %request.game,
            item = %item.label,
            trial_units = consumed.trial_units,
            credited = credit.as_ref().map_or(0, CreditOutcome::credited),
            "play settled"
        );
        Ok(PlayOutcome {
            item,
            draw_attempts: draw.attempts,
            ticket_balance: consumed.balance,
            trial_units: consumed.trial_units,
            identity,
            earn_type,
            credit,
        })
    }

    /// Run independent plays, each with its own seeded RNG.
    #[cfg(feature = "parallel")]
    pub fn play_batch(
        &self,
        requests: &[PlayRequest],
        seed: u64,
    ) -> Vec<Result<PlayOutcome, EconomyError>> {
        use rand::{rngs::StdRng, SeedableRng};
        use rayon::prelude::*;

        requests
            .par_iter()
            .map(|request| {
                let mut rng = StdRng::seed_from_u64(seed ^ request.log_id);
                self.play(request, &mut rng)
            })
            .collect()
    }

    /// Deliver a mission reward at most once per idempotency key.
    ///
    /// Token rewards are granted to the wallet; every reward is then credited
    /// to the vault through the valuation table under `MISSION:<mission>:<id>`.
    /// The same claim under a different key is still granted only once.
    pub fn claim_mission(
        &self,
        claim: &MissionClaim,
        idempotency_key: &str,
    ) -> Result<Execution, EconomyError> {
        let request = serde_json::to_value(claim)?;
        let actor = claim.user.to_string();
        self.idempotency
            .execute(&actor, MISSION_CLAIM_SCOPE, idempotency_key, &request, || {
                // Both steps are keyed by the claim identity, so re-running
                // after a retryable failure cannot grant or credit twice.
                let identity = EarnIdentity::new(EarnSource::Mission, &claim.mission, claim.claim_id);
                let balance = match &claim.reward {
                    Reward::Token { kind, amount } if *amount > 0 => Some(self.ledger.grant(
                        Mutation::new(claim.user, *kind, *amount, MISSION_REWARD_REASON)
                            .with_label(claim.mission.clone())
                            .with_source_key(identity.as_str()),
                    )?),
                    _ => None,
                };
                let earn = EarnRequest::new(claim.user, identity.clone(), EarnType::MissionClaim)
                    .with_payout(serde_json::to_value(&claim.reward)?);
                let credit = self.vault.record_earn_event_with_valuation(&earn, &claim.reward)?;
                Ok(json!({
                    "identity": identity,
                    "balance": balance,
                    "credit": credit,
                }))
            })
    }

    /// Grant tokens at most once per `(actor, key)`; the response carries the
    /// new balance.
    pub fn grant_once(
        &self,
        actor: &str,
        idempotency_key: &str,
        mutation: Mutation,
        trial: bool,
    ) -> Result<Execution, EconomyError> {
        let request = json!({
            "user": mutation.user,
            "token": mutation.token,
            "amount": mutation.amount,
            "reason": mutation.reason,
            "trial": trial,
        });
        let scope = if trial { "trial_grant" } else { "grant" };
        self.idempotency.execute(actor, scope, idempotency_key, &request, || {
            let balance = if trial {
                self.ledger.grant_trial(mutation)?
            } else {
                self.ledger.grant(mutation)?
            };
            Ok(json!({ "balance": balance }))
        })
    }
}
