//! Load generator: seeds users with tickets and runs plays in parallel against a
//! pool, then checks every touched wallet still reconciles.

use rayon::ThreadPool;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};
use vaultline_execution::{Economy, EconomyError, MetricsSnapshot, Mutation, PlayRequest};
use vaultline_types::{TokenKind, UserId};

/// Ledger reason for tickets seeded by the simulator.
pub const SIMULATION_REASON: &str = "SIMULATION";

#[derive(Clone, Debug)]
pub struct SimulationPlan {
    pub pool_id: String,
    pub game: String,
    pub ticket: TokenKind,
    pub plays: u64,
    pub users: u64,
    pub seed: u64,
    /// Log ids are assigned sequentially from here.
    pub first_log_id: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SimulationReport {
    pub plays: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub by_label: BTreeMap<String, u64>,
    pub errors: BTreeMap<String, u64>,
    pub points_credited: u64,
    /// Users whose ledger reconciled after the run.
    pub reconciled: u64,
    pub metrics: MetricsSnapshot,
}

impl SimulationPlan {
    fn user_for(&self, play: u64) -> UserId {
        1 + play % self.users
    }

    fn requests(&self) -> Vec<PlayRequest> {
        (0..self.plays)
            .map(|play| PlayRequest {
                user: self.user_for(play),
                game: self.game.clone(),
                pool_id: self.pool_id.clone(),
                ticket: self.ticket,
                cost: 1,
                log_id: self.first_log_id + play,
            })
            .collect()
    }

    /// Tickets each user needs to cover its share of plays.
    fn tickets_for(&self, user: UserId) -> u64 {
        let index = user - 1;
        self.plays / self.users + u64::from(index < self.plays % self.users)
    }
}

pub fn run(
    economy: &Economy,
    plan: &SimulationPlan,
    pool: &ThreadPool,
) -> Result<SimulationReport, EconomyError> {
    if plan.users == 0 || plan.plays == 0 {
        return Err(EconomyError::InvalidConfig(
            "simulation needs at least one user and one play".to_string(),
        ));
    }
    // Fail fast on a missing pool instead of reporting every play as failed.
    if economy.draws().pool(&plan.pool_id)?.is_none() {
        return Err(EconomyError::UnknownPool(plan.pool_id.clone()));
    }

    for user in 1..=plan.users.min(plan.plays) {
        let tickets = plan.tickets_for(user);
        economy
            .ledger()
            .grant(Mutation::new(user, plan.ticket, tickets, SIMULATION_REASON))?;
    }

    let requests = plan.requests();
    info!(plays = plan.plays, users = plan.users, pool = %plan.pool_id, "simulation started");
    let results = pool.install(|| economy.play_batch(&requests, plan.seed));

    let mut report = SimulationReport {
        plays: plan.plays,
        ..SimulationReport::default()
    };
    for result in results {
        match result {
            Ok(outcome) => {
                report.succeeded += 1;
                report.points_credited += outcome.credit.as_ref().map_or(0, |c| c.credited());
                *report.by_label.entry(outcome.item.label).or_default() += 1;
            }
            Err(err) => {
                report.failed += 1;
                *report.errors.entry(err.code().as_str().to_string()).or_default() += 1;
            }
        }
    }

    for user in 1..=plan.users.min(plan.plays) {
        let reconciliation = economy.ledger().reconcile(user, plan.ticket)?;
        if reconciliation.is_balanced() {
            report.reconciled += 1;
        } else {
            warn!(user, ?reconciliation, "ledger does not reconcile");
        }
    }
    report.metrics = economy.metrics().snapshot();
    info!(
        succeeded = report.succeeded,
        failed = report.failed,
        reconciled = report.reconciled,
        "simulation finished"
    );
    Ok(report)
}
