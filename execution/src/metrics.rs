use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Operational counters for the economy core.
///
/// Counters are monotonic and shared (behind an `Arc`) by every component built
/// on the same store.
#[derive(Default)]
pub struct EconomyMetrics {
    grants: AtomicU64,
    consumes: AtomicU64,
    revokes: AtomicU64,
    trial_units_consumed: AtomicU64,
    provenance_failures: AtomicU64,
    idempotent_replays: AtomicU64,
    idempotent_conflicts: AtomicU64,
    draws: AtomicU64,
    draw_lock_retries: AtomicU64,
    draw_lock_failures: AtomicU64,
    earn_credits: AtomicU64,
    earn_duplicates: AtomicU64,
    valuation_missing: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub grants: u64,
    pub consumes: u64,
    pub revokes: u64,
    pub trial_units_consumed: u64,
    pub provenance_failures: u64,
    pub idempotent_replays: u64,
    pub idempotent_conflicts: u64,
    pub draws: u64,
    pub draw_lock_retries: u64,
    pub draw_lock_failures: u64,
    pub earn_credits: u64,
    pub earn_duplicates: u64,
    pub valuation_missing: u64,
}

impl EconomyMetrics {
    pub fn inc_grants(&self) {
        self.grants.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_consumes(&self) {
        self.consumes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_revokes(&self) {
        self.revokes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_trial_units_consumed(&self, units: u64) {
        self.trial_units_consumed.fetch_add(units, Ordering::Relaxed);
    }

    pub fn inc_provenance_failures(&self) {
        self.provenance_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_idempotent_replays(&self) {
        self.idempotent_replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_idempotent_conflicts(&self) {
        self.idempotent_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_draws(&self) {
        self.draws.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_draw_lock_retries(&self) {
        self.draw_lock_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_draw_lock_failures(&self) {
        self.draw_lock_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_earn_credits(&self) {
        self.earn_credits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_earn_duplicates(&self) {
        self.earn_duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_valuation_missing(&self) {
        self.valuation_missing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            grants: self.grants.load(Ordering::Relaxed),
            consumes: self.consumes.load(Ordering::Relaxed),
            revokes: self.revokes.load(Ordering::Relaxed),
            trial_units_consumed: self.trial_units_consumed.load(Ordering::Relaxed),
            provenance_failures: self.provenance_failures.load(Ordering::Relaxed),
            idempotent_replays: self.idempotent_replays.load(Ordering::Relaxed),
            idempotent_conflicts: self.idempotent_conflicts.load(Ordering::Relaxed),
            draws: self.draws.load(Ordering::Relaxed),
            draw_lock_retries: self.draw_lock_retries.load(Ordering::Relaxed),
            draw_lock_failures: self.draw_lock_failures.load(Ordering::Relaxed),
            earn_credits: self.earn_credits.load(Ordering::Relaxed),
            earn_duplicates: self.earn_duplicates.load(Ordering::Relaxed),
            valuation_missing: self.valuation_missing.load(Ordering::Relaxed),
        }
    }
}
