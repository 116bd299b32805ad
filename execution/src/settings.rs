use std::sync::{Arc, RwLock};
use vaultline_types::{MultiplierWindow, ValuationTable};

use crate::EconomyError;

/// Externally supplied economy configuration, re-read on every earn call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SettingsSnapshot {
    pub multiplier: Option<MultiplierWindow>,
    pub valuations: ValuationTable,
    /// When set, every vault credit moves the locked expiry to `now + ttl`.
    pub locked_ttl_ms: Option<u64>,
}

/// Source of [`SettingsSnapshot`]s.
pub trait EconomySettings: Send + Sync {
    fn snapshot(&self) -> Result<SettingsSnapshot, EconomyError>;
}

impl<T: EconomySettings + ?Sized> EconomySettings for Arc<T> {
    fn snapshot(&self) -> Result<SettingsSnapshot, EconomyError> {
        (**self).snapshot()
    }
}

/// In-memory settings, updatable at runtime by operators and tests.
#[derive(Debug, Default)]
pub struct StaticSettings {
    inner: RwLock<SettingsSnapshot>,
}

impl StaticSettings {
    pub fn new(snapshot: SettingsSnapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot),
        }
    }

    pub fn replace(&self, snapshot: SettingsSnapshot) {
        *self.write() = snapshot;
    }

    pub fn set_multiplier(&self, multiplier: Option<MultiplierWindow>) {
        self.write().multiplier = multiplier;
    }

    pub fn set_valuation(&self, key: impl Into<String>, points: u64) {
        self.write().valuations.insert(key, points);
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SettingsSnapshot> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl EconomySettings for StaticSettings {
    fn snapshot(&self) -> Result<SettingsSnapshot, EconomyError> {
        let guard = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(guard.clone())
    }
}
