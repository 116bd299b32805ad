//! Vault accrual vocabulary: earn identities, multiplier windows, valuations.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{Reward, TypesError, UserId};

/// Basis-point denominator for multiplier factors (10_000 = 1x).
pub const MULTIPLIER_BPS_ONE: u32 = 10_000;

/// Origin of an earn event; first segment of its identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EarnSource {
    Game,
    Mission,
    Trial,
}

impl EarnSource {
    pub const fn as_str(&self) -> &'static str {
        match self {
            EarnSource::Game => "GAME",
            EarnSource::Mission => "MISSION",
            EarnSource::Trial => "TRIAL",
        }
    }
}

/// Deterministic, globally unique earn event identity.
///
/// Rendered as `SOURCE:SUBJECT:LOG_ID`, e.g. `GAME:DICE:42`. Callers must build
/// the same identity when retrying the same event and never reuse one across
/// different events.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EarnIdentity(String);

impl EarnIdentity {
    pub fn new(source: EarnSource, subject: &str, log_id: impl fmt::Display) -> Self {
        Self(format!(
            "{}:{}:{}",
            source.as_str(),
            subject.trim().to_ascii_uppercase(),
            log_id
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EarnIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EarnIdentity {
    type Err = TypesError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let parts: Vec<&str> = trimmed.split(':').collect();
        if parts.len() < 3 || parts.iter().any(|part| part.is_empty()) {
            return Err(TypesError::InvalidIdentity(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Tag recorded on each earn event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EarnType {
    GamePlay,
    TrialPlay,
    MissionClaim,
}

impl EarnType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            EarnType::GamePlay => "GAME_PLAY",
            EarnType::TrialPlay => "TRIAL_PLAY",
            EarnType::MissionClaim => "MISSION_CLAIM",
        }
    }

    pub const fn source(&self) -> EarnSource {
        match self {
            EarnType::GamePlay => EarnSource::Game,
            EarnType::TrialPlay => EarnSource::Trial,
            EarnType::MissionClaim => EarnSource::Mission,
        }
    }
}

impl FromStr for EarnType {
    type Err = TypesError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "GAME_PLAY" => Ok(EarnType::GamePlay),
            "TRIAL_PLAY" => Ok(EarnType::TrialPlay),
            "MISSION_CLAIM" => Ok(EarnType::MissionClaim),
            other => Err(TypesError::UnknownEarnType(other.to_string())),
        }
    }
}

/// Persisted record of one vault credit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EarnEvent {
    pub identity: EarnIdentity,
    pub user: UserId,
    /// Amount actually credited (after multiplier, 0 when valuation was missing).
    pub amount: u64,
    pub earn_type: EarnType,
    pub payout: Value,
    pub created_at_ms: u64,
}

/// Per-user vault balances.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultState {
    pub user: UserId,
    pub locked_balance: u64,
    pub available_balance: u64,
    pub locked_expires_at_ms: Option<u64>,
    pub updated_at_ms: u64,
}

/// Time-boxed multiplier, in effect for `starts_at_ms <= now <= ends_at_ms`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiplierWindow {
    pub factor_bps: u32,
    pub starts_at_ms: u64,
    pub ends_at_ms: u64,
}

impl MultiplierWindow {
    pub fn validate(&self) -> Result<(), TypesError> {
        if self.factor_bps == 0 {
            return Err(TypesError::InvalidMultiplier("factor_bps must be > 0".to_string()));
        }
        if self.starts_at_ms > self.ends_at_ms {
            return Err(TypesError::InvalidMultiplier(format!(
                "window starts after it ends ({} > {})",
                self.starts_at_ms, self.ends_at_ms
            )));
        }
        Ok(())
    }

    pub fn is_active(&self, now_ms: u64) -> bool {
        self.starts_at_ms <= now_ms && now_ms <= self.ends_at_ms
    }

    /// Scale `amount` by the factor, rounding down.
    pub fn apply(&self, amount: u64) -> u64 {
        let scaled = u128::from(amount) * u128::from(self.factor_bps) / u128::from(MULTIPLIER_BPS_ONE);
        u64::try_from(scaled).unwrap_or(u64::MAX)
    }
}

/// How a reward converts into vault points.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Valuation {
    /// The reward is numeric already.
    Direct(u64),
    /// Looked up in the valuation table.
    Mapped { key: String, points: u64 },
    /// Non-numeric reward without a table entry.
    Missing { key: String },
}

/// `"KIND:AMOUNT" -> points` table for non-numeric rewards.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValuationTable(BTreeMap<String, u64>);

impl ValuationTable {
    pub fn new(entries: BTreeMap<String, u64>) -> Self {
        Self(entries)
    }

    pub fn insert(&mut self, key: impl Into<String>, points: u64) {
        self.0.insert(key.into(), points);
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        self.0.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn value_of(&self, reward: &Reward) -> Valuation {
        match reward {
            Reward::Points { amount } => Valuation::Direct(*amount),
            Reward::Nothing => Valuation::Direct(0),
            Reward::Token { .. } | Reward::Item { .. } => {
                // Both variants always yield a key.
                let key = reward.valuation_key().unwrap_or_default();
                match self.get(&key) {
                    Some(points) => Valuation::Mapped { key, points },
                    None => Valuation::Missing { key },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TokenKind;

    #[test]
    fn identity_renders_source_subject_log() {
        let identity = EarnIdentity::new(EarnSource::Game, "dice", 42);
        assert_eq!(identity.as_str(), "GAME:DICE:42");
        assert_eq!("GAME:DICE:42".parse::<EarnIdentity>(), Ok(identity));
    }

    #[test]
    fn identity_rejects_missing_segments() {
        assert!("GAME:DICE".parse::<EarnIdentity>().is_err());
        assert!("GAME::42".parse::<EarnIdentity>().is_err());
    }

    #[test]
    fn multiplier_window_is_inclusive() {
        let window = MultiplierWindow {
            factor_bps: 20_000,
            starts_at_ms: 100,
            ends_at_ms: 200,
        };
        assert!(!window.is_active(99));
        assert!(window.is_active(100));
        assert!(window.is_active(200));
        assert!(!window.is_active(201));
        assert_eq!(window.apply(150), 300);
    }

    #[test]
    fn multiplier_rounds_down() {
        let window = MultiplierWindow {
            factor_bps: 15_000,
            starts_at_ms: 0,
            ends_at_ms: 0,
        };
        assert_eq!(window.apply(3), 4);
    }

    #[test]
    fn multiplier_validation() {
        let mut window = MultiplierWindow {
            factor_bps: 0,
            starts_at_ms: 0,
            ends_at_ms: 10,
        };
        assert!(window.validate().is_err());
        window.factor_bps = 10_000;
        assert!(window.validate().is_ok());
        window.starts_at_ms = 11;
        assert!(window.validate().is_err());
    }

    #[test]
    fn valuation_lookup() {
        let mut table = ValuationTable::default();
        table.insert("DIAMOND:5", 500);
        assert_eq!(
            table.value_of(&Reward::Points { amount: 7 }),
            Valuation::Direct(7)
        );
        assert_eq!(
            table.value_of(&Reward::Token {
                kind: TokenKind::Diamond,
                amount: 5
            }),
            Valuation::Mapped {
                key: "DIAMOND:5".to_string(),
                points: 500
            }
        );
        assert_eq!(
            table.value_of(&Reward::Item {
                sku: "MUG".to_string(),
                quantity: 1
            }),
            Valuation::Missing {
                key: "ITEM:MUG:1".to_string()
            }
        );
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn identity_parses_its_own_rendering(subject in "[a-z]{1,12}", log_id in any::<u64>()) {
                let identity = EarnIdentity::new(EarnSource::Mission, &subject, log_id);
                prop_assert_eq!(identity.as_str().parse::<EarnIdentity>(), Ok(identity.clone()));
                prop_assert!(identity.as_str().starts_with("MISSION:"));
            }

            #[test]
            fn unit_multiplier_is_identity(amount in any::<u64>()) {
                let window = MultiplierWindow {
                    factor_bps: MULTIPLIER_BPS_ONE,
                    starts_at_ms: 0,
                    ends_at_ms: 0,
                };
                prop_assert_eq!(window.apply(amount), amount);
            }

            #[test]
            fn multiplier_is_monotonic(amount in 0u64..1_000_000, factor_bps in 1u32..100_000) {
                let window = MultiplierWindow { factor_bps, starts_at_ms: 0, ends_at_ms: 0 };
                prop_assert!(window.apply(amount) <= window.apply(amount + 1));
            }
        }
    }
}
