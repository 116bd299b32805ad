//! Draw pools and their weighted items (roulette segments, lottery prizes).

use serde::{Deserialize, Serialize};

use crate::Reward;

/// Slot count used by the fixed-slot roulette wheel.
pub const ROULETTE_SLOT_COUNT: u32 = 6;

/// A pool of weighted items keyed by an active configuration id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawPool {
    pub id: String,
    /// When set, the pool must hold exactly this many active items.
    pub slot_count: Option<u32>,
}

/// A segment or prize belonging to a [`DrawPool`].
///
/// `weight` and `stock` are signed so that misconfigured rows can be detected
/// and rejected instead of wrapping silently.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedItem {
    pub id: u64,
    pub pool_id: String,
    pub label: String,
    pub reward: Reward,
    pub weight: i64,
    /// `None` means unlimited.
    pub stock: Option<i64>,
    pub active: bool,
}

impl WeightedItem {
    pub fn in_stock(&self) -> bool {
        self.stock.map_or(true, |stock| stock > 0)
    }
}

/// Item definition used when seeding a pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSpec {
    pub label: String,
    pub reward_kind: String,
    #[serde(default)]
    pub reward_amount: u64,
    pub weight: i64,
    #[serde(default)]
    pub stock: Option<i64>,
}

/// Pool definition (e.g. loaded from a YAML file by operators).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub id: String,
    #[serde(default)]
    pub slot_count: Option<u32>,
    pub items: Vec<ItemSpec>,
}
