//! Reward descriptors attached to draw items and mission claims.
//!
//! Storage and configuration describe a reward as a `(kind, amount)` pair. It is
//! parsed into [`Reward`] once, at the boundary, and every component matches on
//! the enum instead of re-interpreting the kind string.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{TokenKind, TypesError};

/// Descriptor kind for raw vault points.
pub const POINTS_KIND: &str = "POINTS";
/// Descriptor kind for an empty ("try again") outcome.
pub const NOTHING_KIND: &str = "NONE";
/// Descriptor prefix for physical or catalog items (`ITEM:<sku>`).
pub const ITEM_PREFIX: &str = "ITEM:";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reward {
    /// Raw points credited straight to the vault.
    Points { amount: u64 },
    /// Wallet tokens delivered to the user.
    Token { kind: TokenKind, amount: u64 },
    /// A catalog item; its vault value comes from the valuation table.
    Item { sku: String, quantity: u64 },
    Nothing,
}

impl Reward {
    /// Parse a stored `(kind, amount)` descriptor.
    pub fn from_descriptor(kind: &str, amount: u64) -> Result<Self, TypesError> {
        let kind = kind.trim();
        if kind.eq_ignore_ascii_case(NOTHING_KIND) {
            return Ok(Reward::Nothing);
        }
        if kind.eq_ignore_ascii_case(POINTS_KIND) {
            return Ok(Reward::Points { amount });
        }
        if let Some(sku) = kind.strip_prefix(ITEM_PREFIX) {
            if sku.is_empty() {
                return Err(TypesError::InvalidReward(kind.to_string()));
            }
            return Ok(Reward::Item {
                sku: sku.to_string(),
                quantity: amount,
            });
        }
        match kind.parse::<TokenKind>() {
            Ok(token) => Ok(Reward::Token {
                kind: token,
                amount,
            }),
            Err(_) => Err(TypesError::InvalidReward(kind.to_string())),
        }
    }

    /// Inverse of [`Reward::from_descriptor`].
    pub fn descriptor(&self) -> (String, u64) {
        match self {
            Reward::Points { amount } => (POINTS_KIND.to_string(), *amount),
            Reward::Token { kind, amount } => (kind.as_str().to_string(), *amount),
            Reward::Item { sku, quantity } => (format!("{ITEM_PREFIX}{sku}"), *quantity),
            Reward::Nothing => (NOTHING_KIND.to_string(), 0),
        }
    }

    /// Key into the valuation table, `None` when the reward is already numeric
    /// or carries no value.
    pub fn valuation_key(&self) -> Option<String> {
        match self {
            Reward::Points { .. } | Reward::Nothing => None,
            Reward::Token { .. } | Reward::Item { .. } => {
                let (kind, amount) = self.descriptor();
                Some(format!("{kind}:{amount}"))
            }
        }
    }
}

impl fmt::Display for Reward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, amount) = self.descriptor();
        write!(f, "{kind}:{amount}")
    }
}
