//! Token kinds held in user wallets.
//!
//! Every wallet balance is keyed by `(user, TokenKind)`. The string form is the
//! value persisted in storage and accepted at the boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::TypesError;

/// Fungible in-game currency or ticket kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenKind {
    DiceTicket,
    RouletteTicket,
    LotteryTicket,
    GoldKey,
    DiamondKey,
    Diamond,
}

impl TokenKind {
    pub const ALL: [TokenKind; 6] = [
        TokenKind::DiceTicket,
        TokenKind::RouletteTicket,
        TokenKind::LotteryTicket,
        TokenKind::GoldKey,
        TokenKind::DiamondKey,
        TokenKind::Diamond,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            TokenKind::DiceTicket => "DICE_TICKET",
            TokenKind::RouletteTicket => "ROULETTE_TICKET",
            TokenKind::LotteryTicket => "LOTTERY_TICKET",
            TokenKind::GoldKey => "GOLD_KEY",
            TokenKind::DiamondKey => "DIAMOND_KEY",
            TokenKind::Diamond => "DIAMOND",
        }
    }

    /// Play tickets are the tokens a game consumes per play.
    pub const fn is_play_ticket(&self) -> bool {
        matches!(
            self,
            TokenKind::DiceTicket | TokenKind::RouletteTicket | TokenKind::LotteryTicket
        )
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenKind {
    type Err = TypesError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_uppercase();
        TokenKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| TypesError::UnknownToken(value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("dice_ticket".parse::<TokenKind>(), Ok(TokenKind::DiceTicket));
        assert_eq!(" DIAMOND ".parse::<TokenKind>(), Ok(TokenKind::Diamond));
    }

    #[test]
    fn rejects_unknown_token() {
        assert_eq!(
            "CHIPS".parse::<TokenKind>(),
            Err(TypesError::UnknownToken("CHIPS".to_string()))
        );
    }

    #[test]
    fn serde_matches_storage_form() {
        for kind in TokenKind::ALL {
            let json = serde_json::to_string(&kind).expect("serialize");
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }
}
