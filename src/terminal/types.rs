//! Position and order types shared by every terminal implementation.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Broker-assigned position ticket, unique per account.
pub type PositionId = u64;

/// Comment prefix marking a position opened by the engine as a duplicate
/// of a provider trade on the provider's own account.
pub const DUPLICATE_COMMENT_PREFIX: &str = "DUPLICATE_OF:";

/// Comment prefix tagging receiver positions with their provider ticket.
pub const COPY_COMMENT_PREFIX: &str = "COPY:";

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

/// A live position as reported by a terminal snapshot.
///
/// Everything except the protective levels is fixed for the life of the
/// position; `stop_loss`/`take_profit` change in place on modification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderPosition {
    pub position_id: PositionId,
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    pub open_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub comment: String,
}

impl ProviderPosition {
    /// Create a position without protective levels.
    pub fn new(
        position_id: PositionId,
        symbol: impl Into<String>,
        side: Side,
        volume: Decimal,
        open_price: Decimal,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            position_id,
            symbol: symbol.into(),
            side,
            volume,
            open_price,
            stop_loss: None,
            take_profit: None,
            opened_at,
            comment: String::new(),
        }
    }

    pub fn with_stop_loss(mut self, stop_loss: Decimal) -> Self {
        self.stop_loss = Some(stop_loss);
        self
    }

    pub fn with_take_profit(mut self, take_profit: Decimal) -> Self {
        self.take_profit = Some(take_profit);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// Whether the engine itself opened this position as a provider duplicate.
    pub fn is_engine_duplicate(&self) -> bool {
        self.comment.starts_with(DUPLICATE_COMMENT_PREFIX)
    }

    /// Whether the protective levels differ from `other`'s.
    pub fn protective_levels_differ(&self, other: &ProviderPosition) -> bool {
        self.stop_loss != other.stop_loss || self.take_profit != other.take_profit
    }
}

/// Market order request sent to a terminal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenRequest {
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub magic_number: u64,
    pub deviation_points: u32,
    /// Tag identifying the provider position this order copies.
    pub comment: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_round_trips_through_str() {
        assert_eq!("BUY".parse::<Side>(), Ok(Side::Buy));
        assert_eq!(Side::Sell.to_string(), "SELL");
        assert!("LONG".parse::<Side>().is_err());
    }

    #[test]
    fn test_duplicate_detection_uses_comment_prefix() {
        let pos = ProviderPosition::new(1, "EURUSD", Side::Buy, dec!(1), dec!(1.1), Utc::now());
        assert!(!pos.is_engine_duplicate());
        assert!(pos.with_comment("DUPLICATE_OF:77").is_engine_duplicate());
    }

    #[test]
    fn test_protective_levels_differ() {
        let base = ProviderPosition::new(1, "EURUSD", Side::Buy, dec!(1), dec!(1.1), Utc::now());
        let moved = base.clone().with_stop_loss(dec!(1.09));
        assert!(base.protective_levels_differ(&moved));
        assert!(!moved.protective_levels_differ(&moved.clone()));
    }
}
