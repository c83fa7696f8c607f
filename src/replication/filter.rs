//! Per-receiver filtering and sizing.
//!
//! Pure functions: a provider position plus a receiver's [`FilterConfig`]
//! yields either the order to place or the reason to skip. A rejection is
//! final for that (position, receiver) pair.

use crate::config::FilterConfig;
use crate::terminal::{ProviderPosition, Side};
use crate::utils::round_down_to_lot;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::fmt;

/// Order parameters for one receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct SizedOrder {
    pub symbol: String,
    pub volume: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    ReceiverDisabled,
    SymbolNotAllowed(String),
    SymbolDenied(String),
    SideDisabled(Side),
    PositionTooOld { age_minutes: i64, limit: u32 },
    VolumeBelowMinimum { volume: Decimal, minimum: Decimal },
    MaxOpenPositions { limit: usize },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::ReceiverDisabled => write!(f, "receiver disabled"),
            RejectReason::SymbolNotAllowed(symbol) => write!(f, "{} not in allow list", symbol),
            RejectReason::SymbolDenied(symbol) => write!(f, "{} is denied", symbol),
            RejectReason::SideDisabled(side) => write!(f, "{} trades not copied", side),
            RejectReason::PositionTooOld { age_minutes, limit } => {
                write!(f, "position is {}m old (limit {}m)", age_minutes, limit)
            }
            RejectReason::VolumeBelowMinimum { volume, minimum } => {
                write!(f, "volume {} below minimum {}", volume, minimum)
            }
            RejectReason::MaxOpenPositions { limit } => {
                write!(f, "already tracking {} positions", limit)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterDecision {
    Accept(SizedOrder),
    Reject(RejectReason),
}

/// Decide whether and how `position` is copied to a receiver.
///
/// `open_count` is the number of live links the receiver already has.
pub fn evaluate(
    position: &ProviderPosition,
    filter: &FilterConfig,
    open_count: usize,
    now: DateTime<Utc>,
) -> FilterDecision {
    let symbol = &position.symbol;

    if !filter.allowed_symbols.is_empty() && !filter.allowed_symbols.contains(symbol) {
        return FilterDecision::Reject(RejectReason::SymbolNotAllowed(symbol.clone()));
    }
    if filter.denied_symbols.contains(symbol) {
        return FilterDecision::Reject(RejectReason::SymbolDenied(symbol.clone()));
    }

    let side_enabled = match position.side {
        Side::Buy => filter.copy_buy,
        Side::Sell => filter.copy_sell,
    };
    if !side_enabled {
        return FilterDecision::Reject(RejectReason::SideDisabled(position.side));
    }

    if filter.max_position_age_minutes > 0 {
        let age = now - position.opened_at;
        if age > Duration::minutes(filter.max_position_age_minutes as i64) {
            return FilterDecision::Reject(RejectReason::PositionTooOld {
                age_minutes: age.num_minutes(),
                limit: filter.max_position_age_minutes,
            });
        }
    }

    if let Some(limit) = filter.max_open_positions {
        if open_count >= limit {
            return FilterDecision::Reject(RejectReason::MaxOpenPositions { limit });
        }
    }

    let volume = match size_volume(position.volume, filter) {
        Ok(volume) => volume,
        Err(reason) => return FilterDecision::Reject(reason),
    };

    let (stop_loss, take_profit) = protective_levels(position, filter);

    FilterDecision::Accept(SizedOrder {
        symbol: map_symbol(symbol, filter),
        volume,
        stop_loss,
        take_profit,
    })
}

/// Receiver symbol for a provider symbol.
pub fn map_symbol(symbol: &str, filter: &FilterConfig) -> String {
    filter
        .symbol_map
        .get(symbol)
        .cloned()
        .unwrap_or_else(|| symbol.to_string())
}

/// Scale, floor to the lot step, then apply the bounds.
fn size_volume(provider_volume: Decimal, filter: &FilterConfig) -> Result<Decimal, RejectReason> {
    let raw = filter
        .fixed_volume
        .unwrap_or(provider_volume * filter.volume_multiplier);
    let mut volume = round_down_to_lot(raw, filter.lot_step);

    if volume <= Decimal::ZERO || volume < filter.min_volume {
        return Err(RejectReason::VolumeBelowMinimum {
            volume: volume.normalize(),
            minimum: filter.min_volume,
        });
    }
    if let Some(max) = filter.max_volume {
        volume = volume.min(max);
    }
    Ok(volume.normalize())
}

/// Receiver stop loss / take profit for a provider position.
pub fn protective_levels(
    position: &ProviderPosition,
    filter: &FilterConfig,
) -> (Option<Decimal>, Option<Decimal>) {
    let stop_loss = position
        .stop_loss
        .map(|level| adjust_level(level, position, filter.sl_offset, filter, true));
    let take_profit = position
        .take_profit
        .map(|level| adjust_level(level, position, filter.tp_offset, filter, false));
    (stop_loss, take_profit)
}

fn adjust_level(
    level: Decimal,
    position: &ProviderPosition,
    offset: Decimal,
    filter: &FilterConfig,
    is_stop: bool,
) -> Decimal {
    let scaled = position.open_price + (level - position.open_price) * filter.protective_distance_scale;
    // Stops sit against the trade, targets with it.
    let widened = match (position.side, is_stop) {
        (Side::Buy, true) | (Side::Sell, false) => scaled - offset,
        (Side::Buy, false) | (Side::Sell, true) => scaled + offset,
    };
    widened.normalize()
}
