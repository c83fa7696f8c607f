//! Decimal helpers for lot sizes and price levels.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

/// Decimal places kept when converting terminal floats.
pub const WIRE_PRECISION: u32 = 8;

/// Round down to lot size (volume step).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Convert a float received from a terminal into a decimal.
///
/// Terminals report prices and volumes as doubles; rounding to
/// [`WIRE_PRECISION`] strips binary noise such as `1.1000000000000001`.
pub fn decimal_from_wire(value: f64) -> Decimal {
    Decimal::from_f64(value)
        .unwrap_or_default()
        .round_dp(WIRE_PRECISION)
        .normalize()
}

/// Terminal encoding of an optional protective level (`0.0` means unset).
pub fn level_from_wire(value: f64) -> Option<Decimal> {
    let level = decimal_from_wire(value);
    (level != Decimal::ZERO).then_some(level)
}

/// Inverse of [`level_from_wire`].
pub fn level_to_wire(level: Option<Decimal>) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    level.and_then(|l| l.to_f64()).unwrap_or(0.0)
}
