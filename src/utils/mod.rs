//! Shared utilities.

pub mod decimal;

pub use decimal::{decimal_from_wire, level_from_wire, level_to_wire, round_down_to_lot};
