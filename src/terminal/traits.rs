//! Connection-agnostic interface to a trading terminal.
//!
//! The replication engine only ever talks to accounts through this trait:
//! - [`super::BridgeClient`] speaks HTTP to a terminal bridge process
//! - [`super::MockTerminal`] keeps positions in memory
//! - [`super::TerminalHandle`] serializes calls to any of the above

use super::error::TerminalError;
use super::types::{OpenRequest, PositionId, ProviderPosition};
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Operations the engine needs from one trading account.
///
/// Implementations are not required to be reentrant; callers that share a
/// connection must go through a [`super::TerminalHandle`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TerminalClient: Send + Sync {
    /// All positions currently open on the account.
    async fn snapshot(&self) -> Result<Vec<ProviderPosition>, TerminalError>;

    /// Open a market position, returning the new position ticket.
    async fn open(&self, request: &OpenRequest) -> Result<PositionId, TerminalError>;

    /// Replace the protective levels of an open position.
    async fn modify(
        &self,
        position_id: PositionId,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<(), TerminalError>;

    /// Close an open position in full.
    async fn close(&self, position_id: PositionId) -> Result<(), TerminalError>;
}
