//! Trading terminal connectivity.
//!
//! ## Bridge
//! HTTP/JSON client for a bridge process that fronts one broker terminal
//! per account (positions, open, modify, close).
//!
//! ## Worker
//! One serialized call queue per connection with a bounded timeout on
//! every call.
//!
//! ## Mock
//! In-memory terminal with scripted failures and call recording, used to
//! drive the engine in tests.

mod bridge;
mod error;
pub mod mock;
mod traits;
mod types;
mod worker;

pub use bridge::BridgeClient;
pub use error::TerminalError;
pub use mock::MockTerminal;
#[cfg(test)]
pub use traits::MockTerminalClient;
pub use traits::TerminalClient;
pub use types::*;
pub use worker::TerminalHandle;
