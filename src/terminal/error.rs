use super::types::PositionId;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single terminal call.
///
/// Broker result codes are carried through untouched; deciding whether a
/// code is worth retrying is the replication layer's job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TerminalError {
    #[error("terminal rejected request (code {code}): {message}")]
    Rejected { code: i32, message: String },

    #[error("terminal call timed out after {0:?}")]
    Timeout(Duration),

    #[error("terminal connection unavailable: {0}")]
    Disconnected(String),

    #[error("position {0} not found on terminal")]
    PositionNotFound(PositionId),
}

impl TerminalError {
    pub fn rejected(code: i32, message: impl Into<String>) -> Self {
        TerminalError::Rejected {
            code,
            message: message.into(),
        }
    }

    /// Broker result code, if the terminal returned one.
    pub fn code(&self) -> Option<i32> {
        match self {
            TerminalError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}
