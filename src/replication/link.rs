//! Copy links: one per (provider position, target account) pair.
//!
//! All state changes go through the transition methods below, which
//! enforce the lifecycle:
//!
//! ```text
//! PENDING_OPEN ──open ok──▶ OPEN ──close──▶ PENDING_CLOSE ──close ok──▶ CLOSED
//!      │                                          │
//!      ├──closed before open──▶ CLOSED            └──exhausted/permanent──▶ FAILED
//!      └──exhausted/permanent──▶ FAILED
//! ```
//!
//! A receiver ticket is held exactly while the link is OPEN or
//! PENDING_CLOSE, and CLOSED/FAILED are final.

use crate::terminal::{PositionId, ProviderPosition, Side, COPY_COMMENT_PREFIX, DUPLICATE_COMMENT_PREFIX};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Account a link copies onto.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LinkTarget {
    Receiver(String),
    /// The provider account itself (duplicate trade).
    ProviderDuplicate,
}

impl LinkTarget {
    pub fn receiver(account_id: impl Into<String>) -> Self {
        LinkTarget::Receiver(account_id.into())
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, LinkTarget::ProviderDuplicate)
    }
}

impl fmt::Display for LinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkTarget::Receiver(account) => write!(f, "receiver:{}", account),
            LinkTarget::ProviderDuplicate => write!(f, "duplicate"),
        }
    }
}

impl FromStr for LinkTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "duplicate" {
            return Ok(LinkTarget::ProviderDuplicate);
        }
        match s.strip_prefix("receiver:") {
            Some(account) if !account.is_empty() => Ok(LinkTarget::receiver(account)),
            _ => Err(format!("unknown link target: {s}")),
        }
    }
}

/// Identity of a link: provider position plus target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkKey {
    pub provider_position_id: PositionId,
    pub target: LinkTarget,
}

impl LinkKey {
    pub fn new(provider_position_id: PositionId, target: LinkTarget) -> Self {
        Self {
            provider_position_id,
            target,
        }
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}→{}", self.provider_position_id, self.target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    PendingOpen,
    Open,
    PendingClose,
    Closed,
    Failed,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::PendingOpen => "PENDING_OPEN",
            LinkState::Open => "OPEN",
            LinkState::PendingClose => "PENDING_CLOSE",
            LinkState::Closed => "CLOSED",
            LinkState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Closed | LinkState::Failed)
    }

    /// Whether the target account holds (or may hold) a position for this link.
    pub fn holds_receiver_position(&self) -> bool {
        matches!(self, LinkState::Open | LinkState::PendingClose)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING_OPEN" => Ok(LinkState::PendingOpen),
            "OPEN" => Ok(LinkState::Open),
            "PENDING_CLOSE" => Ok(LinkState::PendingClose),
            "CLOSED" => Ok(LinkState::Closed),
            "FAILED" => Ok(LinkState::Failed),
            other => Err(format!("unknown link state: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("link {key} is {state} and cannot change")]
    Terminal { key: LinkKey, state: LinkState },

    #[error("link {key}: cannot {action} while {state}")]
    Invalid {
        key: LinkKey,
        state: LinkState,
        action: &'static str,
    },
}

/// What beginning a close means for a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Send a close for this receiver ticket.
    Send(PositionId),
    /// The open was never confirmed; the link is closed without a call.
    Cancelled,
    /// Already CLOSED or FAILED.
    Noop,
}

/// Replication record for one provider position on one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyLink {
    pub key: LinkKey,
    pub receiver_position_id: Option<PositionId>,
    pub state: LinkState,
    /// Symbol on the target account (after mapping)
    pub symbol: String,
    pub side: Side,
    /// Volume requested on the target account
    pub volume: Decimal,
    /// Desired protective levels on the target account
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub last_error: Option<String>,
    /// Attempts of the current open or close
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Open time of the provider trade this link copies; tells a reused
    /// ticket apart from the trade that held it before
    pub provider_opened_at: DateTime<Utc>,
}

impl CopyLink {
    /// New link awaiting its first open attempt.
    pub fn pending_open(
        key: LinkKey,
        symbol: impl Into<String>,
        side: Side,
        volume: Decimal,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            receiver_position_id: None,
            state: LinkState::PendingOpen,
            symbol: symbol.into(),
            side,
            volume,
            stop_loss: None,
            take_profit: None,
            last_error: None,
            attempt_count: 0,
            last_attempt_at: None,
            created_at,
            provider_opened_at: created_at,
        }
    }

    pub fn for_trade_opened_at(mut self, provider_opened_at: DateTime<Utc>) -> Self {
        self.provider_opened_at = provider_opened_at;
        self
    }

    /// Whether this link was made for `position` rather than an earlier
    /// trade on the same ticket.
    pub fn copies(&self, position: &ProviderPosition) -> bool {
        self.key.provider_position_id == position.position_id && self.provider_opened_at == position.opened_at
    }

    pub fn with_protective(mut self, stop_loss: Option<Decimal>, take_profit: Option<Decimal>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    pub fn provider_position_id(&self) -> PositionId {
        self.key.provider_position_id
    }

    pub fn target(&self) -> &LinkTarget {
        &self.key.target
    }

    /// Comment stamped on the target position, used to find it again.
    pub fn comment_tag(&self) -> String {
        let prefix = if self.key.target.is_duplicate() {
            DUPLICATE_COMMENT_PREFIX
        } else {
            COPY_COMMENT_PREFIX
        };
        format!("{}{}", prefix, self.key.provider_position_id)
    }

    fn ensure_live(&self) -> Result<(), TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError::Terminal {
                key: self.key.clone(),
                state: self.state,
            });
        }
        Ok(())
    }

    fn invalid(&self, action: &'static str) -> TransitionError {
        TransitionError::Invalid {
            key: self.key.clone(),
            state: self.state,
            action,
        }
    }

    /// PENDING_OPEN → OPEN with the ticket the target assigned.
    pub fn record_open_success(&mut self, receiver_position_id: PositionId, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_live()?;
        if self.state != LinkState::PendingOpen {
            return Err(self.invalid("record open"));
        }
        self.state = LinkState::Open;
        self.receiver_position_id = Some(receiver_position_id);
        self.last_error = None;
        self.attempt_count = 0;
        self.last_attempt_at = Some(now);
        Ok(())
    }

    /// Count a failed attempt of the current operation; state is unchanged.
    pub fn record_attempt_failure(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_live()?;
        self.attempt_count += 1;
        self.last_error = Some(error.into());
        self.last_attempt_at = Some(now);
        Ok(())
    }

    /// Note an error without touching the attempt count (modify failures).
    pub fn record_error(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.ensure_live()?;
        self.last_error = Some(error.into());
        Ok(())
    }

    /// Replace the desired protective levels.
    pub fn set_protective(&mut self, stop_loss: Option<Decimal>, take_profit: Option<Decimal>) -> Result<(), TransitionError> {
        self.ensure_live()?;
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        Ok(())
    }

    /// Start closing. Idempotent on PENDING_CLOSE and terminal links.
    pub fn begin_close(&mut self) -> Result<CloseAction, TransitionError> {
        match (self.state, self.receiver_position_id) {
            (LinkState::Closed | LinkState::Failed, _) => Ok(CloseAction::Noop),
            (LinkState::PendingOpen, _) => {
                self.state = LinkState::Closed;
                self.receiver_position_id = None;
                Ok(CloseAction::Cancelled)
            }
            (LinkState::Open, Some(ticket)) => {
                self.state = LinkState::PendingClose;
                self.attempt_count = 0;
                self.last_error = None;
                Ok(CloseAction::Send(ticket))
            }
            (LinkState::PendingClose, Some(ticket)) => Ok(CloseAction::Send(ticket)),
            (_, None) => Err(self.invalid("close without a receiver ticket")),
        }
    }

    /// PENDING_CLOSE → CLOSED.
    pub fn record_close_success(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_live()?;
        if self.state != LinkState::PendingClose {
            return Err(self.invalid("record close"));
        }
        self.state = LinkState::Closed;
        self.receiver_position_id = None;
        self.last_error = None;
        self.last_attempt_at = Some(now);
        Ok(())
    }

    /// PENDING_OPEN/PENDING_CLOSE → FAILED. An OPEN link never fails.
    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.ensure_live()?;
        if self.state == LinkState::Open {
            return Err(self.invalid("fail an open link"));
        }
        self.state = LinkState::Failed;
        self.receiver_position_id = None;
        self.last_error = Some(reason.into());
        Ok(())
    }

    /// The ticket invariant holds for this link.
    pub fn is_consistent(&self) -> bool {
        self.state.holds_receiver_position() == self.receiver_position_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn link() -> CopyLink {
        CopyLink::pending_open(
            LinkKey::new(77, LinkTarget::receiver("R1")),
            "EURUSD",
            Side::Buy,
            dec!(0.5),
            Utc::now(),
        )
    }

    #[test]
    fn test_happy_path_lifecycle() {
        let mut link = link();
        assert!(link.is_consistent());

        link.record_open_success(9001, Utc::now()).unwrap();
        assert_eq!(link.state, LinkState::Open);
        assert_eq!(link.receiver_position_id, Some(9001));

        assert_eq!(link.begin_close().unwrap(), CloseAction::Send(9001));
        assert_eq!(link.state, LinkState::PendingClose);
        assert!(link.is_consistent());

        link.record_close_success(Utc::now()).unwrap();
        assert_eq!(link.state, LinkState::Closed);
        assert_eq!(link.receiver_position_id, None);
        assert!(link.is_consistent());
    }

    #[test]
    fn test_close_before_open_cancels() {
        let mut link = link();
        link.record_attempt_failure("timeout", Utc::now()).unwrap();
        assert_eq!(link.begin_close().unwrap(), CloseAction::Cancelled);
        assert_eq!(link.state, LinkState::Closed);
        assert_eq!(link.begin_close().unwrap(), CloseAction::Noop);
    }

    #[test]
    fn test_terminal_states_never_move() {
        let mut link = link();
        link.mark_failed("invalid volume").unwrap();
        assert_eq!(link.state, LinkState::Failed);

        assert!(matches!(
            link.record_open_success(1, Utc::now()),
            Err(TransitionError::Terminal { .. })
        ));
        assert!(link.record_attempt_failure("again", Utc::now()).is_err());
        assert!(link.set_protective(Some(dec!(1)), None).is_err());
        assert_eq!(link.begin_close().unwrap(), CloseAction::Noop);
        assert_eq!(link.state, LinkState::Failed);
    }

    #[test]
    fn test_open_link_cannot_fail() {
        let mut link = link();
        link.record_open_success(5, Utc::now()).unwrap();
        assert!(link.mark_failed("modify exhausted").is_err());
        assert_eq!(link.state, LinkState::Open);
    }

    #[test]
    fn test_attempts_reset_per_operation() {
        let mut link = link();
        link.record_attempt_failure("a", Utc::now()).unwrap();
        link.record_attempt_failure("b", Utc::now()).unwrap();
        assert_eq!(link.attempt_count, 2);
        link.record_open_success(5, Utc::now()).unwrap();
        assert_eq!(link.attempt_count, 0);
    }

    #[test]
    fn test_target_and_state_parse() {
        for target in [LinkTarget::receiver("acc-7"), LinkTarget::ProviderDuplicate] {
            assert_eq!(target.to_string().parse::<LinkTarget>(), Ok(target));
        }
        assert!("receiver:".parse::<LinkTarget>().is_err());
        assert_eq!("PENDING_CLOSE".parse::<LinkState>(), Ok(LinkState::PendingClose));
    }

    #[test]
    fn test_comment_tags() {
        let receiver = link();
        assert_eq!(receiver.comment_tag(), "COPY:77");

        let mut duplicate = link();
        duplicate.key.target = LinkTarget::ProviderDuplicate;
        assert_eq!(duplicate.comment_tag(), "DUPLICATE_OF:77");
    }

    #[test]
    fn test_reused_ticket_is_a_different_trade() {
        let first_open = Utc::now() - chrono::Duration::minutes(10);
        let link = link().for_trade_opened_at(first_open);

        let original = ProviderPosition::new(77, "EURUSD", Side::Buy, dec!(1), dec!(1.08), first_open);
        let reused = ProviderPosition::new(77, "EURUSD", Side::Buy, dec!(1), dec!(1.08), Utc::now());
        assert!(link.copies(&original));
        assert!(!link.copies(&reused));
    }
}
