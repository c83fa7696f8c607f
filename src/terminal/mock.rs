//! In-memory terminal for paper runs and tests.
//!
//! Positions live in a map guarded by a tokio `RwLock`. Failures can be
//! scripted per call kind and every call is recorded, so tests can assert
//! exactly which operations reached an account.

use super::error::TerminalError;
use super::traits::TerminalClient;
use super::types::{OpenRequest, PositionId, ProviderPosition};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Kind of terminal call, used for scripting and counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Snapshot,
    Open,
    Modify,
    Close,
}

/// A call as it reached the mock terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Snapshot,
    Open(OpenRequest),
    Modify {
        position_id: PositionId,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    },
    Close(PositionId),
}

impl RecordedCall {
    pub fn kind(&self) -> CallKind {
        match self {
            RecordedCall::Snapshot => CallKind::Snapshot,
            RecordedCall::Open(_) => CallKind::Open,
            RecordedCall::Modify { .. } => CallKind::Modify,
            RecordedCall::Close(_) => CallKind::Close,
        }
    }
}

/// Mutable state behind the mock.
#[derive(Debug, Default)]
pub struct MockTerminalState {
    pub positions: BTreeMap<PositionId, ProviderPosition>,
    pub calls: Vec<RecordedCall>,
    failures: HashMap<CallKind, VecDeque<TerminalError>>,
}

impl MockTerminalState {
    fn next_failure(&mut self, kind: CallKind) -> Option<TerminalError> {
        self.failures.get_mut(&kind).and_then(|queue| queue.pop_front())
    }
}

/// Terminal that keeps positions in memory.
pub struct MockTerminal {
    account_id: String,
    state: Arc<RwLock<MockTerminalState>>,
    ticket_counter: AtomicU64,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTerminal {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            state: Arc::new(RwLock::new(MockTerminalState::default())),
            ticket_counter: AtomicU64::new(1000),
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Start ticket numbering at `first` (keeps accounts distinguishable).
    pub fn with_first_ticket(self, first: PositionId) -> Self {
        self.ticket_counter.store(first, Ordering::SeqCst);
        self
    }

    /// Simulated round-trip time for every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Place a position directly, as if opened by hand on the terminal.
    pub async fn insert_position(&self, position: ProviderPosition) {
        self.state
            .write()
            .await
            .positions
            .insert(position.position_id, position);
    }

    /// Change protective levels directly, as if modified by hand.
    pub async fn set_protective(
        &self,
        position_id: PositionId,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) {
        if let Some(position) = self.state.write().await.positions.get_mut(&position_id) {
            position.stop_loss = stop_loss;
            position.take_profit = take_profit;
        }
    }

    /// Remove a position directly, as if closed by hand.
    pub async fn remove_position(&self, position_id: PositionId) -> Option<ProviderPosition> {
        self.state.write().await.positions.remove(&position_id)
    }

    /// Fail the next call of `kind` with `error`.
    pub async fn fail_next(&self, kind: CallKind, error: TerminalError) {
        self.fail_times(kind, error, 1).await;
    }

    /// Fail the next `times` calls of `kind` with `error`.
    pub async fn fail_times(&self, kind: CallKind, error: TerminalError, times: usize) {
        let mut state = self.state.write().await;
        let queue = state.failures.entry(kind).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    pub async fn positions(&self) -> Vec<ProviderPosition> {
        self.state.read().await.positions.values().cloned().collect()
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.state.read().await.calls.clone()
    }

    /// Number of recorded calls of `kind`.
    pub async fn count(&self, kind: CallKind) -> usize {
        self.state
            .read()
            .await
            .calls
            .iter()
            .filter(|call| call.kind() == kind)
            .count()
    }

    /// Highest number of calls that were ever executing at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, call: RecordedCall) -> Option<TerminalError> {
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self.state.write().await;
        let kind = call.kind();
        state.calls.push(call);
        state.next_failure(kind)
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TerminalClient for MockTerminal {
    async fn snapshot(&self) -> Result<Vec<ProviderPosition>, TerminalError> {
        let failure = self.enter(RecordedCall::Snapshot).await;
        self.leave();
        if let Some(error) = failure {
            return Err(error);
        }
        Ok(self.positions().await)
    }

    async fn open(&self, request: &OpenRequest) -> Result<PositionId, TerminalError> {
        let failure = self.enter(RecordedCall::Open(request.clone())).await;
        self.leave();
        if let Some(error) = failure {
            return Err(error);
        }

        let ticket = self.ticket_counter.fetch_add(1, Ordering::SeqCst);
        let mut position = ProviderPosition::new(
            ticket,
            request.symbol.clone(),
            request.side,
            request.volume,
            Decimal::ZERO,
            Utc::now(),
        )
        .with_comment(request.comment.clone());
        position.stop_loss = request.stop_loss;
        position.take_profit = request.take_profit;

        self.insert_position(position).await;
        debug!(
            account = %self.account_id,
            ticket,
            symbol = %request.symbol,
            volume = %request.volume,
            "Mock position opened"
        );
        Ok(ticket)
    }

    async fn modify(
        &self,
        position_id: PositionId,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<(), TerminalError> {
        let failure = self
            .enter(RecordedCall::Modify {
                position_id,
                stop_loss,
                take_profit,
            })
            .await;
        self.leave();
        if let Some(error) = failure {
            return Err(error);
        }

        let mut state = self.state.write().await;
        let position = state
            .positions
            .get_mut(&position_id)
            .ok_or(TerminalError::PositionNotFound(position_id))?;
        position.stop_loss = stop_loss;
        position.take_profit = take_profit;
        Ok(())
    }

    async fn close(&self, position_id: PositionId) -> Result<(), TerminalError> {
        let failure = self.enter(RecordedCall::Close(position_id)).await;
        self.leave();
        if let Some(error) = failure {
            return Err(error);
        }

        self.remove_position(position_id)
            .await
            .map(|_| ())
            .ok_or(TerminalError::PositionNotFound(position_id))
    }
}
