//! Replication dispatcher.
//!
//! Work for one batch happens in three steps:
//! 1. **Plan**: link changes are written to the store (e.g. a new
//!    PENDING_OPEN link is persisted *before* its open is sent) and the
//!    terminal operations to perform are returned.
//! 2. **Execute**: operations run concurrently across connections; calls
//!    to the same connection are serialized by its [`TerminalHandle`].
//! 3. **Apply**: results are fed back through store transitions one at a
//!    time, scheduling retries or failing links as needed.
//!
//! [`TerminalHandle`]: crate::terminal::TerminalHandle

use super::filter::{self, FilterDecision, RejectReason};
use super::link::{CloseAction, CopyLink, LinkKey, LinkState, LinkTarget};
use super::retry::{OperationKind, RetryDecision, RetryManager};
use super::sltp;
use crate::config::{FilterConfig, ReceiverConfig};
use crate::diagnostics::ReplicationAlert;
use crate::persistence::{PreviousTrade, StateStore, StoreError};
use crate::terminal::{OpenRequest, PositionId, ProviderPosition, TerminalClient, TerminalError};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A receiver account and how trades are copied to it.
#[derive(Clone)]
pub struct ReceiverAccount {
    pub account_id: String,
    pub client: Arc<dyn TerminalClient>,
    pub filter: FilterConfig,
    pub enabled: bool,
    pub magic_number: u64,
    pub deviation_points: u32,
}

impl ReceiverAccount {
    pub fn new(account_id: impl Into<String>, client: Arc<dyn TerminalClient>) -> Self {
        Self::from_config(&ReceiverConfig::new(account_id), client)
    }

    pub fn from_config(config: &ReceiverConfig, client: Arc<dyn TerminalClient>) -> Self {
        Self {
            account_id: config.account_id.clone(),
            client,
            filter: config.filter.clone(),
            enabled: config.enabled,
            magic_number: config.magic_number,
            deviation_points: config.deviation_points,
        }
    }

    pub fn with_filter(mut self, filter: FilterConfig) -> Self {
        self.filter = filter;
        self
    }
}

/// Order settings for provider duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateSettings {
    pub magic_number: u64,
    pub deviation_points: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Which broker codes are worth retrying, per target kind.
#[derive(Debug, Clone, Default)]
pub struct ErrorPolicy {
    receiver_codes: HashSet<i32>,
    duplicate_codes: HashSet<i32>,
}

impl ErrorPolicy {
    pub fn new(
        receiver_codes: impl IntoIterator<Item = i32>,
        duplicate_codes: impl IntoIterator<Item = i32>,
    ) -> Self {
        Self {
            receiver_codes: receiver_codes.into_iter().collect(),
            duplicate_codes: duplicate_codes.into_iter().collect(),
        }
    }

    /// Timeouts and dropped connections are always transient; a broker
    /// code is permanent only if it is configured as non-retryable.
    pub fn classify(&self, target: &LinkTarget, error: &TerminalError) -> ErrorClass {
        let codes = if target.is_duplicate() {
            &self.duplicate_codes
        } else {
            &self.receiver_codes
        };
        match error.code() {
            Some(code) if codes.contains(&code) => ErrorClass::Permanent,
            _ => ErrorClass::Transient,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationRequest {
    /// `reconcile` first looks for a position already carrying the link's
    /// comment tag and adopts it instead of opening another.
    Open { request: OpenRequest, reconcile: bool },
    Modify {
        position_id: PositionId,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    },
    Close { position_id: PositionId },
}

/// A terminal call on behalf of one link.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub key: LinkKey,
    pub request: OperationRequest,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self.request {
            OperationRequest::Open { .. } => OperationKind::Open,
            OperationRequest::Modify { .. } => OperationKind::Modify,
            OperationRequest::Close { .. } => OperationKind::Close,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutput {
    Opened { position_id: PositionId, adopted: bool },
    Modified,
    /// `already_gone` when the target no longer had the position.
    Closed { already_gone: bool },
}

pub type OperationResult = (Operation, Result<OperationOutput, TerminalError>);

/// Counters and alerts accumulated while dispatching.
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub opened: usize,
    pub adopted: usize,
    pub modified: usize,
    pub closed: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub retries_scheduled: usize,
    pub failed: usize,
    pub store_errors: usize,
    pub alerts: Vec<ReplicationAlert>,
}

impl DispatchStats {
    pub(crate) fn record_store_error(&mut self, action: &str, error: &StoreError) {
        self.store_errors += 1;
        warn!(action, error = %error, "State store write failed");
        self.alerts.push(ReplicationAlert::persistence_failure(action, error));
    }

    /// Whether anything reached a terminal or changed a link.
    pub fn has_activity(&self) -> bool {
        self.opened + self.modified + self.closed + self.cancelled + self.failed + self.retries_scheduled > 0
    }
}

/// Cancel a queued retry and its persisted copy.
pub(crate) fn drop_retry(store: &StateStore, retries: &mut RetryManager, key: &LinkKey) {
    if retries.cancel(key).is_some() {
        if let Err(e) = store.delete_retry_task(key) {
            warn!(link = %key, error = %e, "Failed to delete retry task");
        }
    }
}

pub struct Dispatcher {
    provider: Arc<dyn TerminalClient>,
    receivers: Vec<ReceiverAccount>,
    duplicate: Option<DuplicateSettings>,
    errors: ErrorPolicy,
}

impl Dispatcher {
    pub fn new(provider: Arc<dyn TerminalClient>, receivers: Vec<ReceiverAccount>, errors: ErrorPolicy) -> Self {
        Self {
            provider,
            receivers,
            duplicate: None,
            errors,
        }
    }

    /// Also copy every provider trade onto the provider account.
    pub fn with_duplicates(mut self, settings: DuplicateSettings) -> Self {
        self.duplicate = Some(settings);
        self
    }

    /// Enable or disable a receiver; returns `false` if it is unknown.
    pub fn set_receiver_enabled(&mut self, account_id: &str, enabled: bool) -> bool {
        match self.receivers.iter_mut().find(|r| r.account_id == account_id) {
            Some(receiver) => {
                if receiver.enabled != enabled {
                    info!(receiver = %account_id, enabled, "Receiver toggled");
                }
                receiver.enabled = enabled;
                true
            }
            None => false,
        }
    }

    fn receiver(&self, account_id: &str) -> Option<&ReceiverAccount> {
        self.receivers.iter().find(|r| r.account_id == account_id)
    }

    fn client_for(&self, target: &LinkTarget) -> Option<&Arc<dyn TerminalClient>> {
        match target {
            LinkTarget::Receiver(account) => self.receiver(account).map(|r| &r.client),
            LinkTarget::ProviderDuplicate => Some(&self.provider),
        }
    }

    /// Current provider positions.
    pub async fn provider_snapshot(&self) -> Result<Vec<ProviderPosition>, TerminalError> {
        self.provider.snapshot().await
    }

    /// Receiver-side protective levels for `position` on `target`.
    pub fn protective_for(
        &self,
        target: &LinkTarget,
        position: &ProviderPosition,
    ) -> Option<(Option<Decimal>, Option<Decimal>)> {
        match target {
            LinkTarget::Receiver(account) => self
                .receiver(account)
                .map(|r| filter::protective_levels(position, &r.filter)),
            LinkTarget::ProviderDuplicate => Some((position.stop_loss, position.take_profit)),
        }
    }

    // ==================== Planning ====================

    /// Create PENDING_OPEN links for a newly observed provider position.
    ///
    /// A key that already has a link for this trade (in any state) is left
    /// alone, so a replayed Opened never opens twice. Links left on the
    /// ticket by an earlier trade are retired first; while any of them is
    /// still closing the open waits.
    pub fn plan_open(
        &self,
        store: &mut StateStore,
        position: &ProviderPosition,
        now: DateTime<Utc>,
        stats: &mut DispatchStats,
    ) -> Vec<Operation> {
        let mut operations = Vec::new();

        match store.retire_previous_trade(position, now) {
            Ok(PreviousTrade::Settling) => {
                info!(
                    position = position.position_id,
                    "⏳ Ticket reused while earlier copies are closing, open deferred"
                );
                return operations;
            }
            Ok(PreviousTrade::None | PreviousTrade::Archived(_)) => {}
            Err(e) => {
                stats.record_store_error("retire previous trade", &e);
                return operations;
            }
        }

        for receiver in &self.receivers {
            let key = LinkKey::new(position.position_id, LinkTarget::receiver(&receiver.account_id));
            if store.link(&key).is_some() {
                debug!(link = %key, "Already linked, open skipped");
                continue;
            }

            let decision = if receiver.enabled {
                filter::evaluate(position, &receiver.filter, store.live_count(&key.target), now)
            } else {
                FilterDecision::Reject(RejectReason::ReceiverDisabled)
            };
            let order = match decision {
                FilterDecision::Accept(order) => order,
                FilterDecision::Reject(reason) => {
                    stats.skipped += 1;
                    info!(
                        receiver = %receiver.account_id,
                        position = position.position_id,
                        symbol = %position.symbol,
                        %reason,
                        "⏭️  Copy skipped"
                    );
                    continue;
                }
            };

            let link = CopyLink::pending_open(key, order.symbol, position.side, order.volume, now)
                .for_trade_opened_at(position.opened_at)
                .with_protective(order.stop_loss, order.take_profit);
            operations.extend(self.create_and_open(store, link, stats));
        }

        if self.duplicate.is_some() && !position.is_engine_duplicate() {
            let key = LinkKey::new(position.position_id, LinkTarget::ProviderDuplicate);
            if store.link(&key).is_none() {
                let link = CopyLink::pending_open(
                    key,
                    position.symbol.clone(),
                    position.side,
                    position.volume,
                    now,
                )
                .for_trade_opened_at(position.opened_at)
                .with_protective(position.stop_loss, position.take_profit);
                operations.extend(self.create_and_open(store, link, stats));
            }
        }

        operations
    }

    fn create_and_open(
        &self,
        store: &mut StateStore,
        link: CopyLink,
        stats: &mut DispatchStats,
    ) -> Option<Operation> {
        let operation = self.open_operation(&link, false)?;
        match store.insert_link(link) {
            Ok(true) => Some(operation),
            Ok(false) => None,
            Err(e) => {
                stats.record_store_error("create link", &e);
                None
            }
        }
    }

    fn open_operation(&self, link: &CopyLink, reconcile: bool) -> Option<Operation> {
        let (magic_number, deviation_points) = match link.target() {
            LinkTarget::Receiver(account) => {
                let receiver = self.receiver(account)?;
                (receiver.magic_number, receiver.deviation_points)
            }
            LinkTarget::ProviderDuplicate => {
                let settings = self.duplicate.as_ref()?;
                (settings.magic_number, settings.deviation_points)
            }
        };

        Some(Operation {
            key: link.key.clone(),
            request: OperationRequest::Open {
                request: OpenRequest {
                    symbol: link.symbol.clone(),
                    side: link.side,
                    volume: link.volume,
                    stop_loss: link.stop_loss,
                    take_profit: link.take_profit,
                    magic_number,
                    deviation_points,
                    comment: link.comment_tag(),
                },
                reconcile,
            },
        })
    }

    /// Begin closing every live link of a provider position.
    ///
    /// Links whose open was never confirmed are cancelled without a call.
    pub fn plan_close(
        &self,
        store: &mut StateStore,
        retries: &mut RetryManager,
        provider_position_id: PositionId,
        stats: &mut DispatchStats,
    ) -> Vec<Operation> {
        let links = store.links_for_position(provider_position_id);
        if links.is_empty() {
            debug!(position = provider_position_id, "Close for untracked position ignored");
            return Vec::new();
        }

        let mut operations = Vec::new();
        for link in links.into_iter().filter(|l| !l.state.is_terminal()) {
            match store.transition(&link.key, |l| l.begin_close()) {
                Ok((_, CloseAction::Cancelled)) => {
                    drop_retry(store, retries, &link.key);
                    stats.cancelled += 1;
                    info!(link = %link.key, "🚫 Pending open cancelled");
                }
                Ok((_, CloseAction::Send(position_id))) => {
                    drop_retry(store, retries, &link.key);
                    operations.push(Operation {
                        key: link.key,
                        request: OperationRequest::Close { position_id },
                    });
                }
                Ok((_, CloseAction::Noop)) => {}
                Err(e) => stats.record_store_error("begin close", &e),
            }
        }
        operations
    }

    /// Operations for every retry task that has come due.
    pub fn retry_operations(
        &self,
        store: &StateStore,
        retries: &mut RetryManager,
        now: DateTime<Utc>,
    ) -> Vec<Operation> {
        let mut operations = Vec::new();

        for task in retries.due(now) {
            let operation = store.link(&task.key).and_then(|link| {
                match (task.kind, link.state, link.receiver_position_id) {
                    (OperationKind::Open, LinkState::PendingOpen, _) => self.open_operation(link, true),
                    (OperationKind::Modify, LinkState::Open, Some(position_id)) => Some(Operation {
                        key: link.key.clone(),
                        request: OperationRequest::Modify {
                            position_id,
                            stop_loss: link.stop_loss,
                            take_profit: link.take_profit,
                        },
                    }),
                    (OperationKind::Close, LinkState::PendingClose, Some(position_id)) => Some(Operation {
                        key: link.key.clone(),
                        request: OperationRequest::Close { position_id },
                    }),
                    _ => None,
                }
            });

            match operation {
                Some(operation) => {
                    debug!(link = %task.key, kind = %task.kind, attempt = task.attempt_count + 1, "Retrying");
                    operations.push(operation);
                }
                None => {
                    warn!(link = %task.key, kind = %task.kind, "Dropping retry task that no longer applies");
                    drop_retry(store, retries, &task.key);
                }
            }
        }

        operations
    }

    // ==================== Execution ====================

    /// Run operations concurrently and pair each with its outcome.
    pub async fn execute(&self, operations: Vec<Operation>) -> Vec<OperationResult> {
        let calls = operations.into_iter().map(|operation| async move {
            let outcome = self.perform(&operation).await;
            (operation, outcome)
        });
        join_all(calls).await
    }

    async fn perform(&self, operation: &Operation) -> Result<OperationOutput, TerminalError> {
        let client = self.client_for(&operation.key.target).ok_or_else(|| {
            TerminalError::Disconnected(format!("no connection configured for {}", operation.key.target))
        })?;

        match &operation.request {
            OperationRequest::Open { request, reconcile } => {
                if *reconcile {
                    let existing = client
                        .snapshot()
                        .await?
                        .into_iter()
                        .find(|p| p.comment == request.comment);
                    if let Some(existing) = existing {
                        return Ok(OperationOutput::Opened {
                            position_id: existing.position_id,
                            adopted: true,
                        });
                    }
                }
                let position_id = client.open(request).await?;
                Ok(OperationOutput::Opened {
                    position_id,
                    adopted: false,
                })
            }
            OperationRequest::Modify {
                position_id,
                stop_loss,
                take_profit,
            } => {
                client.modify(*position_id, *stop_loss, *take_profit).await?;
                Ok(OperationOutput::Modified)
            }
            OperationRequest::Close { position_id } => match client.close(*position_id).await {
                Ok(()) => Ok(OperationOutput::Closed { already_gone: false }),
                Err(TerminalError::PositionNotFound(_)) => Ok(OperationOutput::Closed { already_gone: true }),
                Err(e) => Err(e),
            },
        }
    }

    /// Close provider positions directly (manual close of the originals).
    pub async fn close_provider_positions(&self, position_ids: &[PositionId]) {
        let calls = position_ids.iter().map(|&position_id| async move {
            (position_id, self.provider.close(position_id).await)
        });
        for (position_id, result) in join_all(calls).await {
            match result {
                Ok(()) | Err(TerminalError::PositionNotFound(_)) => {
                    info!(position = position_id, "🔒 Provider position closed")
                }
                Err(e) => error!(position = position_id, error = %e, "Failed to close provider position"),
            }
        }
    }

    // ==================== Applying results ====================

    /// Feed operation outcomes back into link state, one at a time.
    pub fn apply(
        &self,
        store: &mut StateStore,
        retries: &mut RetryManager,
        results: Vec<OperationResult>,
        now: DateTime<Utc>,
        stats: &mut DispatchStats,
    ) {
        for (operation, outcome) in results {
            let key = &operation.key;
            match (operation.kind(), outcome) {
                (OperationKind::Modify, outcome) => {
                    sltp::apply_modify_outcome(store, retries, &self.errors, key, outcome, now, stats)
                }
                (OperationKind::Open, Ok(OperationOutput::Opened { position_id, adopted })) => {
                    self.record_opened(store, retries, key, position_id, adopted, now, stats)
                }
                (OperationKind::Close, Ok(OperationOutput::Closed { already_gone })) => {
                    self.record_closed(store, retries, key, already_gone, now, stats)
                }
                (kind, Err(error)) => self.record_failure(store, retries, key, kind, error, now, stats),
                (kind, Ok(output)) => {
                    warn!(link = %key, %kind, ?output, "Unexpected operation output ignored")
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_opened(
        &self,
        store: &mut StateStore,
        retries: &mut RetryManager,
        key: &LinkKey,
        position_id: PositionId,
        adopted: bool,
        now: DateTime<Utc>,
        stats: &mut DispatchStats,
    ) {
        match store.transition(key, |l| l.record_open_success(position_id, now)) {
            Ok((link, ())) => {
                drop_retry(store, retries, key);
                stats.opened += 1;
                if adopted {
                    stats.adopted += 1;
                }
                info!(
                    link = %key,
                    ticket = position_id,
                    symbol = %link.symbol,
                    side = %link.side,
                    volume = %link.volume,
                    adopted,
                    "✅ Copy opened"
                );
            }
            Err(StoreError::Transition(e)) => {
                error!(
                    link = %key,
                    ticket = position_id,
                    error = %e,
                    "Open confirmed for a link that has moved on; target position needs manual review"
                );
            }
            Err(e) => {
                stats.record_store_error("record open", &e);
                // The retry adopts the position by its comment tag.
                let attempts = store.link(key).map_or(1, |l| l.attempt_count + 1);
                self.schedule_retry(store, retries, key, OperationKind::Open, attempts, now, &e.to_string(), stats);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_closed(
        &self,
        store: &mut StateStore,
        retries: &mut RetryManager,
        key: &LinkKey,
        already_gone: bool,
        now: DateTime<Utc>,
        stats: &mut DispatchStats,
    ) {
        match store.transition(key, |l| l.record_close_success(now)) {
            Ok(_) => {
                drop_retry(store, retries, key);
                stats.closed += 1;
                info!(link = %key, already_gone, "🔒 Copy closed");
            }
            Err(StoreError::Transition(e)) => {
                warn!(link = %key, error = %e, "Close result no longer applies");
            }
            Err(e) => {
                stats.record_store_error("record close", &e);
                let attempts = store.link(key).map_or(1, |l| l.attempt_count + 1);
                self.schedule_retry(store, retries, key, OperationKind::Close, attempts, now, &e.to_string(), stats);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_failure(
        &self,
        store: &mut StateStore,
        retries: &mut RetryManager,
        key: &LinkKey,
        kind: OperationKind,
        error: TerminalError,
        now: DateTime<Utc>,
        stats: &mut DispatchStats,
    ) {
        let class = self.errors.classify(&key.target, &error);
        let message = error.to_string();

        let attempts = match store.transition(key, |l| l.record_attempt_failure(message.clone(), now)) {
            Ok((link, ())) => link.attempt_count,
            Err(StoreError::Transition(e)) => {
                warn!(link = %key, error = %e, "Failure for a settled link ignored");
                return;
            }
            Err(e) => {
                stats.record_store_error("record failure", &e);
                store.link(key).map_or(1, |l| l.attempt_count + 1)
            }
        };

        warn!(
            link = %key,
            %kind,
            attempt = attempts,
            error = %message,
            class = ?class,
            "⚠️  Terminal operation failed"
        );

        match class {
            ErrorClass::Permanent => {
                drop_retry(store, retries, key);
                self.fail_link(store, key, format!("{kind} rejected: {message}"), stats);
                stats
                    .alerts
                    .push(ReplicationAlert::permanent_rejection(key, kind, error.code(), &message));
            }
            ErrorClass::Transient => {
                self.schedule_retry(store, retries, key, kind, attempts, now, &message, stats);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn schedule_retry(
        &self,
        store: &mut StateStore,
        retries: &mut RetryManager,
        key: &LinkKey,
        kind: OperationKind,
        attempts_made: u32,
        now: DateTime<Utc>,
        last_error: &str,
        stats: &mut DispatchStats,
    ) {
        match retries.schedule(key.clone(), kind, attempts_made, now) {
            RetryDecision::Scheduled(task) => {
                stats.retries_scheduled += 1;
                if let Err(e) = store.save_retry_task(&task) {
                    stats.record_store_error("save retry task", &e);
                }
                info!(
                    link = %key,
                    %kind,
                    attempts_made,
                    not_before = %task.not_before,
                    "🔁 Retry scheduled"
                );
            }
            RetryDecision::Exhausted { attempts } => {
                if let Err(e) = store.delete_retry_task(key) {
                    warn!(link = %key, error = %e, "Failed to delete retry task");
                }
                self.fail_link(
                    store,
                    key,
                    format!("{kind} failed after {attempts} attempts: {last_error}"),
                    stats,
                );
                stats
                    .alerts
                    .push(ReplicationAlert::retries_exhausted(key, kind, attempts, last_error));
            }
        }
    }

    fn fail_link(&self, store: &mut StateStore, key: &LinkKey, reason: String, stats: &mut DispatchStats) {
        let held = store.link(key).and_then(|l| l.receiver_position_id);
        match store.transition(key, |l| l.mark_failed(reason.clone())) {
            Ok(_) => {
                stats.failed += 1;
                error!(link = %key, reason = %reason, receiver_ticket = ?held, "❌ Link failed");
            }
            Err(e) => stats.record_store_error("fail link", &e),
        }
    }
}
