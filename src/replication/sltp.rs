//! Stop-loss / take-profit synchronization.
//!
//! When the provider moves its protective levels, every live link of the
//! position gets the recomputed receiver-side levels. Links still waiting
//! on their open just remember the new levels so the eventual open (or its
//! retry) carries them; OPEN links get a modify call.
//!
//! Modify failures never change the link's state: the copy stays OPEN with
//! whatever levels the target last accepted.

use super::dispatcher::{drop_retry, DispatchStats, Dispatcher, ErrorClass, ErrorPolicy, Operation, OperationOutput, OperationRequest};
use super::link::{LinkKey, LinkState};
use super::retry::{OperationKind, RetryDecision, RetryManager};
use crate::diagnostics::ReplicationAlert;
use crate::persistence::{StateStore, StoreError};
use crate::terminal::{ProviderPosition, TerminalError};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// Modify operations for a provider position whose levels changed.
pub fn plan_modify(
    dispatcher: &Dispatcher,
    store: &mut StateStore,
    position: &ProviderPosition,
    stats: &mut DispatchStats,
) -> Vec<Operation> {
    let mut operations = Vec::new();

    for link in store.links_for_position(position.position_id) {
        if !matches!(link.state, LinkState::PendingOpen | LinkState::Open) {
            continue;
        }
        let Some((stop_loss, take_profit)) = dispatcher.protective_for(link.target(), position) else {
            warn!(link = %link.key, "No connection configured for link, modify skipped");
            continue;
        };
        if link.stop_loss == stop_loss && link.take_profit == take_profit {
            continue;
        }

        if let Err(e) = store.transition(&link.key, |l| l.set_protective(stop_loss, take_profit)) {
            stats.record_store_error("update protective levels", &e);
            continue;
        }

        match (link.state, link.receiver_position_id) {
            (LinkState::Open, Some(position_id)) => operations.push(Operation {
                key: link.key,
                request: OperationRequest::Modify {
                    position_id,
                    stop_loss,
                    take_profit,
                },
            }),
            _ => debug!(link = %link.key, "Levels updated for pending open"),
        }
    }

    operations
}

/// Record the outcome of a modify call.
pub(crate) fn apply_modify_outcome(
    store: &mut StateStore,
    retries: &mut RetryManager,
    errors: &ErrorPolicy,
    key: &LinkKey,
    outcome: Result<OperationOutput, TerminalError>,
    now: DateTime<Utc>,
    stats: &mut DispatchStats,
) {
    let error = match outcome {
        Ok(_) => {
            if retries.get(key).is_some_and(|task| task.kind == OperationKind::Modify) {
                drop_retry(store, retries, key);
            }
            stats.modified += 1;
            info!(link = %key, "🎯 Protective levels synced");
            return;
        }
        Err(TerminalError::PositionNotFound(ticket)) => {
            warn!(link = %key, ticket, "Position missing on target, modify dropped");
            drop_retry(store, retries, key);
            return;
        }
        Err(error) => error,
    };

    let message = error.to_string();
    match store.transition(key, |l| l.record_error(message.clone())) {
        Ok(_) | Err(StoreError::Transition(_)) => {}
        Err(e) => stats.record_store_error("record modify error", &e),
    }

    if errors.classify(&key.target, &error) == ErrorClass::Permanent {
        drop_retry(store, retries, key);
        warn!(link = %key, error = %message, "Modify rejected, levels left as they were");
        stats.alerts.push(ReplicationAlert::modify_abandoned(key, &message));
        return;
    }

    let attempts_made = retries
        .get(key)
        .filter(|task| task.kind == OperationKind::Modify)
        .map_or(0, |task| task.attempt_count)
        + 1;

    match retries.schedule(key.clone(), OperationKind::Modify, attempts_made, now) {
        RetryDecision::Scheduled(task) => {
            stats.retries_scheduled += 1;
            if let Err(e) = store.save_retry_task(&task) {
                stats.record_store_error("save retry task", &e);
            }
            warn!(link = %key, attempts_made, not_before = %task.not_before, error = %message, "Modify failed, retry scheduled");
        }
        RetryDecision::Exhausted { attempts } => {
            if let Err(e) = store.delete_retry_task(key) {
                warn!(link = %key, error = %e, "Failed to delete retry task");
            }
            warn!(link = %key, attempts, error = %message, "Modify retries exhausted, link stays open");
            stats.alerts.push(ReplicationAlert::modify_abandoned(
                key,
                &format!("gave up after {attempts} attempts: {message}"),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::dispatcher::ReceiverAccount;
    use crate::replication::link::LinkTarget;
    use crate::replication::retry::BackoffPolicy;
    use crate::config::FilterConfig;
    use crate::terminal::mock::{CallKind, RecordedCall};
    use crate::terminal::{MockTerminal, Side};
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    struct Fixture {
        r1: Arc<MockTerminal>,
        dispatcher: Dispatcher,
        store: StateStore,
        retries: RetryManager,
    }

    fn fixture(filter: FilterConfig) -> Fixture {
        let r1 = Arc::new(MockTerminal::new("R1"));
        let dispatcher = Dispatcher::new(
            Arc::new(MockTerminal::new("P")),
            vec![ReceiverAccount::new("R1", r1.clone()).with_filter(filter)],
            ErrorPolicy::new([10016], []),
        );
        Fixture {
            r1,
            dispatcher,
            store: StateStore::in_memory().unwrap(),
            retries: RetryManager::new(
                BackoffPolicy::Fixed(Duration::seconds(30)),
                BackoffPolicy::Fixed(Duration::seconds(30)),
                3,
            ),
        }
    }

    fn position() -> ProviderPosition {
        ProviderPosition::new(1, "EURUSD", Side::Buy, dec!(1), dec!(1.1000), Utc::now())
            .with_stop_loss(dec!(1.0950))
    }

    impl Fixture {
        async fn open(&mut self, position: &ProviderPosition) {
            let mut stats = DispatchStats::default();
            let now = Utc::now();
            let ops = self.dispatcher.plan_open(&mut self.store, position, now, &mut stats);
            let results = self.dispatcher.execute(ops).await;
            self.dispatcher
                .apply(&mut self.store, &mut self.retries, results, now, &mut stats);
        }

        async fn sync(&mut self, position: &ProviderPosition, now: DateTime<Utc>) -> DispatchStats {
            let mut stats = DispatchStats::default();
            let ops = plan_modify(&self.dispatcher, &mut self.store, position, &mut stats);
            let results = self.dispatcher.execute(ops).await;
            self.dispatcher
                .apply(&mut self.store, &mut self.retries, results, now, &mut stats);
            stats
        }

        fn link(&self) -> &crate::replication::CopyLink {
            self.store.link(&LinkKey::new(1, LinkTarget::receiver("R1"))).unwrap()
        }
    }

    #[tokio::test]
    async fn test_modify_propagates_scaled_levels() {
        let filter = FilterConfig {
            protective_distance_scale: dec!(2),
            ..Default::default()
        };
        let mut f = fixture(filter);
        f.open(&position()).await;

        let moved = position().with_stop_loss(dec!(1.0980)).with_take_profit(dec!(1.1100));
        let stats = f.sync(&moved, Utc::now()).await;
        assert_eq!(stats.modified, 1);

        let calls = f.r1.calls().await;
        let Some(RecordedCall::Modify { stop_loss, take_profit, .. }) = calls.last() else {
            panic!("expected a modify");
        };
        assert_eq!(*stop_loss, Some(dec!(1.0960)));
        assert_eq!(*take_profit, Some(dec!(1.1200)));
        assert_eq!(f.link().stop_loss, Some(dec!(1.0960)));
    }

    #[tokio::test]
    async fn test_unchanged_levels_send_nothing() {
        let mut f = fixture(FilterConfig::default());
        f.open(&position()).await;
        f.sync(&position(), Utc::now()).await;
        assert_eq!(f.r1.count(CallKind::Modify).await, 0);
    }

    #[tokio::test]
    async fn test_modify_failure_keeps_link_open() {
        let mut f = fixture(FilterConfig::default());
        f.open(&position()).await;
        f.r1.fail_times(CallKind::Modify, TerminalError::Disconnected("down".into()), 10)
            .await;

        let start = Utc::now();
        let moved = position().with_stop_loss(dec!(1.0990));
        f.sync(&moved, start).await;
        assert_eq!(f.link().state, LinkState::Open);
        assert_eq!(f.retries.len(), 1);

        // Retries run out without touching the link's state.
        for step in 1..=3 {
            let now = start + Duration::seconds(30 * step);
            let mut stats = DispatchStats::default();
            let ops = f.dispatcher.retry_operations(&f.store, &mut f.retries, now);
            let results = f.dispatcher.execute(ops).await;
            f.dispatcher.apply(&mut f.store, &mut f.retries, results, now, &mut stats);
        }
        assert_eq!(f.r1.count(CallKind::Modify).await, 3);
        assert!(f.retries.is_empty());
        assert_eq!(f.link().state, LinkState::Open);
        assert!(f.link().last_error.is_some());
    }

    #[tokio::test]
    async fn test_permanent_modify_rejection_raises_alert() {
        let mut f = fixture(FilterConfig::default());
        f.open(&position()).await;
        f.r1.fail_next(CallKind::Modify, TerminalError::rejected(10016, "invalid stops"))
            .await;

        let stats = f.sync(&position().with_stop_loss(dec!(1.0990)), Utc::now()).await;
        assert_eq!(stats.alerts.len(), 1);
        assert!(f.retries.is_empty());
        assert_eq!(f.link().state, LinkState::Open);
    }

    #[tokio::test]
    async fn test_pending_open_only_records_levels() {
        let mut f = fixture(FilterConfig::default());
        f.r1.fail_next(CallKind::Open, TerminalError::Disconnected("down".into()))
            .await;
        f.open(&position()).await;
        assert_eq!(f.link().state, LinkState::PendingOpen);

        f.sync(&position().with_take_profit(dec!(1.12)), Utc::now()).await;
        assert_eq!(f.r1.count(CallKind::Modify).await, 0);
        assert_eq!(f.link().take_profit, Some(dec!(1.12)));
    }
}
