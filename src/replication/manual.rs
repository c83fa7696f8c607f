//! Operator commands: manual closes and receiver toggles.

use super::dispatcher::{DispatchStats, Dispatcher, Operation};
use super::retry::RetryManager;
use crate::persistence::StateStore;
use crate::terminal::PositionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManualCommand {
    /// Close every copy of one provider position.
    CloseOne(PositionId),
    /// Close every live copy.
    CloseAll,
    /// Start or stop copying new trades to a receiver. Existing copies
    /// keep following the provider either way.
    SetReceiverEnabled { account_id: String, enabled: bool },
}

/// Sends manual commands to a running engine.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<ManualCommand>,
}

impl ControlHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ManualCommand>) -> Self {
        Self { tx }
    }

    pub fn close_one(&self, provider_position_id: PositionId) -> Result<(), mpsc::error::SendError<ManualCommand>> {
        self.tx.send(ManualCommand::CloseOne(provider_position_id))
    }

    pub fn close_all(&self) -> Result<(), mpsc::error::SendError<ManualCommand>> {
        self.tx.send(ManualCommand::CloseAll)
    }

    pub fn set_receiver_enabled(
        &self,
        account_id: impl Into<String>,
        enabled: bool,
    ) -> Result<(), mpsc::error::SendError<ManualCommand>> {
        self.tx.send(ManualCommand::SetReceiverEnabled {
            account_id: account_id.into(),
            enabled,
        })
    }
}

/// What a manual command turns into.
#[derive(Debug, Default)]
pub struct ManualPlan {
    pub operations: Vec<Operation>,
    /// Provider positions to close as well.
    pub provider_positions: Vec<PositionId>,
}

pub struct ManualCloseHandler {
    include_provider: bool,
}

impl ManualCloseHandler {
    pub fn new(include_provider: bool) -> Self {
        Self { include_provider }
    }

    /// Closes for every live link the command covers. Pending opens are
    /// cancelled; links already CLOSED or FAILED produce nothing. A
    /// receiver toggle closes nothing.
    pub fn plan(
        &self,
        dispatcher: &Dispatcher,
        store: &mut StateStore,
        retries: &mut RetryManager,
        command: ManualCommand,
        stats: &mut DispatchStats,
    ) -> ManualPlan {
        let positions: BTreeSet<PositionId> = match &command {
            ManualCommand::CloseOne(position_id) => BTreeSet::from([*position_id]),
            ManualCommand::CloseAll => store.live_links().map(|l| l.provider_position_id()).collect(),
            ManualCommand::SetReceiverEnabled { .. } => return ManualPlan::default(),
        };

        let mut plan = ManualPlan::default();
        for &position_id in &positions {
            plan.operations
                .extend(dispatcher.plan_close(store, retries, position_id, stats));
        }

        if self.include_provider {
            let snapshot = store.last_snapshot();
            plan.provider_positions = match &command {
                ManualCommand::CloseOne(position_id) => {
                    snapshot.contains_key(position_id).then_some(*position_id).into_iter().collect()
                }
                _ => {
                    let mut ids: Vec<PositionId> = snapshot.keys().copied().collect();
                    ids.sort_unstable();
                    ids
                }
            };
        }

        info!(
            ?command,
            positions = positions.len(),
            closes = plan.operations.len(),
            provider_closes = plan.provider_positions.len(),
            "🛑 Manual close"
        );
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::dispatcher::{ErrorPolicy, ReceiverAccount};
    use crate::replication::link::{CopyLink, LinkKey, LinkState, LinkTarget};
    use crate::replication::retry::BackoffPolicy;
    use crate::terminal::{MockTerminal, ProviderPosition, Side};
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn setup() -> (Dispatcher, StateStore, RetryManager) {
        let dispatcher = Dispatcher::new(
            Arc::new(MockTerminal::new("P")),
            vec![ReceiverAccount::new("R1", Arc::new(MockTerminal::new("R1")))],
            ErrorPolicy::default(),
        );
        let retries = RetryManager::new(
            BackoffPolicy::Fixed(Duration::seconds(30)),
            BackoffPolicy::Fixed(Duration::seconds(30)),
            5,
        );
        (dispatcher, StateStore::in_memory().unwrap(), retries)
    }

    fn insert(store: &mut StateStore, id: PositionId, open: bool) {
        let key = LinkKey::new(id, LinkTarget::receiver("R1"));
        store
            .insert_link(CopyLink::pending_open(key.clone(), "EURUSD", Side::Buy, dec!(1), Utc::now()))
            .unwrap();
        if open {
            store
                .transition(&key, |l| l.record_open_success(9000 + id, Utc::now()))
                .unwrap();
        }
    }

    #[test]
    fn test_close_all_covers_every_live_link() {
        let (dispatcher, mut store, mut retries) = setup();
        for id in 1..=5 {
            insert(&mut store, id, true);
        }
        for id in 6..=7 {
            insert(&mut store, id, false);
        }
        insert(&mut store, 8, true);
        let settled = LinkKey::new(8, LinkTarget::receiver("R1"));
        store.transition(&settled, |l| l.begin_close()).unwrap();
        store.transition(&settled, |l| l.record_close_success(Utc::now())).unwrap();

        let mut stats = DispatchStats::default();
        let plan = ManualCloseHandler::new(false).plan(
            &dispatcher,
            &mut store,
            &mut retries,
            ManualCommand::CloseAll,
            &mut stats,
        );

        assert_eq!(plan.operations.len(), 5);
        assert_eq!(stats.cancelled, 2);
        assert!(plan.provider_positions.is_empty());
        assert_eq!(store.live_links().filter(|l| l.state == LinkState::PendingClose).count(), 5);
    }

    #[test]
    fn test_close_one_can_include_provider_position() {
        let (dispatcher, mut store, mut retries) = setup();
        insert(&mut store, 1, true);
        insert(&mut store, 2, true);
        store
            .commit_snapshot(&[
                ProviderPosition::new(1, "EURUSD", Side::Buy, dec!(1), dec!(1.1), Utc::now()),
                ProviderPosition::new(2, "EURUSD", Side::Buy, dec!(1), dec!(1.1), Utc::now()),
            ])
            .unwrap();

        let mut stats = DispatchStats::default();
        let plan = ManualCloseHandler::new(true).plan(
            &dispatcher,
            &mut store,
            &mut retries,
            ManualCommand::CloseOne(1),
            &mut stats,
        );
        assert_eq!(plan.operations.len(), 1);
        assert_eq!(plan.provider_positions, vec![1]);
    }

    #[test]
    fn test_control_handle_delivers_commands() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ControlHandle::new(tx);
        handle.close_one(3).unwrap();
        handle.close_all().unwrap();
        handle.set_receiver_enabled("R2", false).unwrap();
        assert_eq!(rx.try_recv().unwrap(), ManualCommand::CloseOne(3));
        assert_eq!(rx.try_recv().unwrap(), ManualCommand::CloseAll);
        assert_eq!(
            rx.try_recv().unwrap(),
            ManualCommand::SetReceiverEnabled {
                account_id: "R2".to_string(),
                enabled: false
            }
        );
    }
}
