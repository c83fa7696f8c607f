//! Replication engine: the polling loop tying detection, dispatch,
//! retries and persistence together.
//!
//! Each cycle runs these phases in order:
//! 1. Manual commands (in-process and queued in the database)
//! 2. Provider snapshot, diffed against the last committed one
//! 3. Opens, then SL/TP modifies, then closes for the detected events
//! 4. Snapshot commit and archiving of settled links
//! 5. Retries that have come due, then opens for reused tickets whose
//!    earlier copies have now settled
//! 6. Periodic link report and alert emission
//!
//! Each phase awaits all of its operations before the next one starts, so
//! a close can never overtake the open it belongs to.

use super::detector::{self, PositionEvent};
use super::dispatcher::{DispatchStats, Dispatcher, DuplicateSettings, ErrorPolicy, Operation, ReceiverAccount};
use super::link::LinkState;
use super::manual::{ControlHandle, ManualCloseHandler, ManualCommand};
use super::retry::{OperationKind, RetryManager, RetryTask};
use super::sltp;
use crate::config::{Config, ReplicationConfig};
use crate::diagnostics::{AlertLog, LinkReport, ReplicationAlert};
use crate::persistence::{StateStore, StoreError};
use crate::terminal::{PositionId, ProviderPosition, TerminalClient};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Empty provider snapshots in a row before it is worth a log line.
const EMPTY_PROVIDER_NOTICE_CYCLES: u64 = 5;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    pub diagnostics_interval: chrono::Duration,
}

impl EngineSettings {
    pub fn from_config(config: &ReplicationConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            diagnostics_interval: chrono::Duration::seconds(config.diagnostics_interval_secs as i64),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&ReplicationConfig::default())
    }
}

/// What one cycle did.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub cycle: u64,
    /// Provider positions seen, or `None` if the snapshot failed
    pub provider_positions: Option<usize>,
    pub events: usize,
    pub snapshot_committed: bool,
    pub archived: usize,
    pub stats: DispatchStats,
}

/// Build the dispatcher for `config` from already-connected clients.
///
/// `receivers` pairs each configured receiver with its client, in config
/// order.
pub fn build_dispatcher(
    config: &Config,
    provider: Arc<dyn TerminalClient>,
    receivers: Vec<Arc<dyn TerminalClient>>,
) -> Dispatcher {
    let accounts = config
        .receivers
        .iter()
        .zip(receivers)
        .map(|(receiver, client)| ReceiverAccount::from_config(receiver, client))
        .collect();

    let errors = ErrorPolicy::new(
        config.replication.non_retryable_codes.iter().copied(),
        config.replication.duplicate_non_retryable_codes.iter().copied(),
    );

    let dispatcher = Dispatcher::new(provider, accounts, errors);
    if config.replication.duplicate_provider_trades {
        dispatcher.with_duplicates(DuplicateSettings {
            magic_number: config.provider.duplicate_magic_number,
            deviation_points: config.provider.deviation_points,
        })
    } else {
        dispatcher
    }
}

pub struct ReplicationEngine {
    dispatcher: Dispatcher,
    store: StateStore,
    retries: RetryManager,
    manual: ManualCloseHandler,
    settings: EngineSettings,
    commands_tx: mpsc::UnboundedSender<ManualCommand>,
    commands_rx: mpsc::UnboundedReceiver<ManualCommand>,
    alerts: AlertLog,
    cycles: u64,
    empty_provider_cycles: u64,
    provider_down: bool,
    last_report_at: Option<DateTime<Utc>>,
}

impl ReplicationEngine {
    /// Create an engine over `store`, restoring persisted retry tasks.
    ///
    /// Links left mid-operation without a task (a crash between writing
    /// the link and sending its call) get one due immediately; the open
    /// retry adopts a position that did make it to the target.
    pub fn new(
        dispatcher: Dispatcher,
        store: StateStore,
        mut retries: RetryManager,
        manual: ManualCloseHandler,
        settings: EngineSettings,
        now: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        let restored = store.prune_retry_tasks(store.load_retry_tasks()?);
        let restored_count = restored.len();
        for task in restored {
            retries.restore(task);
        }

        let mut recovered = 0;
        for link in store.live_links() {
            if retries.get(&link.key).is_some() {
                continue;
            }
            let kind = match link.state {
                LinkState::PendingOpen => OperationKind::Open,
                LinkState::PendingClose => OperationKind::Close,
                _ => continue,
            };
            retries.restore(RetryTask {
                key: link.key.clone(),
                kind,
                not_before: now,
                attempt_count: link.attempt_count,
            });
            recovered += 1;
        }

        if restored_count + recovered > 0 {
            info!(restored = restored_count, recovered, "🔁 [INIT] Retry queue rebuilt");
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Ok(Self {
            dispatcher,
            store,
            retries,
            manual,
            settings,
            commands_tx,
            commands_rx,
            alerts: AlertLog::default(),
            cycles: 0,
            empty_provider_cycles: 0,
            provider_down: false,
            last_report_at: None,
        })
    }

    /// Engine for `config` using the given clients and store.
    pub fn from_config(
        config: &Config,
        provider: Arc<dyn TerminalClient>,
        receivers: Vec<Arc<dyn TerminalClient>>,
        store: StateStore,
    ) -> Result<Self, StoreError> {
        Self::new(
            build_dispatcher(config, provider, receivers),
            store,
            RetryManager::from_config(&config.replication),
            ManualCloseHandler::new(config.replication.manual_close_includes_provider),
            EngineSettings::from_config(&config.replication),
            Utc::now(),
        )
    }

    pub fn control(&self) -> ControlHandle {
        ControlHandle::new(self.commands_tx.clone())
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn retries(&self) -> &RetryManager {
        &self.retries
    }

    pub fn alerts(&self) -> &AlertLog {
        &self.alerts
    }

    /// Run one replication cycle at `now`.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleReport {
        self.cycles += 1;
        let mut report = CycleReport {
            cycle: self.cycles,
            ..Default::default()
        };

        // ═══════════════════════════════════════════════════════════════
        // PHASE 1: Manual commands
        // ═══════════════════════════════════════════════════════════════
        self.process_commands(now, &mut report.stats).await;

        // ═══════════════════════════════════════════════════════════════
        // PHASE 2-4: Provider changes
        // ═══════════════════════════════════════════════════════════════
        let provider_seen = match self.dispatcher.provider_snapshot().await {
            Ok(positions) => {
                if self.provider_down {
                    info!("✅ [POLL] Provider snapshot available again");
                    self.provider_down = false;
                }
                let positions = detector::without_engine_duplicates(positions);
                report.provider_positions = Some(positions.len());
                self.note_empty_provider(&positions);
                self.replicate(&positions, now, &mut report).await;
                true
            }
            Err(e) => {
                warn!(error = %e, "⚠️  [POLL] Provider snapshot failed, skipping detection");
                if !self.provider_down {
                    report.stats.alerts.push(ReplicationAlert::provider_unavailable(&e));
                    self.provider_down = true;
                }
                false
            }
        };

        // ═══════════════════════════════════════════════════════════════
        // PHASE 5: Retries and deferred opens
        // ═══════════════════════════════════════════════════════════════
        let operations = self.dispatcher.retry_operations(&self.store, &mut self.retries, now);
        self.dispatch(operations, now, &mut report.stats).await;

        if provider_seen {
            let mut operations = Vec::new();
            for position in self.store.reused_tickets() {
                operations.extend(self.dispatcher.plan_open(&mut self.store, &position, now, &mut report.stats));
            }
            self.dispatch(operations, now, &mut report.stats).await;
        }

        // ═══════════════════════════════════════════════════════════════
        // PHASE 6: Diagnostics
        // ═══════════════════════════════════════════════════════════════
        self.maybe_report(now);
        for alert in &report.stats.alerts {
            alert.emit();
            self.alerts.push(alert.clone());
        }

        report
    }

    async fn replicate(&mut self, positions: &[ProviderPosition], now: DateTime<Utc>, report: &mut CycleReport) {
        let events = detector::diff(self.store.last_snapshot(), positions);
        report.events = events.len();

        let mut opened = Vec::new();
        let mut modified = Vec::new();
        let mut closed = Vec::new();
        for event in events {
            debug!(position = event.position_id(), ?event, "Provider change detected");
            match event {
                PositionEvent::Opened(position) => opened.push(position),
                PositionEvent::Modified { position, .. } => modified.push(position),
                PositionEvent::Closed { position_id } => closed.push(position_id),
            }
        }

        // A ticket closed and reused between two polls: the earlier trade's
        // copies are closed before the new trade is looked at.
        let reused: Vec<PositionId> = closed
            .iter()
            .copied()
            .filter(|id| opened.iter().any(|p: &ProviderPosition| p.position_id == *id))
            .collect();
        if !reused.is_empty() {
            closed.retain(|id| !reused.contains(id));
            let mut operations = Vec::new();
            for &position_id in &reused {
                operations.extend(self.dispatcher.plan_close(
                    &mut self.store,
                    &mut self.retries,
                    position_id,
                    &mut report.stats,
                ));
            }
            self.dispatch(operations, now, &mut report.stats).await;
        }

        if !opened.is_empty() {
            info!("📥 [DETECT] {} new provider position(s)", opened.len());
        }
        let mut operations = Vec::new();
        for position in &opened {
            operations.extend(self.dispatcher.plan_open(&mut self.store, position, now, &mut report.stats));
        }
        self.dispatch(operations, now, &mut report.stats).await;

        let mut operations = Vec::new();
        for position in &modified {
            operations.extend(sltp::plan_modify(&self.dispatcher, &mut self.store, position, &mut report.stats));
        }
        self.dispatch(operations, now, &mut report.stats).await;

        if !closed.is_empty() {
            info!("📤 [DETECT] {} provider position(s) closed", closed.len());
        }
        let mut operations = Vec::new();
        for position_id in closed {
            operations.extend(self.dispatcher.plan_close(
                &mut self.store,
                &mut self.retries,
                position_id,
                &mut report.stats,
            ));
        }
        self.dispatch(operations, now, &mut report.stats).await;

        // A failed write means some event was not fully recorded; keep the
        // old snapshot so the next cycle sees the same changes again.
        if report.stats.store_errors == 0 {
            match self.store.commit_snapshot(positions) {
                Ok(()) => report.snapshot_committed = true,
                Err(e) => report.stats.record_store_error("commit snapshot", &e),
            }
        } else {
            warn!(
                errors = report.stats.store_errors,
                "⚠️  [PERSISTENCE] Snapshot not committed, changes will be replayed"
            );
        }

        let open_ids: HashSet<PositionId> = positions.iter().map(|p| p.position_id).collect();
        match self.store.archive_settled(&open_ids, now) {
            Ok(archived) => report.archived = archived,
            Err(e) => warn!(error = %e, "Failed to archive settled links"),
        }
    }

    async fn process_commands(&mut self, now: DateTime<Utc>, stats: &mut DispatchStats) {
        let mut commands = Vec::new();
        while let Ok(command) = self.commands_rx.try_recv() {
            commands.push(command);
        }
        for command in commands {
            self.run_command(command, now, stats).await;
        }

        // Queued rows are removed only once handled; a crash in between
        // runs them again, which every command tolerates.
        let queued = match self.store.queued_commands() {
            Ok(queued) => queued,
            Err(e) => {
                warn!(error = %e, "Failed to read queued manual commands");
                return;
            }
        };
        let Some(last_id) = queued.last().map(|q| q.id) else {
            return;
        };
        for queued in queued {
            self.run_command(queued.command, now, stats).await;
        }
        if let Err(e) = self.store.ack_commands(last_id) {
            warn!(error = %e, "Failed to clear handled manual commands");
        }
    }

    async fn run_command(&mut self, command: ManualCommand, now: DateTime<Utc>, stats: &mut DispatchStats) {
        if let ManualCommand::SetReceiverEnabled { account_id, enabled } = &command {
            if !self.dispatcher.set_receiver_enabled(account_id, *enabled) {
                warn!(receiver = %account_id, "Unknown receiver, toggle ignored");
            }
            return;
        }

        let plan = self
            .manual
            .plan(&self.dispatcher, &mut self.store, &mut self.retries, command, stats);
        self.dispatch(plan.operations, now, stats).await;
        if !plan.provider_positions.is_empty() {
            self.dispatcher
                .close_provider_positions(&plan.provider_positions)
                .await;
        }
    }

    async fn dispatch(&mut self, operations: Vec<Operation>, now: DateTime<Utc>, stats: &mut DispatchStats) {
        if operations.is_empty() {
            return;
        }
        let results = self.dispatcher.execute(operations).await;
        self.dispatcher
            .apply(&mut self.store, &mut self.retries, results, now, stats);
    }

    fn note_empty_provider(&mut self, positions: &[ProviderPosition]) {
        if !positions.is_empty() {
            self.empty_provider_cycles = 0;
            return;
        }
        self.empty_provider_cycles += 1;
        if self.empty_provider_cycles % EMPTY_PROVIDER_NOTICE_CYCLES == 0 {
            info!(
                cycles = self.empty_provider_cycles,
                live_links = self.store.live_links().count(),
                "💤 [POLL] Provider has no open positions"
            );
        }
    }

    fn maybe_report(&mut self, now: DateTime<Utc>) {
        let due = self
            .last_report_at
            .map_or(true, |last| now - last >= self.settings.diagnostics_interval);
        if due {
            LinkReport::build(self.store.links(), self.retries.tasks(), now).emit();
            self.last_report_at = Some(now);
        }
    }

    /// Poll until `shutdown` is set.
    pub async fn run(&mut self, shutdown: Arc<AtomicBool>) {
        info!("🚀 Starting replication loop...");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        while !shutdown.load(Ordering::SeqCst) {
            let started = Instant::now();
            let report = self.run_cycle(Utc::now()).await;

            let stats = &report.stats;
            if report.events > 0 || stats.has_activity() {
                info!(
                    "📊 [CYCLE #{}] events {} | opened {} | modified {} | closed {} | cancelled {} | skipped {} | retries {} | failed {}",
                    report.cycle,
                    report.events,
                    stats.opened,
                    stats.modified,
                    stats.closed,
                    stats.cancelled,
                    stats.skipped,
                    stats.retries_scheduled,
                    stats.failed
                );
            }
            debug!("⏱️  Cycle completed in {}ms", started.elapsed().as_millis());

            if let Some(rest) = self.settings.poll_interval.checked_sub(started.elapsed()) {
                tokio::time::sleep(rest).await;
            }
        }

        info!(
            live_links = self.store.live_links().count(),
            pending_retries = self.retries.len(),
            "👋 Replication loop stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilterConfig, ReceiverConfig};
    use crate::persistence::PersistenceManager;
    use crate::replication::{CopyLink, LinkKey, LinkTarget};
    use crate::terminal::mock::CallKind;
    use crate::terminal::{MockTerminal, Side, TerminalError};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rust_decimal_macros::dec;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    struct Terminals {
        provider: Arc<MockTerminal>,
        r1: Arc<MockTerminal>,
        r2: Arc<MockTerminal>,
    }

    fn terminals() -> Terminals {
        Terminals {
            provider: Arc::new(MockTerminal::new("P").with_first_ticket(500_000)),
            r1: Arc::new(MockTerminal::new("R1").with_first_ticket(10_000)),
            r2: Arc::new(MockTerminal::new("R2").with_first_ticket(20_000)),
        }
    }

    /// R1 copies at half size, R2 never copies EURUSD.
    fn config(duplicates: bool, max_attempts: u32) -> Config {
        let mut r1 = ReceiverConfig::new("R1");
        r1.filter = FilterConfig {
            volume_multiplier: dec!(0.5),
            max_position_age_minutes: 0,
            ..Default::default()
        };
        let mut r2 = ReceiverConfig::new("R2");
        r2.filter = FilterConfig {
            denied_symbols: vec!["EURUSD".to_string()],
            max_position_age_minutes: 0,
            ..Default::default()
        };

        let mut config = Config::default();
        config.provider.account_id = "P".to_string();
        config.receivers = vec![r1, r2];
        config.replication.duplicate_provider_trades = duplicates;
        config.replication.max_attempts = max_attempts;
        config.replication.retry_interval_secs = 30;
        config.replication.duplicate_retry_interval_secs = 30;
        config
    }

    fn engine(config: &Config, t: &Terminals, store: StateStore) -> ReplicationEngine {
        ReplicationEngine::from_config(
            config,
            t.provider.clone(),
            vec![t.r1.clone(), t.r2.clone()],
            store,
        )
        .unwrap()
    }

    fn temp_db() -> PathBuf {
        std::env::temp_dir().join(format!(
            "trade-copier-test-{}-{}.db",
            std::process::id(),
            rand::random::<u64>()
        ))
    }

    fn file_store(path: &PathBuf) -> StateStore {
        StateStore::open(Box::new(PersistenceManager::new(path).unwrap())).unwrap()
    }

    fn eurusd(id: PositionId, now: DateTime<Utc>) -> ProviderPosition {
        ProviderPosition::new(id, "EURUSD", Side::Buy, dec!(1), dec!(1.1000), now)
            .with_stop_loss(dec!(1.0950))
    }

    fn key(id: PositionId, account: &str) -> LinkKey {
        LinkKey::new(id, LinkTarget::receiver(account))
    }

    // =========================================================================
    // End to end
    // =========================================================================

    #[tokio::test]
    async fn test_open_modify_close_across_receivers() {
        let t = terminals();
        let mut engine = engine(&config(false, 5), &t, StateStore::in_memory().unwrap());
        let start = Utc::now();

        t.provider.insert_position(eurusd(1, start)).await;
        let report = engine.run_cycle(start).await;
        assert_eq!(report.events, 1);
        assert_eq!(report.stats.opened, 1);
        assert_eq!(report.stats.skipped, 1);

        let copies = t.r1.positions().await;
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].volume, dec!(0.5));
        assert_eq!(copies[0].stop_loss, Some(dec!(1.0950)));
        assert!(t.r2.positions().await.is_empty());

        t.provider.set_protective(1, Some(dec!(1.0980)), Some(dec!(1.1100))).await;
        let report = engine.run_cycle(start + chrono::Duration::seconds(1)).await;
        assert_eq!(report.stats.modified, 1);
        let copies = t.r1.positions().await;
        assert_eq!(copies[0].stop_loss, Some(dec!(1.0980)));
        assert_eq!(copies[0].take_profit, Some(dec!(1.1100)));

        t.provider.remove_position(1).await;
        let report = engine.run_cycle(start + chrono::Duration::seconds(2)).await;
        assert_eq!(report.stats.closed, 1);
        assert_eq!(report.archived, 1);
        assert!(t.r1.positions().await.is_empty());
        assert_eq!(engine.store().links().count(), 0);
    }

    #[tokio::test]
    async fn test_duplicates_are_opened_once_and_closed_with_original() {
        let t = terminals();
        let mut engine = engine(&config(true, 5), &t, StateStore::in_memory().unwrap());
        let start = Utc::now();

        t.provider.insert_position(eurusd(1, start)).await;
        engine.run_cycle(start).await;
        // The duplicate shows up in the next snapshot and must not be copied.
        let report = engine.run_cycle(start + chrono::Duration::seconds(1)).await;
        assert_eq!(report.events, 0);
        assert_eq!(t.provider.positions().await.len(), 2);
        assert_eq!(t.r1.positions().await.len(), 1);

        t.provider.remove_position(1).await;
        engine.run_cycle(start + chrono::Duration::seconds(2)).await;
        assert!(t.provider.positions().await.is_empty());
        assert!(t.r1.positions().await.is_empty());
    }

    #[tokio::test]
    async fn test_provider_outage_skips_detection_but_runs_retries() {
        let t = terminals();
        let mut engine = engine(&config(false, 5), &t, StateStore::in_memory().unwrap());
        let start = Utc::now();

        t.r1.fail_next(CallKind::Open, TerminalError::Disconnected("down".into()))
            .await;
        t.provider.insert_position(eurusd(1, start)).await;
        engine.run_cycle(start).await;

        t.provider
            .fail_times(CallKind::Snapshot, TerminalError::Disconnected("bridge down".into()), 2)
            .await;
        let report = engine.run_cycle(start + chrono::Duration::seconds(30)).await;
        assert_eq!(report.provider_positions, None);
        assert_eq!(report.stats.opened, 1);
        assert_eq!(report.stats.alerts.len(), 1);

        // Only the first failure of an outage raises an alert.
        let report = engine.run_cycle(start + chrono::Duration::seconds(31)).await;
        assert!(report.stats.alerts.is_empty());
        assert_eq!(engine.alerts().len(), 1);
    }

    // =========================================================================
    // Manual close
    // =========================================================================

    #[tokio::test]
    async fn test_manual_close_all_from_control_handle() {
        let t = terminals();
        let mut engine = engine(&config(false, 5), &t, StateStore::in_memory().unwrap());
        let start = Utc::now();
        for id in 1..=3 {
            t.provider.insert_position(eurusd(id, start)).await;
        }
        engine.run_cycle(start).await;
        assert_eq!(t.r1.positions().await.len(), 3);

        engine.control().close_all().unwrap();
        let report = engine.run_cycle(start + chrono::Duration::seconds(1)).await;
        assert_eq!(report.stats.closed, 3);
        assert!(t.r1.positions().await.is_empty());
        // Provider positions stay open and are not copied again.
        assert_eq!(t.provider.positions().await.len(), 3);
        engine.run_cycle(start + chrono::Duration::seconds(2)).await;
        assert!(t.r1.positions().await.is_empty());
    }

    #[tokio::test]
    async fn test_queued_close_command_is_picked_up() {
        let t = terminals();
        let mut engine = engine(&config(false, 5), &t, StateStore::in_memory().unwrap());
        let start = Utc::now();
        t.provider.insert_position(eurusd(1, start)).await;
        t.provider.insert_position(eurusd(2, start)).await;
        engine.run_cycle(start).await;

        engine.store().enqueue_command(&ManualCommand::CloseOne(2)).unwrap();
        engine.run_cycle(start + chrono::Duration::seconds(1)).await;

        let remaining: Vec<String> = t.r1.positions().await.into_iter().map(|p| p.comment).collect();
        assert_eq!(remaining, vec!["COPY:1".to_string()]);
    }

    #[tokio::test]
    async fn test_receiver_toggled_while_running() {
        let t = terminals();
        let mut engine = engine(&config(false, 5), &t, StateStore::in_memory().unwrap());
        let start = Utc::now();

        engine.control().set_receiver_enabled("R1", false).unwrap();
        t.provider.insert_position(eurusd(1, start)).await;
        let report = engine.run_cycle(start).await;
        assert_eq!(report.stats.skipped, 2);
        assert!(t.r1.positions().await.is_empty());

        engine
            .store()
            .enqueue_command(&ManualCommand::SetReceiverEnabled {
                account_id: "R1".to_string(),
                enabled: true,
            })
            .unwrap();
        t.provider.insert_position(eurusd(2, start)).await;
        engine.run_cycle(start + chrono::Duration::seconds(1)).await;

        let copies: Vec<String> = t.r1.positions().await.into_iter().map(|p| p.comment).collect();
        assert_eq!(copies, vec!["COPY:2".to_string()]);
        assert!(engine.store().queued_commands().unwrap().is_empty());
    }

    // =========================================================================
    // Reused tickets
    // =========================================================================

    #[tokio::test]
    async fn test_reused_ticket_is_copied_once_earlier_close_settles() {
        let t = terminals();
        let mut engine = engine(&config(false, 5), &t, StateStore::in_memory().unwrap());
        let start = Utc::now();

        t.provider.insert_position(eurusd(1, start)).await;
        engine.run_cycle(start).await;
        assert_eq!(t.r1.positions().await.len(), 1);

        t.r1.fail_next(CallKind::Close, TerminalError::Timeout(Duration::from_secs(15)))
            .await;
        t.provider.remove_position(1).await;
        engine.run_cycle(start + chrono::Duration::seconds(1)).await;
        assert_eq!(
            engine.store().link(&key(1, "R1")).unwrap().state,
            LinkState::PendingClose
        );

        // Broker hands ticket 1 to a new trade while the old copy is still closing.
        let reopened_at = start + chrono::Duration::seconds(2);
        t.provider.insert_position(eurusd(1, reopened_at)).await;
        let report = engine.run_cycle(reopened_at).await;
        assert_eq!(report.stats.opened, 0);
        assert_eq!(t.r1.count(CallKind::Open).await, 1);

        for step in 1..=4 {
            engine
                .run_cycle(reopened_at + chrono::Duration::seconds(30 * step))
                .await;
        }

        let copies = t.r1.positions().await;
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].comment, "COPY:1");
        assert_eq!(t.r1.count(CallKind::Open).await, 2);
        let link = engine.store().link(&key(1, "R1")).unwrap();
        assert_eq!(link.state, LinkState::Open);
        assert_eq!(link.provider_opened_at, reopened_at);
    }

    #[tokio::test]
    async fn test_ticket_reused_between_two_polls() {
        let t = terminals();
        let mut engine = engine(&config(false, 5), &t, StateStore::in_memory().unwrap());
        let start = Utc::now();

        t.provider.insert_position(eurusd(1, start)).await;
        engine.run_cycle(start).await;

        let reopened_at = start + chrono::Duration::seconds(5);
        t.provider.remove_position(1).await;
        t.provider
            .insert_position(ProviderPosition::new(1, "GBPUSD", Side::Sell, dec!(1), dec!(1.2700), reopened_at))
            .await;
        let report = engine.run_cycle(start + chrono::Duration::seconds(10)).await;

        assert_eq!(report.stats.closed, 1);
        assert_eq!(report.stats.opened, 2);
        let r1 = t.r1.positions().await;
        assert_eq!(r1.len(), 1);
        assert_eq!(r1[0].symbol, "GBPUSD");
        assert_eq!(t.r2.positions().await.len(), 1);
    }

    // =========================================================================
    // Persistence & restart
    // =========================================================================

    #[tokio::test]
    async fn test_restart_does_not_reopen() {
        let t = terminals();
        let config = config(false, 5);
        let path = temp_db();
        let start = Utc::now();

        t.provider.insert_position(eurusd(1, start)).await;
        {
            let mut engine = engine(&config, &t, file_store(&path));
            engine.run_cycle(start).await;
        }
        assert_eq!(t.r1.count(CallKind::Open).await, 1);

        let mut engine = engine(&config, &t, file_store(&path));
        let report = engine.run_cycle(start + chrono::Duration::seconds(5)).await;
        assert_eq!(report.events, 0);
        assert_eq!(t.r1.count(CallKind::Open).await, 1);

        t.provider.remove_position(1).await;
        engine.run_cycle(start + chrono::Duration::seconds(6)).await;
        assert!(t.r1.positions().await.is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_pending_retry_survives_restart() {
        let t = terminals();
        let config = config(false, 5);
        let path = temp_db();
        let start = Utc::now();

        t.r1.fail_next(CallKind::Open, TerminalError::Timeout(Duration::from_secs(15)))
            .await;
        t.provider.insert_position(eurusd(1, start)).await;
        {
            let mut engine = engine(&config, &t, file_store(&path));
            engine.run_cycle(start).await;
            assert_eq!(engine.retries().len(), 1);
        }

        let mut engine = engine(&config, &t, file_store(&path));
        assert_eq!(engine.retries().len(), 1);
        engine.run_cycle(start + chrono::Duration::seconds(10)).await;
        assert!(t.r1.positions().await.is_empty());

        engine.run_cycle(start + chrono::Duration::seconds(30)).await;
        assert_eq!(t.r1.positions().await.len(), 1);
        assert_eq!(engine.store().link(&key(1, "R1")).unwrap().state, LinkState::Open);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_unsent_pending_open_is_recovered_on_start() {
        let t = terminals();
        let start = Utc::now();
        let mut store = StateStore::in_memory().unwrap();
        store.commit_snapshot(&[eurusd(1, start)]).unwrap();
        store
            .insert_link(CopyLink::pending_open(key(1, "R1"), "EURUSD", Side::Buy, dec!(0.5), start))
            .unwrap();
        t.provider.insert_position(eurusd(1, start)).await;

        let mut engine = engine(&config(false, 5), &t, store);
        assert_eq!(engine.retries().len(), 1);
        engine.run_cycle(Utc::now()).await;

        assert_eq!(t.r1.positions().await.len(), 1);
        assert_eq!(engine.store().link(&key(1, "R1")).unwrap().state, LinkState::Open);
    }

    // =========================================================================
    // Retry exhaustion
    // =========================================================================

    #[tokio::test]
    async fn test_open_attempts_are_spaced_and_bounded() {
        let t = terminals();
        let max_attempts = 4;
        let mut engine = engine(&config(false, max_attempts), &t, StateStore::in_memory().unwrap());
        t.r1.fail_times(CallKind::Open, TerminalError::Disconnected("down".into()), 100)
            .await;
        let start = Utc::now();
        t.provider.insert_position(eurusd(1, start)).await;

        let mut attempt_times = Vec::new();
        for second in (0..600).step_by(5) {
            let now = start + chrono::Duration::seconds(second);
            let before = t.r1.count(CallKind::Open).await;
            engine.run_cycle(now).await;
            if t.r1.count(CallKind::Open).await > before {
                attempt_times.push(now);
            }
        }

        assert_eq!(attempt_times.len(), max_attempts as usize);
        for pair in attempt_times.windows(2) {
            assert!(pair[1] - pair[0] >= chrono::Duration::seconds(30));
        }
        assert_eq!(engine.store().link(&key(1, "R1")).unwrap().state, LinkState::Failed);
        assert!(engine.retries().is_empty());
    }

    // =========================================================================
    // Randomized interleaving
    // =========================================================================

    /// Random opens, modifies, closes and terminal failures must converge
    /// to exactly one copy per open provider position and none for closed
    /// ones.
    #[tokio::test]
    async fn test_random_interleaving_converges() {
        for seed in [7_u64, 42, 1337] {
            let mut rng = StdRng::seed_from_u64(seed);
            let t = terminals();
            let mut engine = engine(&config(true, 1000), &t, StateStore::in_memory().unwrap());
            let mut now = Utc::now();
            let mut open: BTreeSet<PositionId> = BTreeSet::new();
            let mut next_id: PositionId = 1;

            for _ in 0..60 {
                match rng.gen_range(0..10) {
                    0..=3 => {
                        let symbol = if rng.gen_bool(0.5) { "EURUSD" } else { "GBPUSD" };
                        let position =
                            ProviderPosition::new(next_id, symbol, Side::Sell, dec!(2), dec!(1.2500), now)
                                .with_stop_loss(dec!(1.2600));
                        t.provider.insert_position(position).await;
                        open.insert(next_id);
                        next_id += 1;
                    }
                    4..=5 => {
                        if let Some(&id) = open.iter().nth(rng.gen_range(0..open.len().max(1))) {
                            t.provider.remove_position(id).await;
                            open.remove(&id);
                        }
                    }
                    6 => {
                        if let Some(&id) = open.iter().next() {
                            let tp = rust_decimal::Decimal::new(rng.gen_range(12_000..12_400), 4);
                            t.provider.set_protective(id, Some(dec!(1.2600)), Some(tp)).await;
                        }
                    }
                    7 => {
                        let receiver = if rng.gen_bool(0.5) { &t.r1 } else { &t.r2 };
                        let kind = if rng.gen_bool(0.5) { CallKind::Open } else { CallKind::Close };
                        receiver
                            .fail_next(kind, TerminalError::Timeout(Duration::from_secs(15)))
                            .await;
                    }
                    8 => {
                        t.provider
                            .fail_next(CallKind::Snapshot, TerminalError::Disconnected("blip".into()))
                            .await;
                    }
                    _ => {
                        t.provider
                            .fail_next(CallKind::Open, TerminalError::Disconnected("blip".into()))
                            .await;
                    }
                }

                engine.run_cycle(now).await;
                now += chrono::Duration::seconds(rng.gen_range(1..40));
            }

            // Let outstanding retries drain.
            for _ in 0..10 {
                now += chrono::Duration::seconds(31);
                engine.run_cycle(now).await;
            }

            let copies_of = |positions: Vec<ProviderPosition>, prefix: &str| -> Vec<PositionId> {
                positions
                    .iter()
                    .filter_map(|p| p.comment.strip_prefix(prefix).and_then(|id| id.parse().ok()))
                    .collect()
            };

            let r1: Vec<PositionId> = copies_of(t.r1.positions().await, "COPY:");
            assert_eq!(r1.len(), open.len(), "seed {seed}: one R1 copy per open position");
            assert_eq!(r1.iter().copied().collect::<BTreeSet<_>>(), open, "seed {seed}");

            let r2 = copies_of(t.r2.positions().await, "COPY:");
            let gbp: BTreeSet<PositionId> = t
                .provider
                .positions()
                .await
                .into_iter()
                .filter(|p| p.symbol == "GBPUSD" && !p.is_engine_duplicate())
                .map(|p| p.position_id)
                .collect();
            assert_eq!(r2.len(), gbp.len(), "seed {seed}: R2 copies only GBPUSD");
            assert_eq!(r2.iter().copied().collect::<BTreeSet<_>>(), gbp, "seed {seed}");

            let duplicates = copies_of(t.provider.positions().await, "DUPLICATE_OF:");
            assert_eq!(duplicates.len(), open.len(), "seed {seed}: one duplicate per open position");
            assert_eq!(duplicates.iter().copied().collect::<BTreeSet<_>>(), open, "seed {seed}");

            assert!(engine.retries().is_empty(), "seed {seed}");
            assert!(engine.store().links().all(|l| l.state != LinkState::Failed), "seed {seed}");
        }
    }
}
