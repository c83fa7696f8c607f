//! In-memory link table with write-through persistence.

use super::{PersistenceManager, QueuedCommand, StateBackend, StoreError};
use crate::replication::{CopyLink, LinkKey, LinkTarget, ManualCommand, RetryTask, TransitionError};
use crate::terminal::{PositionId, ProviderPosition};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

/// Links found under a ticket that belonged to an earlier provider trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviousTrade {
    /// Nothing from an earlier trade
    None,
    /// Still closing on some target
    Settling,
    /// All settled and moved to history
    Archived(usize),
}

/// Single writer for all replication state.
///
/// Every mutation is persisted before it becomes visible in memory; a
/// failed write leaves the in-memory state exactly as it was.
pub struct StateStore {
    backend: Box<dyn StateBackend>,
    links: BTreeMap<LinkKey, CopyLink>,
    snapshot: HashMap<PositionId, ProviderPosition>,
}

impl StateStore {
    /// Load links and the last provider snapshot from `backend`.
    ///
    /// Any unreadable row fails the whole load.
    pub fn open(backend: Box<dyn StateBackend>) -> Result<Self, StoreError> {
        let links: BTreeMap<LinkKey, CopyLink> = backend
            .load_links()?
            .into_iter()
            .map(|link| (link.key.clone(), link))
            .collect();
        let snapshot = backend
            .load_snapshot()?
            .into_iter()
            .map(|position| (position.position_id, position))
            .collect::<HashMap<_, _>>();

        info!(
            links = links.len(),
            live = links.values().filter(|l| !l.state.is_terminal()).count(),
            snapshot = snapshot.len(),
            "State store opened"
        );

        Ok(Self {
            backend,
            links,
            snapshot,
        })
    }

    /// Store backed by a fresh in-memory database.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(Box::new(PersistenceManager::new(":memory:")?))
    }

    pub fn link(&self, key: &LinkKey) -> Option<&CopyLink> {
        self.links.get(key)
    }

    pub fn links(&self) -> impl Iterator<Item = &CopyLink> {
        self.links.values()
    }

    /// All links of one provider position, terminal ones included.
    pub fn links_for_position(&self, provider_position_id: PositionId) -> Vec<CopyLink> {
        let start = LinkKey::new(provider_position_id, LinkTarget::Receiver(String::new()));
        self.links
            .range(start..)
            .take_while(|(key, _)| key.provider_position_id == provider_position_id)
            .map(|(_, link)| link.clone())
            .collect()
    }

    /// Links not yet CLOSED or FAILED.
    pub fn live_links(&self) -> impl Iterator<Item = &CopyLink> {
        self.links.values().filter(|link| !link.state.is_terminal())
    }

    /// Live links on `target` (counts toward its open-position limit).
    pub fn live_count(&self, target: &LinkTarget) -> usize {
        self.live_links()
            .filter(|link| link.target() == target)
            .count()
    }

    /// Provider positions that have at least one link.
    pub fn tracked_positions(&self) -> BTreeSet<PositionId> {
        self.links.keys().map(|key| key.provider_position_id).collect()
    }

    /// Insert a new link unless one already exists for its key.
    ///
    /// Returns `false` when the key is taken, whatever that link's state.
    pub fn insert_link(&mut self, link: CopyLink) -> Result<bool, StoreError> {
        if self.links.contains_key(&link.key) {
            return Ok(false);
        }
        self.backend.save_link(&link)?;
        debug!(link = %link.key, state = %link.state, "Link created");
        self.links.insert(link.key.clone(), link);
        Ok(true)
    }

    /// Apply `change` to a copy of the link, persist it, then publish it.
    ///
    /// On any error the stored link is left untouched.
    pub fn transition<T, F>(&mut self, key: &LinkKey, change: F) -> Result<(CopyLink, T), StoreError>
    where
        F: FnOnce(&mut CopyLink) -> Result<T, TransitionError>,
    {
        let current = self
            .links
            .get(key)
            .ok_or_else(|| StoreError::UnknownLink(key.clone()))?;

        let mut updated = current.clone();
        let outcome = change(&mut updated)?;
        if updated == *current {
            return Ok((updated, outcome));
        }

        self.backend.save_link(&updated)?;
        if updated.state != current.state {
            debug!(link = %key, from = %current.state, to = %updated.state, "Link transition");
        }
        self.links.insert(key.clone(), updated.clone());
        Ok((updated, outcome))
    }

    /// Archive link groups whose provider position is gone and whose
    /// links have all settled.
    pub fn archive_settled(
        &mut self,
        open_provider_positions: &HashSet<PositionId>,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut settled = Vec::new();
        for position_id in self.tracked_positions() {
            if open_provider_positions.contains(&position_id) {
                continue;
            }
            let group = self.links_for_position(position_id);
            if group.iter().all(|link| link.state.is_terminal()) {
                settled.extend(group);
            }
        }

        self.archive(settled, now)
    }

    /// Clear the way for `position` on a ticket whose links still belong
    /// to an earlier provider trade.
    ///
    /// Those links are archived once every one of them has settled; until
    /// then the new trade has to wait.
    pub fn retire_previous_trade(
        &mut self,
        position: &ProviderPosition,
        now: DateTime<Utc>,
    ) -> Result<PreviousTrade, StoreError> {
        let previous: Vec<CopyLink> = self
            .links_for_position(position.position_id)
            .into_iter()
            .filter(|link| !link.copies(position))
            .collect();

        if previous.is_empty() {
            return Ok(PreviousTrade::None);
        }
        if previous.iter().any(|link| !link.state.is_terminal()) {
            return Ok(PreviousTrade::Settling);
        }
        let archived = self.archive(previous, now)?;
        info!(
            position = position.position_id,
            archived, "♻️  Ticket reused by the provider, previous copies archived"
        );
        Ok(PreviousTrade::Archived(archived))
    }

    /// Snapshot positions whose only links belong to an earlier trade on
    /// the same ticket and have all settled, in ticket order.
    pub fn reused_tickets(&self) -> Vec<ProviderPosition> {
        let mut positions: Vec<ProviderPosition> = self
            .snapshot
            .values()
            .filter(|position| {
                let group = self.links_for_position(position.position_id);
                !group.is_empty()
                    && group
                        .iter()
                        .all(|link| !link.copies(position) && link.state.is_terminal())
            })
            .cloned()
            .collect();
        positions.sort_by_key(|position| position.position_id);
        positions
    }

    fn archive(&mut self, links: Vec<CopyLink>, now: DateTime<Utc>) -> Result<usize, StoreError> {
        if links.is_empty() {
            return Ok(0);
        }

        self.backend.archive_links(&links, now)?;
        for link in &links {
            self.links.remove(&link.key);
        }
        debug!(archived = links.len(), "Settled links archived");
        Ok(links.len())
    }

    /// Provider snapshot the next diff runs against.
    pub fn last_snapshot(&self) -> &HashMap<PositionId, ProviderPosition> {
        &self.snapshot
    }

    /// Persist `positions` as the new last-known snapshot.
    pub fn commit_snapshot(&mut self, positions: &[ProviderPosition]) -> Result<(), StoreError> {
        self.backend.save_snapshot(positions)?;
        self.snapshot = positions
            .iter()
            .map(|position| (position.position_id, position.clone()))
            .collect();
        Ok(())
    }

    pub fn load_retry_tasks(&self) -> Result<Vec<RetryTask>, StoreError> {
        self.backend.load_retry_tasks()
    }

    pub fn save_retry_task(&self, task: &RetryTask) -> Result<(), StoreError> {
        self.backend.save_retry_task(task)
    }

    pub fn delete_retry_task(&self, key: &LinkKey) -> Result<(), StoreError> {
        self.backend.delete_retry_task(key)
    }

    pub fn enqueue_command(&self, command: &ManualCommand) -> Result<(), StoreError> {
        self.backend.enqueue_command(command)
    }

    /// Manual commands queued by other processes. They stay queued until
    /// [`StateStore::ack_commands`] is called.
    pub fn queued_commands(&self) -> Result<Vec<QueuedCommand>, StoreError> {
        let commands = self.backend.load_commands()?;
        if !commands.is_empty() {
            info!(count = commands.len(), "Picked up queued manual commands");
        }
        Ok(commands)
    }

    pub fn ack_commands(&self, through_id: i64) -> Result<(), StoreError> {
        self.backend.ack_commands(through_id)
    }

    /// Drop retry tasks whose link no longer exists or has settled.
    pub fn prune_retry_tasks(&self, tasks: Vec<RetryTask>) -> Vec<RetryTask> {
        tasks
            .into_iter()
            .filter(|task| match self.links.get(&task.key) {
                Some(link) if !link.state.is_terminal() => true,
                _ => {
                    warn!(link = %task.key, "Discarding retry task for settled link");
                    if let Err(e) = self.backend.delete_retry_task(&task.key) {
                        warn!(link = %task.key, error = %e, "Failed to delete stale retry task");
                    }
                    false
                }
            })
            .collect()
    }
}
