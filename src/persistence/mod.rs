//! Durable replication state.
//!
//! Persists everything needed to resume after a restart without
//! duplicating or losing trades:
//! - Copy links and their lifecycle state
//! - Pending retry tasks
//! - The last provider snapshot the detector diffed against
//! - Manual commands queued from the CLI
//!
//! [`StateStore`] keeps the working set in memory and writes through to a
//! [`StateBackend`] (SQLite in production) on every change.

mod sqlite;
mod store;

pub use sqlite::PersistenceManager;
pub use store::{PreviousTrade, StateStore};

use crate::replication::{CopyLink, LinkKey, ManualCommand, RetryTask, TransitionError};
use crate::terminal::ProviderPosition;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("corrupt persisted state: {0}")]
    Corrupt(String),

    #[error("state backend unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("unknown link {0}")]
    UnknownLink(LinkKey),
}

/// Storage behind a [`StateStore`].
pub trait StateBackend: Send {
    fn load_links(&self) -> Result<Vec<CopyLink>, StoreError>;
    fn save_link(&self, link: &CopyLink) -> Result<(), StoreError>;
    /// Move links out of the active table into history.
    fn archive_links(&self, links: &[CopyLink], archived_at: DateTime<Utc>) -> Result<(), StoreError>;

    fn load_retry_tasks(&self) -> Result<Vec<RetryTask>, StoreError>;
    fn save_retry_task(&self, task: &RetryTask) -> Result<(), StoreError>;
    fn delete_retry_task(&self, key: &LinkKey) -> Result<(), StoreError>;

    fn load_snapshot(&self) -> Result<Vec<ProviderPosition>, StoreError>;
    /// Replace the stored snapshot atomically.
    fn save_snapshot(&self, positions: &[ProviderPosition]) -> Result<(), StoreError>;

    fn enqueue_command(&self, command: &ManualCommand) -> Result<(), StoreError>;
    /// Queued commands, oldest first. Rows that cannot be parsed are
    /// discarded.
    fn load_commands(&self) -> Result<Vec<QueuedCommand>, StoreError>;
    /// Remove every queued command up to and including `through_id`.
    fn ack_commands(&self, through_id: i64) -> Result<(), StoreError>;
}

/// A manual command waiting in the database.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCommand {
    pub id: i64,
    pub command: ManualCommand,
}

#[cfg(test)]
pub(crate) mod testing {
    //! Backend wrapper whose writes can be switched off.

    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    pub struct FlakyBackend {
        inner: PersistenceManager,
        failing: Arc<AtomicBool>,
    }

    impl FlakyBackend {
        /// In-memory backend plus the switch controlling its writes.
        pub fn new() -> (Self, Arc<AtomicBool>) {
            let failing = Arc::new(AtomicBool::new(false));
            let backend = Self {
                inner: PersistenceManager::new(":memory:").unwrap(),
                failing: failing.clone(),
            };
            (backend, failing)
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("disk full".to_string()))
            } else {
                Ok(())
            }
        }
    }

    impl StateBackend for FlakyBackend {
        fn load_links(&self) -> Result<Vec<CopyLink>, StoreError> {
            self.inner.load_links()
        }
        fn save_link(&self, link: &CopyLink) -> Result<(), StoreError> {
            self.check()?;
            self.inner.save_link(link)
        }
        fn archive_links(&self, links: &[CopyLink], archived_at: DateTime<Utc>) -> Result<(), StoreError> {
            self.check()?;
            self.inner.archive_links(links, archived_at)
        }
        fn load_retry_tasks(&self) -> Result<Vec<RetryTask>, StoreError> {
            self.inner.load_retry_tasks()
        }
        fn save_retry_task(&self, task: &RetryTask) -> Result<(), StoreError> {
            self.check()?;
            self.inner.save_retry_task(task)
        }
        fn delete_retry_task(&self, key: &LinkKey) -> Result<(), StoreError> {
            self.check()?;
            self.inner.delete_retry_task(key)
        }
        fn load_snapshot(&self) -> Result<Vec<ProviderPosition>, StoreError> {
            self.inner.load_snapshot()
        }
        fn save_snapshot(&self, positions: &[ProviderPosition]) -> Result<(), StoreError> {
            self.check()?;
            self.inner.save_snapshot(positions)
        }
        fn enqueue_command(&self, command: &ManualCommand) -> Result<(), StoreError> {
            self.inner.enqueue_command(command)
        }
        fn load_commands(&self) -> Result<Vec<QueuedCommand>, StoreError> {
            self.inner.load_commands()
        }
        fn ack_commands(&self, through_id: i64) -> Result<(), StoreError> {
            self.check()?;
            self.inner.ack_commands(through_id)
        }
    }
}
