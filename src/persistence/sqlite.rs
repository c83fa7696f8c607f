//! SQLite backend.

use super::{QueuedCommand, StateBackend, StoreError};
use crate::replication::{CopyLink, LinkKey, LinkState, LinkTarget, ManualCommand, OperationKind, RetryTask};
use crate::terminal::{ProviderPosition, Side};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

const COMMAND_CLOSE_ONE: &str = "close_one";
const COMMAND_CLOSE_ALL: &str = "close_all";
const COMMAND_ENABLE_RECEIVER: &str = "enable_receiver";
const COMMAND_DISABLE_RECEIVER: &str = "disable_receiver";

/// SQLite-based persistence manager.
pub struct PersistenceManager {
    conn: Connection,
}

impl PersistenceManager {
    /// Open (or create) the database at `db_path`; `:memory:` is accepted.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path.as_ref())?;

        let manager = Self { conn };
        manager.init_schema()?;

        info!("Persistence manager initialized at {:?}", db_path.as_ref());
        Ok(manager)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS copy_links (
                provider_position_id INTEGER NOT NULL,
                target TEXT NOT NULL,
                receiver_position_id INTEGER,
                state TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                volume TEXT NOT NULL,
                stop_loss TEXT,
                take_profit TEXT,
                last_error TEXT,
                attempt_count INTEGER NOT NULL,
                last_attempt_at TEXT,
                created_at TEXT NOT NULL,
                provider_opened_at TEXT NOT NULL,
                PRIMARY KEY (provider_position_id, target)
            );

            CREATE TABLE IF NOT EXISTS link_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider_position_id INTEGER NOT NULL,
                target TEXT NOT NULL,
                state TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                volume TEXT NOT NULL,
                last_error TEXT,
                attempt_count INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                provider_opened_at TEXT NOT NULL,
                archived_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_position ON link_history(provider_position_id);

            CREATE TABLE IF NOT EXISTS retry_tasks (
                provider_position_id INTEGER NOT NULL,
                target TEXT NOT NULL,
                kind TEXT NOT NULL,
                not_before TEXT NOT NULL,
                attempt_count INTEGER NOT NULL,
                PRIMARY KEY (provider_position_id, target)
            );

            CREATE TABLE IF NOT EXISTS provider_snapshot (
                position_id INTEGER PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                volume TEXT NOT NULL,
                open_price TEXT NOT NULL,
                stop_loss TEXT,
                take_profit TEXT,
                opened_at TEXT NOT NULL,
                comment TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS manual_commands (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                command TEXT NOT NULL,
                position_id INTEGER,
                account_id TEXT,
                requested_at TEXT NOT NULL
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Number of archived links.
    pub fn count_history(&self) -> Result<u64, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM link_history", [], |row| row.get(0))?)
    }

    /// Number of manual commands waiting for the engine.
    pub fn pending_commands(&self) -> Result<u64, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM manual_commands", [], |row| row.get(0))?)
    }
}

fn corrupt(column: &str, value: &str, error: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{column} = {value:?}: {error}"))
}

fn parse_decimal(column: &str, value: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(value).map_err(|e| corrupt(column, value, e))
}

fn parse_optional_decimal(column: &str, value: Option<String>) -> Result<Option<Decimal>, StoreError> {
    value.map(|v| parse_decimal(column, &v)).transpose()
}

fn parse_time(column: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt(column, value, e))
}

fn parse_with<T: FromStr<Err = String>>(column: &str, value: &str) -> Result<T, StoreError> {
    value.parse().map_err(|e: String| corrupt(column, value, e))
}

/// Columns of a `copy_links` row before validation.
struct LinkRow {
    provider_position_id: u64,
    target: String,
    receiver_position_id: Option<u64>,
    state: String,
    symbol: String,
    side: String,
    volume: String,
    stop_loss: Option<String>,
    take_profit: Option<String>,
    last_error: Option<String>,
    attempt_count: u32,
    last_attempt_at: Option<String>,
    created_at: String,
    provider_opened_at: String,
}

impl LinkRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            provider_position_id: row.get(0)?,
            target: row.get(1)?,
            receiver_position_id: row.get(2)?,
            state: row.get(3)?,
            symbol: row.get(4)?,
            side: row.get(5)?,
            volume: row.get(6)?,
            stop_loss: row.get(7)?,
            take_profit: row.get(8)?,
            last_error: row.get(9)?,
            attempt_count: row.get(10)?,
            last_attempt_at: row.get(11)?,
            created_at: row.get(12)?,
            provider_opened_at: row.get(13)?,
        })
    }

    fn into_link(self) -> Result<CopyLink, StoreError> {
        let link = CopyLink {
            key: LinkKey::new(self.provider_position_id, parse_with("target", &self.target)?),
            receiver_position_id: self.receiver_position_id,
            state: parse_with::<LinkState>("state", &self.state)?,
            symbol: self.symbol,
            side: parse_with::<Side>("side", &self.side)?,
            volume: parse_decimal("volume", &self.volume)?,
            stop_loss: parse_optional_decimal("stop_loss", self.stop_loss)?,
            take_profit: parse_optional_decimal("take_profit", self.take_profit)?,
            last_error: self.last_error,
            attempt_count: self.attempt_count,
            last_attempt_at: self
                .last_attempt_at
                .map(|t| parse_time("last_attempt_at", &t))
                .transpose()?,
            created_at: parse_time("created_at", &self.created_at)?,
            provider_opened_at: parse_time("provider_opened_at", &self.provider_opened_at)?,
        };

        if !link.is_consistent() {
            return Err(StoreError::Corrupt(format!(
                "link {} is {} with receiver ticket {:?}",
                link.key, link.state, link.receiver_position_id
            )));
        }
        Ok(link)
    }
}

impl StateBackend for PersistenceManager {
    fn load_links(&self) -> Result<Vec<CopyLink>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT provider_position_id, target, receiver_position_id, state, symbol, side,
                   volume, stop_loss, take_profit, last_error, attempt_count,
                   last_attempt_at, created_at, provider_opened_at
            FROM copy_links
            ORDER BY provider_position_id, target
            "#,
        )?;

        let rows = stmt
            .query_map([], LinkRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let links = rows
            .into_iter()
            .map(LinkRow::into_link)
            .collect::<Result<Vec<_>, _>>()?;

        info!(links = links.len(), "Loaded copy links from database");
        Ok(links)
    }

    fn save_link(&self, link: &CopyLink) -> Result<(), StoreError> {
        self.conn.execute(
            r#"
            INSERT INTO copy_links (provider_position_id, target, receiver_position_id, state,
                                    symbol, side, volume, stop_loss, take_profit, last_error,
                                    attempt_count, last_attempt_at, created_at, provider_opened_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(provider_position_id, target) DO UPDATE SET
                receiver_position_id = ?3,
                state = ?4,
                symbol = ?5,
                side = ?6,
                volume = ?7,
                stop_loss = ?8,
                take_profit = ?9,
                last_error = ?10,
                attempt_count = ?11,
                last_attempt_at = ?12
            "#,
            params![
                link.key.provider_position_id,
                link.key.target.to_string(),
                link.receiver_position_id,
                link.state.as_str(),
                link.symbol,
                link.side.as_str(),
                link.volume.to_string(),
                link.stop_loss.map(|d| d.to_string()),
                link.take_profit.map(|d| d.to_string()),
                link.last_error,
                link.attempt_count,
                link.last_attempt_at.map(|t| t.to_rfc3339()),
                link.created_at.to_rfc3339(),
                link.provider_opened_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn archive_links(&self, links: &[CopyLink], archived_at: DateTime<Utc>) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction()?;

        for link in links {
            tx.execute(
                r#"
                INSERT INTO link_history (provider_position_id, target, state, symbol, side, volume,
                                          last_error, attempt_count, created_at, provider_opened_at,
                                          archived_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
                params![
                    link.key.provider_position_id,
                    link.key.target.to_string(),
                    link.state.as_str(),
                    link.symbol,
                    link.side.as_str(),
                    link.volume.to_string(),
                    link.last_error,
                    link.attempt_count,
                    link.created_at.to_rfc3339(),
                    link.provider_opened_at.to_rfc3339(),
                    archived_at.to_rfc3339(),
                ],
            )?;
            tx.execute(
                "DELETE FROM copy_links WHERE provider_position_id = ?1 AND target = ?2",
                params![link.key.provider_position_id, link.key.target.to_string()],
            )?;
        }

        tx.commit()?;
        debug!(archived = links.len(), "Links archived");
        Ok(())
    }

    fn load_retry_tasks(&self) -> Result<Vec<RetryTask>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT provider_position_id, target, kind, not_before, attempt_count FROM retry_tasks",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, u64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, u32>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(position_id, target, kind, not_before, attempt_count)| -> Result<RetryTask, StoreError> {
                Ok(RetryTask {
                    key: LinkKey::new(position_id, parse_with::<LinkTarget>("target", &target)?),
                    kind: parse_with::<OperationKind>("kind", &kind)?,
                    not_before: parse_time("not_before", &not_before)?,
                    attempt_count,
                })
            })
            .collect()
    }

    fn save_retry_task(&self, task: &RetryTask) -> Result<(), StoreError> {
        self.conn.execute(
            r#"
            INSERT INTO retry_tasks (provider_position_id, target, kind, not_before, attempt_count)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(provider_position_id, target) DO UPDATE SET
                kind = ?3,
                not_before = ?4,
                attempt_count = ?5
            "#,
            params![
                task.key.provider_position_id,
                task.key.target.to_string(),
                task.kind.as_str(),
                task.not_before.to_rfc3339(),
                task.attempt_count,
            ],
        )?;
        Ok(())
    }

    fn delete_retry_task(&self, key: &LinkKey) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM retry_tasks WHERE provider_position_id = ?1 AND target = ?2",
            params![key.provider_position_id, key.target.to_string()],
        )?;
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Vec<ProviderPosition>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT position_id, symbol, side, volume, open_price, stop_loss, take_profit,
                   opened_at, comment
            FROM provider_snapshot
            ORDER BY position_id
            "#,
        )?;

        type SnapshotRow = (u64, String, String, String, String, Option<String>, Option<String>, String, String);
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<SnapshotRow>>>()?;

        rows.into_iter()
            .map(
                |(position_id, symbol, side, volume, open_price, stop_loss, take_profit, opened_at, comment)|
                 -> Result<ProviderPosition, StoreError> {
                    Ok(ProviderPosition {
                        position_id,
                        symbol,
                        side: parse_with::<Side>("side", &side)?,
                        volume: parse_decimal("volume", &volume)?,
                        open_price: parse_decimal("open_price", &open_price)?,
                        stop_loss: parse_optional_decimal("stop_loss", stop_loss)?,
                        take_profit: parse_optional_decimal("take_profit", take_profit)?,
                        opened_at: parse_time("opened_at", &opened_at)?,
                        comment,
                    })
                },
            )
            .collect()
    }

    fn save_snapshot(&self, positions: &[ProviderPosition]) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute("DELETE FROM provider_snapshot", [])?;
        for pos in positions {
            tx.execute(
                r#"
                INSERT INTO provider_snapshot (position_id, symbol, side, volume, open_price,
                                               stop_loss, take_profit, opened_at, comment)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    pos.position_id,
                    pos.symbol,
                    pos.side.as_str(),
                    pos.volume.to_string(),
                    pos.open_price.to_string(),
                    pos.stop_loss.map(|d| d.to_string()),
                    pos.take_profit.map(|d| d.to_string()),
                    pos.opened_at.to_rfc3339(),
                    pos.comment,
                ],
            )?;
        }

        tx.commit()?;
        debug!(positions = positions.len(), "Provider snapshot saved");
        Ok(())
    }

    fn enqueue_command(&self, command: &ManualCommand) -> Result<(), StoreError> {
        let (name, position_id, account_id) = match command {
            ManualCommand::CloseOne(position_id) => (COMMAND_CLOSE_ONE, Some(*position_id), None),
            ManualCommand::CloseAll => (COMMAND_CLOSE_ALL, None, None),
            ManualCommand::SetReceiverEnabled { account_id, enabled } => {
                let name = if *enabled {
                    COMMAND_ENABLE_RECEIVER
                } else {
                    COMMAND_DISABLE_RECEIVER
                };
                (name, None, Some(account_id.as_str()))
            }
        };
        self.conn.execute(
            "INSERT INTO manual_commands (command, position_id, account_id, requested_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, position_id, account_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn load_commands(&self) -> Result<Vec<QueuedCommand>, StoreError> {
        let rows = {
            let mut stmt = self
                .conn
                .prepare("SELECT id, command, position_id, account_id FROM manual_commands ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<u64>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut commands = Vec::with_capacity(rows.len());
        for (id, name, position_id, account_id) in rows {
            let command = match (name.as_str(), position_id, account_id) {
                (COMMAND_CLOSE_ALL, _, _) => ManualCommand::CloseAll,
                (COMMAND_CLOSE_ONE, Some(position_id), _) => ManualCommand::CloseOne(position_id),
                (COMMAND_ENABLE_RECEIVER, _, Some(account_id)) => ManualCommand::SetReceiverEnabled {
                    account_id,
                    enabled: true,
                },
                (COMMAND_DISABLE_RECEIVER, _, Some(account_id)) => ManualCommand::SetReceiverEnabled {
                    account_id,
                    enabled: false,
                },
                _ => {
                    warn!(id, command = %name, "Dropping malformed manual command");
                    self.conn
                        .execute("DELETE FROM manual_commands WHERE id = ?1", params![id])?;
                    continue;
                }
            };
            commands.push(QueuedCommand { id, command });
        }
        Ok(commands)
    }

    fn ack_commands(&self, through_id: i64) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM manual_commands WHERE id <= ?1", params![through_id])?;
        Ok(())
    }
}
