//! Periodic link report.

use crate::replication::{CopyLink, LinkState, RetryTask};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct LinkSummary {
    pub link: String,
    pub state: LinkState,
    pub symbol: String,
    pub volume: Decimal,
    pub receiver_ticket: Option<u64>,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// When the queued retry (if any) becomes due
    pub next_retry: Option<DateTime<Utc>>,
    pub age_secs: i64,
}

/// Snapshot of every tracked link, grouped by state.
#[derive(Debug, Clone, Serialize)]
pub struct LinkReport {
    pub generated_at: DateTime<Utc>,
    pub by_state: BTreeMap<String, usize>,
    pub pending_retries: usize,
    pub links: Vec<LinkSummary>,
}

impl LinkReport {
    pub fn build<'a>(
        links: impl IntoIterator<Item = &'a CopyLink>,
        retries: impl IntoIterator<Item = &'a RetryTask>,
        now: DateTime<Utc>,
    ) -> Self {
        let due: HashMap<_, _> = retries
            .into_iter()
            .map(|task| (task.key.clone(), task.not_before))
            .collect();

        let mut by_state = BTreeMap::new();
        let links: Vec<LinkSummary> = links
            .into_iter()
            .map(|link| {
                *by_state.entry(link.state.to_string()).or_insert(0) += 1;
                LinkSummary {
                    link: link.key.to_string(),
                    state: link.state,
                    symbol: link.symbol.clone(),
                    volume: link.volume,
                    receiver_ticket: link.receiver_position_id,
                    attempts: link.attempt_count,
                    last_error: link.last_error.clone(),
                    next_retry: due.get(&link.key).copied(),
                    age_secs: (now - link.created_at).num_seconds(),
                }
            })
            .collect();

        Self {
            generated_at: now,
            by_state,
            pending_retries: due.len(),
            links,
        }
    }

    pub fn count(&self, state: LinkState) -> usize {
        self.by_state.get(state.as_str()).copied().unwrap_or(0)
    }

    /// Emit as structured log.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        info!(target: "copier_report", "LINK_REPORT: {}", json);
        info!(
            "📋 [REPORT] {} links | open {} | pending open {} | pending close {} | failed {} | retries {}",
            self.links.len(),
            self.count(LinkState::Open),
            self.count(LinkState::PendingOpen),
            self.count(LinkState::PendingClose),
            self.count(LinkState::Failed),
            self.pending_retries
        );
    }
}
