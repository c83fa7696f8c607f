//! Replication alerts.
//!
//! Raised when a copy needs operator attention:
//! - A target rejected an operation outright
//! - Retries ran out
//! - A protective-level update was abandoned
//! - The state store refused a write
//! - The provider terminal stopped answering
//!
//! Alerts are emitted as single-line JSON on the `copier_alert` target so
//! they can be grepped out of the rolling log files.

use crate::persistence::StoreError;
use crate::replication::{LinkKey, OperationKind};
use crate::terminal::TerminalError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum AlertKind {
    /// Target refused an operation with a non-retryable code
    PermanentRejection {
        link: String,
        operation: OperationKind,
        code: Option<i32>,
    },
    /// Operation failed on every allowed attempt
    RetriesExhausted {
        link: String,
        operation: OperationKind,
        attempts: u32,
    },
    /// Stop loss / take profit could not be synced; copy stays open
    ModifyAbandoned { link: String },
    PersistenceFailure { action: String },
    ProviderUnavailable,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicationAlert {
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub suggested_action: String,
}

static ALERT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

impl ReplicationAlert {
    fn new(kind: AlertKind, severity: AlertSeverity, message: String, suggested_action: &str) -> Self {
        let timestamp = Utc::now();
        let sequence = ALERT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self {
            alert_id: format!("copier-{}-{:06}", timestamp.timestamp(), sequence),
            timestamp,
            kind,
            severity,
            message,
            suggested_action: suggested_action.to_string(),
        }
    }

    pub fn permanent_rejection(key: &LinkKey, operation: OperationKind, code: Option<i32>, message: &str) -> Self {
        let action = match operation {
            OperationKind::Close => "Close the receiver position by hand",
            _ => "Check symbol, volume and trading permissions on the target account",
        };
        Self::new(
            AlertKind::PermanentRejection {
                link: key.to_string(),
                operation,
                code,
            },
            AlertSeverity::Error,
            format!("{operation} for {key} rejected: {message}"),
            action,
        )
    }

    pub fn retries_exhausted(key: &LinkKey, operation: OperationKind, attempts: u32, last_error: &str) -> Self {
        let severity = if operation == OperationKind::Close {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Error
        };
        Self::new(
            AlertKind::RetriesExhausted {
                link: key.to_string(),
                operation,
                attempts,
            },
            severity,
            format!("{operation} for {key} failed {attempts} times: {last_error}"),
            "Check the target terminal connection",
        )
    }

    pub fn modify_abandoned(key: &LinkKey, reason: &str) -> Self {
        Self::new(
            AlertKind::ModifyAbandoned { link: key.to_string() },
            AlertSeverity::Warning,
            format!("Protective levels for {key} not synced: {reason}"),
            "Verify stop loss and take profit on the receiver",
        )
    }

    pub fn persistence_failure(action: &str, error: &StoreError) -> Self {
        Self::new(
            AlertKind::PersistenceFailure {
                action: action.to_string(),
            },
            AlertSeverity::Critical,
            format!("State store write failed during {action}: {error}"),
            "Check disk space and database permissions",
        )
    }

    pub fn provider_unavailable(error: &TerminalError) -> Self {
        Self::new(
            AlertKind::ProviderUnavailable,
            AlertSeverity::Warning,
            format!("Provider snapshot failed: {error}"),
            "Check the provider terminal bridge",
        )
    }

    /// Emit alert as structured log.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();

        match self.severity {
            AlertSeverity::Info => info!(target: "copier_alert", "COPIER_ALERT: {}", json),
            AlertSeverity::Warning => warn!(target: "copier_alert", "COPIER_ALERT: {}", json),
            AlertSeverity::Error | AlertSeverity::Critical => {
                error!(target: "copier_alert", "COPIER_ALERT: {}", json)
            }
        }
    }
}

/// Most recent alerts, oldest dropped first.
#[derive(Debug)]
pub struct AlertLog {
    alerts: VecDeque<ReplicationAlert>,
    capacity: usize,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            alerts: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, alert: ReplicationAlert) {
        if self.alerts.len() == self.capacity {
            self.alerts.pop_front();
        }
        self.alerts.push_back(alert);
    }

    pub fn at_least(&self, severity: AlertSeverity) -> Vec<&ReplicationAlert> {
        self.alerts.iter().filter(|a| a.severity >= severity).collect()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}

impl Default for AlertLog {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::LinkTarget;

    #[test]
    fn test_alert_serializes_with_kind_tag() {
        let key = LinkKey::new(12, LinkTarget::receiver("R1"));
        let alert = ReplicationAlert::retries_exhausted(&key, OperationKind::Close, 5, "timeout");

        assert_eq!(alert.severity, AlertSeverity::Critical);
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["kind"]["type"], "RetriesExhausted");
        assert_eq!(json["kind"]["operation"], "close");
        assert_eq!(json["kind"]["link"], "12→receiver:R1");
    }

    #[test]
    fn test_alert_ids_are_unique() {
        let key = LinkKey::new(1, LinkTarget::ProviderDuplicate);
        let a = ReplicationAlert::modify_abandoned(&key, "x");
        let b = ReplicationAlert::modify_abandoned(&key, "x");
        assert_ne!(a.alert_id, b.alert_id);
    }

    #[test]
    fn test_alert_log_is_bounded() {
        let mut log = AlertLog::new(2);
        let key = LinkKey::new(1, LinkTarget::ProviderDuplicate);
        for _ in 0..3 {
            log.push(ReplicationAlert::modify_abandoned(&key, "x"));
        }
        log.push(ReplicationAlert::persistence_failure(
            "create link",
            &StoreError::Unavailable("disk full".into()),
        ));
        assert_eq!(log.len(), 2);
        assert_eq!(log.at_least(AlertSeverity::Error).len(), 1);
    }
}
