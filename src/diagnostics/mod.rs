//! Alerts and periodic reports for operators.

mod alert;
mod report;

pub use alert::{AlertKind, AlertLog, AlertSeverity, ReplicationAlert};
pub use report::{LinkReport, LinkSummary};
