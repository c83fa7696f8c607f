//! Retry queue for failed terminal operations.
//!
//! Holds at most one [`RetryTask`] per link, ordered by `not_before`.
//! Scheduling a link that is already queued replaces its task.

use super::link::{LinkKey, LinkTarget};
use crate::config::{BackoffKind, ReplicationConfig};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Terminal operation a link can be waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Open,
    Modify,
    Close,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Open => "open",
            OperationKind::Modify => "modify",
            OperationKind::Close => "close",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(OperationKind::Open),
            "modify" => Ok(OperationKind::Modify),
            "close" => Ok(OperationKind::Close),
            other => Err(format!("unknown operation kind: {other}")),
        }
    }
}

/// A failed operation waiting for its next attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryTask {
    pub key: LinkKey,
    pub kind: OperationKind,
    pub not_before: DateTime<Utc>,
    /// Attempts already made for this operation
    pub attempt_count: u32,
}

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffPolicy {
    Fixed(Duration),
    /// Doubles after every attempt, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl BackoffPolicy {
    /// Delay before the next attempt, given how many were already made.
    pub fn delay(&self, attempts_made: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed(interval) => interval,
            BackoffPolicy::Exponential { base, max } => {
                let exponent = attempts_made.saturating_sub(1).min(20);
                base.checked_mul(1i32 << exponent)
                    .map_or(max, |delay| delay.min(max))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Scheduled(RetryTask),
    /// No attempts left; the task (if any) has been removed.
    Exhausted { attempts: u32 },
}

pub struct RetryManager {
    receiver_policy: BackoffPolicy,
    duplicate_policy: BackoffPolicy,
    max_attempts: u32,
    tasks: HashMap<LinkKey, RetryTask>,
    queue: BTreeSet<(DateTime<Utc>, LinkKey)>,
}

impl RetryManager {
    pub fn new(receiver_policy: BackoffPolicy, duplicate_policy: BackoffPolicy, max_attempts: u32) -> Self {
        Self {
            receiver_policy,
            duplicate_policy,
            max_attempts,
            tasks: HashMap::new(),
            queue: BTreeSet::new(),
        }
    }

    pub fn from_config(config: &ReplicationConfig) -> Self {
        let max = Duration::seconds(config.max_retry_interval_secs as i64);
        let policy = |secs: u64| {
            let interval = Duration::seconds(secs as i64);
            match config.backoff {
                BackoffKind::Fixed => BackoffPolicy::Fixed(interval),
                BackoffKind::Exponential => BackoffPolicy::Exponential { base: interval, max },
            }
        };
        Self::new(
            policy(config.retry_interval_secs),
            policy(config.duplicate_retry_interval_secs),
            config.max_attempts,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn policy_for(&self, target: &LinkTarget) -> &BackoffPolicy {
        if target.is_duplicate() {
            &self.duplicate_policy
        } else {
            &self.receiver_policy
        }
    }

    /// Queue another attempt after `attempts_made` failed ones, or report
    /// exhaustion once the limit is reached.
    pub fn schedule(
        &mut self,
        key: LinkKey,
        kind: OperationKind,
        attempts_made: u32,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        self.cancel(&key);

        if attempts_made >= self.max_attempts {
            debug!(link = %key, %kind, attempts_made, "Retry attempts exhausted");
            return RetryDecision::Exhausted {
                attempts: attempts_made,
            };
        }

        let not_before = now + self.policy_for(&key.target).delay(attempts_made);
        let task = RetryTask {
            key,
            kind,
            not_before,
            attempt_count: attempts_made,
        };
        self.insert(task.clone());
        debug!(link = %task.key, %kind, attempts_made, %not_before, "Retry scheduled");
        RetryDecision::Scheduled(task)
    }

    /// Put a persisted task back in the queue.
    pub fn restore(&mut self, task: RetryTask) {
        self.cancel(&task.key);
        self.insert(task);
    }

    fn insert(&mut self, task: RetryTask) {
        self.queue.insert((task.not_before, task.key.clone()));
        self.tasks.insert(task.key.clone(), task);
    }

    pub fn cancel(&mut self, key: &LinkKey) -> Option<RetryTask> {
        let task = self.tasks.remove(key)?;
        self.queue.remove(&(task.not_before, task.key.clone()));
        Some(task)
    }

    pub fn get(&self, key: &LinkKey) -> Option<&RetryTask> {
        self.tasks.get(key)
    }

    /// Tasks whose `not_before` has passed, earliest first.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<RetryTask> {
        self.queue
            .iter()
            .take_while(|(not_before, _)| *not_before <= now)
            .filter_map(|(_, key)| self.tasks.get(key).cloned())
            .collect()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &RetryTask> {
        self.queue.iter().filter_map(|(_, key)| self.tasks.get(key))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: u64) -> LinkKey {
        LinkKey::new(id, LinkTarget::receiver("R1"))
    }

    fn manager(max_attempts: u32) -> RetryManager {
        RetryManager::new(
            BackoffPolicy::Fixed(Duration::seconds(30)),
            BackoffPolicy::Fixed(Duration::seconds(5)),
            max_attempts,
        )
    }

    #[test]
    fn test_schedule_sets_not_before() {
        let mut retries = manager(3);
        let now = Utc::now();

        let RetryDecision::Scheduled(task) = retries.schedule(key(1), OperationKind::Open, 1, now) else {
            panic!("expected a scheduled task");
        };
        assert_eq!(task.not_before, now + Duration::seconds(30));
        assert!(retries.due(now).is_empty());
        assert_eq!(retries.due(now + Duration::seconds(30)).len(), 1);
    }

    #[test]
    fn test_one_task_per_link() {
        let mut retries = manager(5);
        let now = Utc::now();
        retries.schedule(key(1), OperationKind::Modify, 1, now);
        retries.schedule(key(1), OperationKind::Close, 1, now + Duration::seconds(1));

        assert_eq!(retries.len(), 1);
        assert_eq!(retries.tasks().count(), 1);
        assert_eq!(retries.get(&key(1)).unwrap().kind, OperationKind::Close);
    }

    #[test]
    fn test_exhaustion_removes_task() {
        let mut retries = manager(2);
        let now = Utc::now();
        retries.schedule(key(1), OperationKind::Open, 1, now);

        assert_eq!(
            retries.schedule(key(1), OperationKind::Open, 2, now),
            RetryDecision::Exhausted { attempts: 2 }
        );
        assert!(retries.is_empty());
    }

    #[test]
    fn test_due_is_time_ordered() {
        let mut retries = manager(5);
        let now = Utc::now();
        retries.schedule(key(2), OperationKind::Open, 1, now + Duration::seconds(10));
        retries.schedule(key(1), OperationKind::Open, 1, now);

        let due: Vec<u64> = retries
            .due(now + Duration::minutes(5))
            .iter()
            .map(|t| t.key.provider_position_id)
            .collect();
        assert_eq!(due, vec![1, 2]);
    }

    #[test]
    fn test_duplicate_target_uses_its_own_interval() {
        let mut retries = manager(5);
        let now = Utc::now();
        let duplicate = LinkKey::new(1, LinkTarget::ProviderDuplicate);

        let RetryDecision::Scheduled(task) = retries.schedule(duplicate, OperationKind::Open, 1, now) else {
            panic!("expected a scheduled task");
        };
        assert_eq!(task.not_before, now + Duration::seconds(5));
    }

    #[test]
    fn test_cancel() {
        let mut retries = manager(5);
        let now = Utc::now();
        retries.schedule(key(1), OperationKind::Open, 1, now);
        assert!(retries.cancel(&key(1)).is_some());
        assert!(retries.cancel(&key(1)).is_none());
        assert!(retries.due(now + Duration::days(1)).is_empty());
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = BackoffPolicy::Exponential {
            base: Duration::seconds(10),
            max: Duration::seconds(60),
        };
        assert_eq!(policy.delay(1), Duration::seconds(10));
        assert_eq!(policy.delay(2), Duration::seconds(20));
        assert_eq!(policy.delay(3), Duration::seconds(40));
        assert_eq!(policy.delay(4), Duration::seconds(60));
        assert_eq!(policy.delay(30), Duration::seconds(60));
    }

    #[test]
    fn test_operation_kind_parse() {
        assert_eq!("close".parse::<OperationKind>(), Ok(OperationKind::Close));
        assert!("cancel".parse::<OperationKind>().is_err());
    }
}
