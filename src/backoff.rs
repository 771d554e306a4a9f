//! Per node group backoff after failed scale-ups

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

/// Tracks which node groups must not be scaled up for a while
pub trait Backoff: Send + std::fmt::Debug {
    /// Back off the group starting at `now`; returns the end of the window
    fn backoff(&mut self, node_group: &str, now: DateTime<Utc>) -> DateTime<Utc>;

    fn is_backed_off(&self, node_group: &str, now: DateTime<Utc>) -> bool;

    /// Forget the group after a successful scale-up
    fn remove_backoff(&mut self, node_group: &str);

    /// Forget groups that have not failed for longer than the reset timeout
    fn remove_stale_backoff_data(&mut self, now: DateTime<Utc>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BackoffInfo {
    duration: Duration,
    backoff_until: DateTime<Utc>,
    last_failed_execution: DateTime<Utc>,
}

/// Backoff that doubles on every failure outside an active window
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    reset_timeout: Duration,
    info: HashMap<String, BackoffInfo>,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, reset_timeout: Duration) -> Self {
        Self {
            initial,
            max,
            reset_timeout,
            info: HashMap::new(),
        }
    }

    /// Current backoff duration of a group, if it has one
    pub fn duration(&self, node_group: &str) -> Option<Duration> {
        self.info.get(node_group).map(|i| i.duration)
    }

    pub fn len(&self) -> usize {
        self.info.len()
    }

    pub fn is_empty(&self) -> bool {
        self.info.is_empty()
    }
}

impl Backoff for ExponentialBackoff {
    fn backoff(&mut self, node_group: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        let duration = match self.info.get(node_group) {
            // Concurrent failures inside one window keep the duration
            Some(info) if info.backoff_until < now => std::cmp::min(info.duration * 2, self.max),
            Some(info) => info.duration,
            None => self.initial,
        };

        let backoff_until = now + duration;
        self.info.insert(
            node_group.to_string(),
            BackoffInfo {
                duration,
                backoff_until,
                last_failed_execution: now,
            },
        );
        backoff_until
    }

    fn is_backed_off(&self, node_group: &str, now: DateTime<Utc>) -> bool {
        self.info
            .get(node_group)
            .map(|i| i.backoff_until > now)
            .unwrap_or(false)
    }

    fn remove_backoff(&mut self, node_group: &str) {
        self.info.remove(node_group);
    }

    fn remove_stale_backoff_data(&mut self, now: DateTime<Utc>) {
        let reset = self.reset_timeout;
        self.info
            .retain(|_, info| info.last_failed_execution + reset >= now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::minutes(10),
            Duration::hours(1),
            Duration::hours(3),
        )
    }

    #[test]
    fn test_backoff_doubles_and_saturates() {
        let mut b = backoff();
        let mut now = Utc::now();

        let until = b.backoff("ng1", now);
        assert_eq!(b.duration("ng1"), Some(Duration::minutes(10)));
        assert_eq!(until, now + Duration::minutes(10));

        now = until + Duration::seconds(1);
        b.backoff("ng1", now);
        assert_eq!(b.duration("ng1"), Some(Duration::minutes(20)));

        for _ in 0..7 {
            now = now + Duration::hours(2);
            b.backoff("ng1", now);
            assert!(b.duration("ng1").unwrap() <= Duration::hours(1));
        }
        assert_eq!(b.duration("ng1"), Some(Duration::hours(1)));
    }

    #[test]
    fn test_failure_inside_window_keeps_duration() {
        let mut b = backoff();
        let now = Utc::now();
        b.backoff("ng1", now);

        let later = now + Duration::minutes(5);
        let until = b.backoff("ng1", later);
        assert_eq!(b.duration("ng1"), Some(Duration::minutes(10)));
        assert_eq!(until, later + Duration::minutes(10));
    }

    #[test]
    fn test_is_backed_off() {
        let mut b = backoff();
        let now = Utc::now();
        assert!(!b.is_backed_off("ng1", now));

        let until = b.backoff("ng1", now);
        assert!(b.is_backed_off("ng1", now + Duration::minutes(9)));
        assert!(!b.is_backed_off("ng1", until));

        b.remove_backoff("ng1");
        assert!(!b.is_backed_off("ng1", now));
    }

    #[test]
    fn test_remove_stale_backoff_data_is_idempotent() {
        let mut b = backoff();
        let now = Utc::now();
        b.backoff("old", now - Duration::hours(4));
        b.backoff("recent", now - Duration::hours(1));

        b.remove_stale_backoff_data(now);
        let once = b.info.clone();
        b.remove_stale_backoff_data(now);

        assert_eq!(b.info, once);
        assert_eq!(b.len(), 1);
        assert!(b.duration("recent").is_some());
    }
}
