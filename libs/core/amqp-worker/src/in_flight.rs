//! In-flight message tracking
//!
//! Every message handed to the callback is recorded here until it has been
//! acked or nacked, so that shutdown can wait for outstanding work.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Result of waiting for the in-flight set to empty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    TimedOut { remaining: usize },
}

/// Set of message ids currently being processed
///
/// Ids are counted, so two concurrent deliveries sharing an id are both
/// tracked. Cloning shares the underlying set.
#[derive(Debug, Clone, Default)]
pub struct InFlightTracker {
    entries: Arc<Mutex<HashMap<String, usize>>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, id: &str) {
        *self.lock().entry(id.to_string()).or_insert(0) += 1;
    }

    /// Remove one occurrence of `id`; returns false if it was not tracked
    pub fn remove(&self, id: &str) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                entries.remove(id);
                true
            }
            None => false,
        }
    }

    /// Track `id` until the returned guard is dropped
    pub fn track(&self, id: impl Into<String>) -> InFlightGuard {
        let id = id.into();
        self.insert(&id);
        InFlightGuard {
            tracker: self.clone(),
            id,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Distinct ids currently tracked, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Poll until empty or until `timeout` has elapsed
    pub async fn wait_for_drain(&self, timeout: Duration, poll_interval: Duration) -> DrainOutcome {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = self.len();
            if remaining == 0 {
                return DrainOutcome::Drained;
            }

            let now = Instant::now();
            if now >= deadline {
                return DrainOutcome::TimedOut { remaining };
            }

            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }
}

/// Removes its id from the tracker on drop, whatever the processing outcome
#[derive(Debug)]
pub struct InFlightGuard {
    tracker: InFlightTracker,
    id: String,
}

impl InFlightGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_removes_on_drop() {
        let tracker = InFlightTracker::new();
        {
            let guard = tracker.track("msg-1");
            assert_eq!(guard.id(), "msg-1");
            assert!(tracker.contains("msg-1"));
            assert_eq!(tracker.len(), 1);
        }
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_duplicate_ids_are_counted() {
        let tracker = InFlightTracker::new();
        let first = tracker.track("dup");
        let second = tracker.track("dup");
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.ids(), vec!["dup".to_string()]);

        drop(first);
        assert!(tracker.contains("dup"));
        drop(second);
        assert!(!tracker.contains("dup"));
    }

    #[test]
    fn test_remove_unknown_id() {
        let tracker = InFlightTracker::new();
        assert!(!tracker.remove("missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_drain_returns_once_empty() {
        let tracker = InFlightTracker::new();
        let guard = tracker.track("slow");

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            drop(guard);
        });

        let started = Instant::now();
        let outcome = tracker
            .wait_for_drain(Duration::from_secs(30), Duration::from_millis(100))
            .await;

        assert_eq!(outcome, DrainOutcome::Drained);
        assert!(started.elapsed() < Duration::from_secs(1));
        release.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_drain_times_out() {
        let tracker = InFlightTracker::new();
        let _stuck = tracker.track("stuck");

        let started = Instant::now();
        let outcome = tracker
            .wait_for_drain(Duration::from_secs(30), Duration::from_millis(100))
            .await;

        assert_eq!(outcome, DrainOutcome::TimedOut { remaining: 1 });
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(30));
        assert!(waited < Duration::from_secs(31));
    }

    #[tokio::test]
    async fn test_wait_for_drain_when_already_empty() {
        let tracker = InFlightTracker::new();
        let outcome = tracker
            .wait_for_drain(Duration::from_secs(1), Duration::from_millis(10))
            .await;
        assert_eq!(outcome, DrainOutcome::Drained);
    }
}
