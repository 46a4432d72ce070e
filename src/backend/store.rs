use crate::backend::clock::Timestamp;
use dashmap::DashMap;
use std::collections::VecDeque;

/// The admitted request timestamps of a single client, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestLog {
    entries: VecDeque<Timestamp>,
}

impl RequestLog {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn oldest(&self) -> Option<Timestamp> {
        self.entries.front().copied()
    }

    pub fn newest(&self) -> Option<Timestamp> {
        self.entries.back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = Timestamp> + '_ {
        self.entries.iter().copied()
    }

    /// Appends a timestamp.
    ///
    /// A timestamp older than the newest entry is clamped up to it, keeping the log ordered.
    pub fn record(&mut self, timestamp: Timestamp) {
        let timestamp = match self.newest() {
            Some(newest) if newest > timestamp => newest,
            _ => timestamp,
        };
        self.entries.push_back(timestamp);
    }

    /// Drops every entry strictly older than `window_start`.
    ///
    /// Returns the number of entries removed.
    pub fn prune(&mut self, window_start: Timestamp) -> usize {
        // Ordered, so stale entries are always at the front
        let stale = self.entries.partition_point(|t| *t < window_start);
        self.entries.drain(..stale);
        stale
    }

    /// Removes the most recent occurrence of `timestamp`, returning whether it was found.
    pub fn remove(&mut self, timestamp: Timestamp) -> bool {
        match self.entries.iter().rposition(|t| *t == timestamp) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Request logs for every client key that has been seen.
///
/// Each key is guarded by its [DashMap] shard lock, so operations on different keys can run
/// in parallel while operations on the same key are serialized.
#[derive(Debug, Default)]
pub struct RateLimitStore {
    logs: DashMap<String, RequestLog>,
}

impl RateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the log for `key`, creating an empty log on first access.
    pub fn get_log(&self, key: &str) -> RequestLog {
        self.logs.entry(key.to_owned()).or_default().clone()
    }

    pub fn record(&self, key: &str, timestamp: Timestamp) {
        self.update(key, |log| log.record(timestamp));
    }

    pub fn prune(&self, key: &str, window_start: Timestamp) {
        self.update(key, |log| {
            log.prune(window_start);
        });
    }

    /// Runs `f` with exclusive access to the log for `key`.
    ///
    /// Nothing else can read or write this key's log until `f` returns, so `f` must not block.
    pub fn update<R>(&self, key: &str, f: impl FnOnce(&mut RequestLog) -> R) -> R {
        let mut log = match self.logs.get_mut(key) {
            Some(log) => log,
            None => self.logs.entry(key.to_owned()).or_default(),
        };
        f(log.value_mut())
    }

    /// Like [RateLimitStore::update] but does not create a missing log.
    pub fn update_existing<R>(&self, key: &str, f: impl FnOnce(&mut RequestLog) -> R) -> Option<R> {
        self.logs.get_mut(key).map(|mut log| f(log.value_mut()))
    }

    pub fn remove(&self, key: &str) -> Option<RequestLog> {
        self.logs.remove(key).map(|(_, log)| log)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.logs.contains_key(key)
    }

    /// Number of tracked client keys.
    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    /// Keeps only the logs for which `f` returns true.
    pub fn retain(&self, mut f: impl FnMut(&str, &mut RequestLog) -> bool) {
        self.logs.retain(|key, log| f(key, log));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_log_creates_empty_log() {
        let store = RateLimitStore::new();
        assert!(!store.contains_key("KEY1"));
        assert!(store.get_log("KEY1").is_empty());
        assert!(store.contains_key("KEY1"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_prune_is_strict_and_preserves_order() {
        let store = RateLimitStore::new();
        for t in [10, 20, 30, 40] {
            store.record("KEY1", t);
        }
        store.prune("KEY1", 30);
        assert_eq!(store.get_log("KEY1").iter().collect::<Vec<_>>(), vec![30, 40]);
        // Other keys untouched
        store.record("KEY2", 5);
        store.prune("KEY1", 1000);
        assert!(store.get_log("KEY1").is_empty());
        assert_eq!(store.get_log("KEY2").len(), 1);
    }

    #[test]
    fn test_record_never_goes_backwards() {
        let mut log = RequestLog::default();
        log.record(100);
        log.record(50);
        assert_eq!(log.iter().collect::<Vec<_>>(), vec![100, 100]);
    }

    #[test]
    fn test_remove_latest_occurrence() {
        let mut log = RequestLog::default();
        for t in [1, 2, 2, 3] {
            log.record(t);
        }
        assert!(log.remove(2));
        assert_eq!(log.iter().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(!log.remove(7));
    }

    #[test]
    fn test_retain() {
        let store = RateLimitStore::new();
        store.record("KEY1", 1);
        store.record("KEY2", 100);
        store.retain(|_, log| log.newest().unwrap_or(0) > 50);
        assert!(!store.contains_key("KEY1"));
        assert!(store.contains_key("KEY2"));
    }
}
