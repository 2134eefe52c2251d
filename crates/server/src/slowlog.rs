//! Slow query log
//!
//! Commands slower than the configured threshold land in a bounded ring,
//! newest first, with a monotonically increasing id.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Clone)]
pub struct SlowLogEntry {
    pub id: u64,
    pub timestamp: i64,
    pub duration_us: u64,
    pub args: Vec<String>,
}

pub struct SlowLog {
    slower_than_us: AtomicI64,
    max_len: usize,
    next_id: AtomicU64,
    entries: Mutex<VecDeque<SlowLogEntry>>,
}

impl SlowLog {
    pub fn new(slower_than_us: i64, max_len: usize) -> Self {
        Self {
            slower_than_us: AtomicI64::new(slower_than_us),
            max_len,
            next_id: AtomicU64::new(0),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn set_slower_than(&self, slower_than_us: i64) {
        self.slower_than_us.store(slower_than_us, Ordering::Relaxed);
    }

    pub fn push_entry_if_needed(&self, args: &[Bytes], duration_us: u64) {
        let slower_than = self.slower_than_us.load(Ordering::Relaxed);
        if slower_than < 0 || self.max_len == 0 {
            return;
        }
        if duration_us < slower_than as u64 {
            return;
        }
        let entry = SlowLogEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp: chrono::Utc::now().timestamp(),
            duration_us,
            args: args
                .iter()
                .map(|a| String::from_utf8_lossy(a).into_owned())
                .collect(),
        };
        let mut entries = self.entries.lock();
        entries.push_front(entry);
        while entries.len() > self.max_len {
            entries.pop_back();
        }
    }

    /// Newest `count` entries
    pub fn latest(&self, count: usize) -> Vec<SlowLogEntry> {
        self.entries.lock().iter().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn reset(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(tokens: &[&str]) -> Vec<Bytes> {
        tokens.iter().map(|t| Bytes::from(t.to_string())).collect()
    }

    #[test]
    fn test_threshold_and_order() {
        let slowlog = SlowLog::new(1000, 4);
        slowlog.push_entry_if_needed(&args(&["get", "fast"]), 10);
        assert_eq!(slowlog.len(), 0);

        slowlog.push_entry_if_needed(&args(&["get", "slow1"]), 2000);
        slowlog.push_entry_if_needed(&args(&["get", "slow2"]), 3000);
        assert_eq!(slowlog.len(), 2);
        let latest = slowlog.latest(10);
        assert_eq!(latest[0].args, vec!["get", "slow2"]);
        assert_eq!(latest[1].args, vec!["get", "slow1"]);
        assert!(latest[0].id > latest[1].id);
    }

    #[test]
    fn test_bounded_length() {
        let slowlog = SlowLog::new(0, 2);
        for i in 0..5 {
            slowlog.push_entry_if_needed(&args(&["cmd", &i.to_string()]), 1);
        }
        assert_eq!(slowlog.len(), 2);
        assert_eq!(slowlog.latest(10)[0].args[1], "4");
        slowlog.reset();
        assert!(slowlog.is_empty());
    }

    #[test]
    fn test_negative_threshold_disables() {
        let slowlog = SlowLog::new(-1, 4);
        slowlog.push_entry_if_needed(&args(&["get", "k"]), u64::MAX);
        assert!(slowlog.is_empty());
    }
}
