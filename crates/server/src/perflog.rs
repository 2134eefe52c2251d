//! Engine profiling samples
//!
//! When a command is sampled, the engine's perf context is captured as text
//! and kept in a bounded ring for inspection.

use parking_lot::Mutex;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct PerfEntry {
    pub cmd_name: String,
    pub duration_us: u64,
    pub perf_context: String,
    pub iostats_context: String,
}

pub struct PerfLog {
    max_len: usize,
    entries: Mutex<VecDeque<PerfEntry>>,
}

impl PerfLog {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_entry(&self, entry: PerfEntry) {
        if self.max_len == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        entries.push_front(entry);
        while entries.len() > self.max_len {
            entries.pop_back();
        }
    }

    pub fn latest(&self, count: usize) -> Vec<PerfEntry> {
        self.entries.lock().iter().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn reset(&self) {
        self.entries.lock().clear();
    }
}
