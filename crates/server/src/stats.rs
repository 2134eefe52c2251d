//! Traffic and per-command counters

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, Default)]
pub struct CommandStat {
    pub calls: u64,
    pub latency_us: u64,
}

#[derive(Default)]
pub struct Stats {
    in_bytes: AtomicU64,
    out_bytes: AtomicU64,
    total_calls: AtomicU64,
    commands: RwLock<HashMap<String, CommandStat>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_inbound_bytes(&self, n: u64) {
        self.in_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr_outbound_bytes(&self, n: u64) {
        self.out_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn in_bytes(&self) -> u64 {
        self.in_bytes.load(Ordering::Relaxed)
    }

    pub fn out_bytes(&self) -> u64 {
        self.out_bytes.load(Ordering::Relaxed)
    }

    pub fn incr_calls(&self, cmd_name: &str) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.commands
            .write()
            .entry(cmd_name.to_string())
            .or_default()
            .calls += 1;
    }

    pub fn incr_latency(&self, cmd_name: &str, duration_us: u64) {
        self.commands
            .write()
            .entry(cmd_name.to_string())
            .or_default()
            .latency_us += duration_us;
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    pub fn calls(&self, cmd_name: &str) -> u64 {
        self.commands
            .read()
            .get(cmd_name)
            .map(|s| s.calls)
            .unwrap_or(0)
    }

    pub fn command_stats(&self) -> Vec<(String, CommandStat)> {
        let mut stats: Vec<_> = self
            .commands
            .read()
            .iter()
            .map(|(name, stat)| (name.clone(), *stat))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }
}
