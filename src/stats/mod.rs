//! Process-wide event counters.
//!
//! One registry for the whole process, created lazily on first use. All
//! counters are plain atomics so polling callbacks may re-enter freely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

static REGISTRY: Lazy<Arc<DriverStats>> = Lazy::new(|| Arc::new(DriverStats::default()));

/// The global counter registry.
pub fn global() -> Arc<DriverStats> {
    REGISTRY.clone()
}

#[derive(Debug, Default)]
pub struct DriverStats {
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    commands_total: AtomicU64,
    commands_current: AtomicU64,
    commands_failed: AtomicU64,
    commands_prepared: AtomicU64,
    pools: AtomicU64,
    idle_connections: AtomicU64,
    busy_connections: AtomicU64,
    multiplexing_batches_sent: AtomicU64,
    multiplexing_commands_batched: AtomicU64,
    multiplexing_write_micros: AtomicU64,
}

impl DriverStats {
    #[inline(always)]
    pub fn add_bytes_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn add_bytes_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn command_started(&self) {
        self.commands_total.fetch_add(1, Ordering::Relaxed);
        self.commands_current.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_finished(&self, failed: bool) {
        self.commands_current.fetch_sub(1, Ordering::Relaxed);
        if failed {
            self.commands_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline(always)]
    pub fn command_prepared(&self) {
        self.commands_prepared.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pool_created(&self) {
        self.pools.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_idle(&self) {
        self.idle_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_idle_gone(&self) {
        self.idle_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_busy(&self) {
        self.busy_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_busy_gone(&self) {
        self.busy_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn batch_written(&self, commands: u64, write_micros: u64) {
        self.multiplexing_batches_sent.fetch_add(1, Ordering::Relaxed);
        self.multiplexing_commands_batched
            .fetch_add(commands, Ordering::Relaxed);
        self.multiplexing_write_micros
            .fetch_add(write_micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let batches = self.multiplexing_batches_sent.load(Ordering::Relaxed);
        let batched = self.multiplexing_commands_batched.load(Ordering::Relaxed);
        let write_micros = self.multiplexing_write_micros.load(Ordering::Relaxed);
        let total = self.commands_total.load(Ordering::Relaxed);
        let prepared = self.commands_prepared.load(Ordering::Relaxed);
        StatsSnapshot {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            commands_total: total,
            commands_current: self.commands_current.load(Ordering::Relaxed),
            commands_failed: self.commands_failed.load(Ordering::Relaxed),
            prepared_commands_ratio: if total == 0 {
                0.0
            } else {
                prepared as f64 / total as f64
            },
            pools: self.pools.load(Ordering::Relaxed),
            idle_connections: self.idle_connections.load(Ordering::Relaxed),
            busy_connections: self.busy_connections.load(Ordering::Relaxed),
            multiplexing_batches_sent: batches,
            multiplexing_commands_per_batch: if batches == 0 {
                0.0
            } else {
                batched as f64 / batches as f64
            },
            multiplexing_write_micros_per_batch: if batches == 0 {
                0.0
            } else {
                write_micros as f64 / batches as f64
            },
        }
    }
}

/// Point-in-time view for counter pollers.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub commands_total: u64,
    pub commands_current: u64,
    pub commands_failed: u64,
    pub prepared_commands_ratio: f64,
    pub pools: u64,
    pub idle_connections: u64,
    pub busy_connections: u64,
    pub multiplexing_batches_sent: u64,
    pub multiplexing_commands_per_batch: f64,
    pub multiplexing_write_micros_per_batch: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_derive_from_totals() {
        let stats = DriverStats::default();
        stats.batch_written(4, 100);
        stats.batch_written(2, 50);
        let snap = stats.snapshot();
        assert_eq!(snap.multiplexing_batches_sent, 2);
        assert!((snap.multiplexing_commands_per_batch - 3.0).abs() < f64::EPSILON);
        assert!((snap.multiplexing_write_micros_per_batch - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn prepared_ratio_is_zero_without_commands() {
        let stats = DriverStats::default();
        assert_eq!(stats.snapshot().prepared_commands_ratio, 0.0);
        stats.command_started();
        stats.command_prepared();
        stats.command_finished(false);
        let snap = stats.snapshot();
        assert!((snap.prepared_commands_ratio - 1.0).abs() < f64::EPSILON);
        assert_eq!(snap.commands_current, 0);
    }
}
