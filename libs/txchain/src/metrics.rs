//! Monitoring counters for chain managers and the registry

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-manager counters
#[derive(Debug, Default)]
pub struct ChainMetrics {
    pub operations_enqueued: AtomicU64,
    pub operations_committed: AtomicU64,
    pub operations_rejected: AtomicU64,
    pub operations_discarded: AtomicU64,
    pub commits: AtomicU64,
    pub commit_failures: AtomicU64,
}

/// Point-in-time copy of [`ChainMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainStats {
    pub operations_enqueued: u64,
    pub operations_committed: u64,
    pub operations_rejected: u64,
    pub operations_discarded: u64,
    pub commits: u64,
    pub commit_failures: u64,
}

impl ChainMetrics {
    pub fn record_commit(&self, operations: usize) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.operations_committed
            .fetch_add(operations as u64, Ordering::Relaxed);
    }

    pub fn record_commit_failure(&self, operations: usize) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
        self.operations_discarded
            .fetch_add(operations as u64, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> ChainStats {
        ChainStats {
            operations_enqueued: self.operations_enqueued.load(Ordering::Relaxed),
            operations_committed: self.operations_committed.load(Ordering::Relaxed),
            operations_rejected: self.operations_rejected.load(Ordering::Relaxed),
            operations_discarded: self.operations_discarded.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
        }
    }
}

/// Registry-wide counters
#[derive(Debug, Default)]
pub struct RegistryMetrics {
    pub managers_created: AtomicU64,
    pub managers_removed: AtomicU64,
    pub connections_waiting: AtomicU64,
    pub connections_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub managers_created: u64,
    pub managers_removed: u64,
    pub connections_waiting: u64,
    pub connections_dropped: u64,
}

impl RegistryMetrics {
    pub fn get_stats(&self) -> RegistryStats {
        RegistryStats {
            managers_created: self.managers_created.load(Ordering::Relaxed),
            managers_removed: self.managers_removed.load(Ordering::Relaxed),
            connections_waiting: self.connections_waiting.load(Ordering::Relaxed),
            connections_dropped: self.connections_dropped.load(Ordering::Relaxed),
        }
    }
}
