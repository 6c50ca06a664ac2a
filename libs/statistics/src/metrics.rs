//! Statistics monitoring counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct StatisticsMetrics {
    pub nodes_registered: AtomicU64,
    pub nodes_unregistered: AtomicU64,
    pub cycles_started: AtomicU64,
    pub cycles_completed: AtomicU64,
    pub requests_sent: AtomicU64,
    pub send_failures: AtomicU64,
    pub capabilities_skipped: AtomicU64,
    pub responses_accepted: AtomicU64,
    pub stale_responses: AtomicU64,
    pub timeouts: AtomicU64,
    pub operations_enqueued: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsStats {
    pub nodes_registered: u64,
    pub nodes_unregistered: u64,
    pub cycles_started: u64,
    pub cycles_completed: u64,
    pub requests_sent: u64,
    pub send_failures: u64,
    pub capabilities_skipped: u64,
    pub responses_accepted: u64,
    pub stale_responses: u64,
    pub timeouts: u64,
    pub operations_enqueued: u64,
}

impl StatisticsMetrics {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> StatisticsStats {
        StatisticsStats {
            nodes_registered: self.nodes_registered.load(Ordering::Relaxed),
            nodes_unregistered: self.nodes_unregistered.load(Ordering::Relaxed),
            cycles_started: self.cycles_started.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            capabilities_skipped: self.capabilities_skipped.load(Ordering::Relaxed),
            responses_accepted: self.responses_accepted.load(Ordering::Relaxed),
            stale_responses: self.stale_responses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            operations_enqueued: self.operations_enqueued.load(Ordering::Relaxed),
        }
    }
}
