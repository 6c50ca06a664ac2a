//! Request Quota Gate
//!
//! Non-blocking cap on outstanding device requests, backed by a tokio
//! semaphore with a fixed number of permits. A denied acquire is
//! backpressure: the caller skips the request for this round instead of
//! failing.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;
use types::{PluginError, Result};

/// Largest ceiling accepted at construction
pub const MAX_CEILING: u64 = i32::MAX as u64;

#[derive(Debug)]
pub struct QuotaGate {
    name: &'static str,
    ceiling: usize,
    semaphore: Arc<Semaphore>,
    /// Slots taken through `try_acquire` whose permits were forgotten and
    /// must come back through `release`
    detached: AtomicUsize,
    granted: AtomicU64,
    denied: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStats {
    pub ceiling: usize,
    pub outstanding: usize,
    pub granted: u64,
    pub denied: u64,
}

impl QuotaGate {
    /// Build a gate; a ceiling outside `[1, MAX_CEILING]` is a fatal
    /// configuration error.
    pub fn new(name: &'static str, ceiling: u64) -> Result<Self> {
        if ceiling == 0 || ceiling > MAX_CEILING {
            return Err(PluginError::configuration(
                format!("{} quota {} outside [1, {}]", name, ceiling, MAX_CEILING),
                Some(name),
            ));
        }

        Ok(Self {
            name,
            ceiling: ceiling as usize,
            semaphore: Arc::new(Semaphore::new(ceiling as usize)),
            detached: AtomicUsize::new(0),
            granted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        })
    }

    fn try_acquire_owned(&self) -> Option<OwnedSemaphorePermit> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                self.granted.fetch_add(1, Ordering::Relaxed);
                Some(permit)
            }
            Err(_) => {
                self.denied.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Take one slot that must be handed back with [`QuotaGate::release`]
    pub fn try_acquire(&self) -> bool {
        match self.try_acquire_owned() {
            Some(permit) => {
                self.detached.fetch_add(1, Ordering::AcqRel);
                permit.forget();
                true
            }
            None => false,
        }
    }

    /// Return a slot taken with `try_acquire`. Extra releases are ignored so
    /// the gate never holds more permits than its ceiling.
    pub fn release(&self) {
        let released = self
            .detached
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| current.checked_sub(1));

        match released {
            Ok(_) => self.semaphore.add_permits(1),
            Err(_) => warn!(quota = self.name, "Quota released more often than acquired"),
        }
    }

    /// Acquire a slot that is released when the permit drops
    pub fn try_permit(self: &Arc<Self>) -> Option<QuotaPermit> {
        self.try_acquire_owned().map(|permit| QuotaPermit { _permit: permit })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn outstanding(&self) -> usize {
        self.ceiling.saturating_sub(self.available())
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn get_stats(&self) -> QuotaStats {
        QuotaStats {
            ceiling: self.ceiling,
            outstanding: self.outstanding(),
            granted: self.granted.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
        }
    }
}

/// RAII hold on one quota slot
#[derive(Debug)]
pub struct QuotaPermit {
    _permit: OwnedSemaphorePermit,
}
