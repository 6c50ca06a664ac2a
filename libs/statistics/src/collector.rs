//! Per-Device Statistics Collector
//!
//! ```text
//!          collect_next_statistics            last request resolved
//!   IDLE ───────────────────────────▶ COLLECTING ───────────────────▶ IDLE
//!     │                                   │
//!     └──────────── disconnect ───────────┴──────────▶ DISCONNECTED (absorbing)
//! ```
//!
//! A poll cycle holds one slot per requested capability, in poll order. Slots
//! resolve in any order (answered, timed out, send failed) but their
//! `DataCommit` operations are flushed to the chain strictly in slot order, so
//! a device's statistics always land in the same sequence.
//!
//! Requests are sent without holding the collector lock; a disconnect can
//! therefore land in the middle of a cycle and every later response for that
//! cycle is discarded as stale.

use crate::metrics::StatisticsMetrics;
use crate::quota::{QuotaGate, QuotaPermit};
use crate::rpc::{DeviceRpc, StatsRequest, StatsResponse};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use txchain::{StatOperation, TransactionChainManager};
use types::{
    Capability, CapabilitySet, CollectorState, DeviceId, IdGenerator, PluginError, RequestId, Result, SessionToken,
    TransactionId,
};

/// Result of asking a collector to start a poll cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectOutcome {
    /// Cycle started; `skipped` capabilities were denied by the quota and
    /// will be tried again next cycle
    Started {
        transaction: TransactionId,
        requested: usize,
        skipped: Vec<Capability>,
    },
    /// A previous cycle is still collecting
    Busy,
    /// Disconnected, or the chain no longer accepts statistics
    Inactive,
}

/// Result of feeding a device response to its collector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Part of a multipart reply was stored
    Partial,
    /// Request resolved; others in the cycle are still outstanding
    Accepted,
    /// Last outstanding request resolved and the collector is idle again
    CycleComplete { committed: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiredRequests {
    pub abandoned: usize,
    pub cycle_complete: bool,
}

/// Shared collaborators handed to every collector
#[derive(Clone)]
pub struct CollectorResources {
    pub rpc: Arc<dyn DeviceRpc>,
    pub global_quota: Arc<QuotaGate>,
    pub ids: Arc<IdGenerator>,
    pub metrics: Arc<StatisticsMetrics>,
}

/// Quota held for one in-flight request
struct SlotPermit {
    _device: Option<QuotaPermit>,
    _global: QuotaPermit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotStatus {
    Pending,
    Complete,
    Abandoned,
}

struct Slot {
    capability: Capability,
    request_id: RequestId,
    permit: Option<SlotPermit>,
    parts: Vec<Value>,
    status: SlotStatus,
}

impl Slot {
    fn resolve(&mut self, status: SlotStatus) {
        self.status = status;
        self.permit = None;
        if status == SlotStatus::Abandoned {
            self.parts.clear();
        }
    }
}

struct PollCycle {
    transaction: TransactionId,
    started_at: Instant,
    slots: Vec<Slot>,
    flushed: usize,
    committed: usize,
}

impl PollCycle {
    fn is_resolved(&self) -> bool {
        self.slots.iter().all(|slot| slot.status != SlotStatus::Pending)
    }

    fn outstanding(&self) -> usize {
        self.slots.iter().filter(|slot| slot.status == SlotStatus::Pending).count()
    }
}

struct CollectorInner {
    state: CollectorState,
    capabilities: CapabilitySet,
    cycle: Option<PollCycle>,
}

pub struct StatisticsCollector {
    device: DeviceId,
    session: SessionToken,
    chain: Arc<TransactionChainManager>,
    device_quota: Option<Arc<QuotaGate>>,
    resources: CollectorResources,
    inner: Mutex<CollectorInner>,
}

impl StatisticsCollector {
    /// Create an `IDLE` collector bound to the chain manager's session
    pub fn new(
        chain: Arc<TransactionChainManager>,
        capabilities: CapabilitySet,
        device_quota: Option<Arc<QuotaGate>>,
        resources: CollectorResources,
    ) -> Self {
        Self {
            device: chain.device_id().clone(),
            session: chain.session_token(),
            chain,
            device_quota,
            resources,
            inner: Mutex::new(CollectorInner {
                state: CollectorState::Idle,
                capabilities,
                cycle: None,
            }),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device
    }

    pub fn session_token(&self) -> SessionToken {
        self.session
    }

    pub fn chain(&self) -> &Arc<TransactionChainManager> {
        &self.chain
    }

    pub fn state(&self) -> CollectorState {
        self.inner.lock().state
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.inner.lock().capabilities.clone()
    }

    pub fn outstanding_requests(&self) -> usize {
        self.inner.lock().cycle.as_ref().map_or(0, PollCycle::outstanding)
    }

    /// Add a capability; polled from the next cycle on.
    ///
    /// Returns false if the collector is disconnected or already had it.
    pub fn register_additional_node_feature(&self, capability: Capability) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == CollectorState::Disconnected {
            return false;
        }
        let added = inner.capabilities.insert(capability);
        if added {
            info!(device = %self.device, capability = %capability, "Registered additional statistics feature");
        }
        added
    }

    /// Start one poll cycle if idle. Never starts a second concurrent cycle.
    pub async fn collect_next_statistics(&self, transaction: TransactionId) -> CollectOutcome {
        let metrics = &self.resources.metrics;

        let (requests, skipped) = {
            let mut inner = self.inner.lock();
            match inner.state {
                CollectorState::Disconnected => return CollectOutcome::Inactive,
                CollectorState::Collecting => {
                    debug!(device = %self.device, transaction = %transaction, "Previous poll cycle still collecting");
                    return CollectOutcome::Busy;
                }
                CollectorState::Idle => {}
            }

            if !self.chain.is_working() || !self.chain.has_statistics_producer() {
                debug!(device = %self.device, status = %self.chain.status(), "Chain not accepting statistics");
                return CollectOutcome::Inactive;
            }

            let table_count = inner.capabilities.table_count();
            let mut requests = Vec::new();
            let mut slots = Vec::new();
            let mut skipped = Vec::new();

            for capability in inner.capabilities.poll_order() {
                let Some(permit) = self.acquire_permit() else {
                    skipped.push(capability);
                    continue;
                };

                let request_id = self.resources.ids.next_request_id();
                requests.push(StatsRequest {
                    device: self.device.clone(),
                    session: self.session,
                    request_id,
                    transaction,
                    capability,
                    table_count,
                });
                slots.push(Slot {
                    capability,
                    request_id,
                    permit: Some(permit),
                    parts: Vec::new(),
                    status: SlotStatus::Pending,
                });
            }

            if !skipped.is_empty() {
                metrics
                    .capabilities_skipped
                    .fetch_add(skipped.len() as u64, Ordering::Relaxed);
                debug!(device = %self.device, skipped = ?skipped, "Quota denied, deferring to next cycle");
            }

            if slots.is_empty() {
                return CollectOutcome::Started {
                    transaction,
                    requested: 0,
                    skipped,
                };
            }

            inner.state = CollectorState::Collecting;
            inner.cycle = Some(PollCycle {
                transaction,
                started_at: Instant::now(),
                slots,
                flushed: 0,
                committed: 0,
            });
            StatisticsMetrics::bump(&metrics.cycles_started);

            (requests, skipped)
        };

        let requested = requests.len();
        for request in requests {
            let request_id = request.request_id;
            let capability = request.capability;

            match self.resources.rpc.send_request(request).await {
                Ok(()) => {
                    StatisticsMetrics::bump(&metrics.requests_sent);
                    debug!(device = %self.device, request_id = %request_id, capability = %capability, "Statistics request sent");
                }
                Err(e) => {
                    StatisticsMetrics::bump(&metrics.send_failures);
                    warn!(
                        device = %self.device,
                        request_id = %request_id,
                        capability = %capability,
                        error = %e,
                        "Failed to send statistics request"
                    );
                    self.abandon_request(request_id);
                }
            }
        }

        CollectOutcome::Started {
            transaction,
            requested,
            skipped,
        }
    }

    /// Correlate a device reply with the running cycle.
    ///
    /// Replies for another session, an unknown request id, or a collector that
    /// is not collecting are rejected as stale.
    pub fn on_response(&self, response: StatsResponse) -> Result<ResponseOutcome> {
        let mut inner = self.inner.lock();

        if response.session != self.session || inner.state != CollectorState::Collecting {
            return Err(self.stale(&response));
        }

        let slot = inner.cycle.as_mut().and_then(|cycle| {
            cycle.slots.iter_mut().find(|slot| {
                slot.request_id == response.request_id
                    && slot.capability == response.capability
                    && slot.status == SlotStatus::Pending
            })
        });
        let Some(slot) = slot else {
            return Err(self.stale(&response));
        };

        slot.parts.extend(response.body);
        if response.more {
            return Ok(ResponseOutcome::Partial);
        }
        slot.resolve(SlotStatus::Complete);
        StatisticsMetrics::bump(&self.resources.metrics.responses_accepted);

        Ok(match self.settle(&mut inner) {
            Some(committed) => ResponseOutcome::CycleComplete { committed },
            None => ResponseOutcome::Accepted,
        })
    }

    /// Abandon requests of the running cycle that have been outstanding for
    /// at least `timeout`, releasing their quota.
    pub fn expire_timed_out(&self, now: Instant, timeout: Duration) -> ExpiredRequests {
        let mut inner = self.inner.lock();

        let abandoned = match inner.cycle.as_mut() {
            Some(cycle) if now.saturating_duration_since(cycle.started_at) >= timeout => {
                let mut abandoned = 0;
                for slot in cycle.slots.iter_mut().filter(|slot| slot.status == SlotStatus::Pending) {
                    slot.resolve(SlotStatus::Abandoned);
                    abandoned += 1;
                }
                abandoned
            }
            _ => 0,
        };

        if abandoned == 0 {
            return ExpiredRequests::default();
        }

        self.resources
            .metrics
            .timeouts
            .fetch_add(abandoned as u64, Ordering::Relaxed);
        warn!(device = %self.device, abandoned, "Statistics requests timed out");

        ExpiredRequests {
            abandoned,
            cycle_complete: self.settle(&mut inner).is_some(),
        }
    }

    /// Move to `DISCONNECTED`, release quota held by in-flight requests and
    /// detach from the chain. Returns false if already disconnected.
    pub fn disconnect(&self) -> bool {
        let abandoned = {
            let mut inner = self.inner.lock();
            if inner.state == CollectorState::Disconnected {
                return false;
            }
            inner.state = CollectorState::Disconnected;
            // dropping the cycle drops every permit
            inner.cycle.take().map_or(0, |cycle| cycle.outstanding())
        };

        match self.chain.enqueue(StatOperation::NodeRemoval {
            device: self.device.clone(),
        }) {
            Ok(()) => StatisticsMetrics::bump(&self.resources.metrics.operations_enqueued),
            Err(e) => debug!(device = %self.device, error = %e, "Skipping node removal"),
        }
        self.chain.release_statistics_producer();

        info!(
            device = %self.device,
            session = %self.session,
            abandoned,
            "Statistics collector disconnected"
        );
        true
    }

    fn acquire_permit(&self) -> Option<SlotPermit> {
        let device = match &self.device_quota {
            Some(gate) => Some(gate.try_permit()?),
            None => None,
        };
        let global = self.resources.global_quota.try_permit()?;
        Some(SlotPermit {
            _device: device,
            _global: global,
        })
    }

    fn abandon_request(&self, request_id: RequestId) {
        let mut inner = self.inner.lock();
        let Some(cycle) = inner.cycle.as_mut() else {
            return;
        };
        if let Some(slot) = cycle
            .slots
            .iter_mut()
            .find(|slot| slot.request_id == request_id && slot.status == SlotStatus::Pending)
        {
            slot.resolve(SlotStatus::Abandoned);
        }
        self.settle(&mut inner);
    }

    /// Flush resolved slots in order; finish the cycle once nothing is pending
    fn settle(&self, inner: &mut CollectorInner) -> Option<usize> {
        let (transaction, committed) = match inner.cycle.as_mut() {
            Some(cycle) => {
                self.flush_resolved(cycle);
                if !cycle.is_resolved() {
                    return None;
                }
                (cycle.transaction, cycle.committed)
            }
            None => return None,
        };

        inner.cycle = None;
        inner.state = CollectorState::Idle;
        StatisticsMetrics::bump(&self.resources.metrics.cycles_completed);
        debug!(device = %self.device, transaction = %transaction, committed, "Poll cycle complete");
        Some(committed)
    }

    fn flush_resolved(&self, cycle: &mut PollCycle) {
        while let Some(slot) = cycle.slots.get_mut(cycle.flushed) {
            match slot.status {
                SlotStatus::Pending => break,
                SlotStatus::Abandoned => {}
                SlotStatus::Complete => {
                    let operation = StatOperation::DataCommit {
                        device: self.device.clone(),
                        capability: slot.capability,
                        transaction: cycle.transaction,
                        entries: std::mem::take(&mut slot.parts),
                    };
                    match self.chain.enqueue(operation) {
                        Ok(()) => {
                            cycle.committed += 1;
                            StatisticsMetrics::bump(&self.resources.metrics.operations_enqueued);
                        }
                        Err(e) => {
                            debug!(device = %self.device, capability = %slot.capability, error = %e, "Dropping statistics")
                        }
                    }
                }
            }
            cycle.flushed += 1;
        }
    }

    fn stale(&self, response: &StatsResponse) -> PluginError {
        StatisticsMetrics::bump(&self.resources.metrics.stale_responses);
        debug!(
            device = %self.device,
            request_id = %response.request_id,
            session = %response.session,
            "Discarding stale statistics response"
        );
        PluginError::stale(&self.device, response.request_id, Some(response.session))
    }
}

impl std::fmt::Debug for StatisticsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatisticsCollector")
            .field("device", &self.device)
            .field("session", &self.session)
            .field("state", &self.state())
            .finish()
    }
}
