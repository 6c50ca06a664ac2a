//! Statistics Manager
//!
//! Registry of per-device collectors plus the schedulers that drive them.
//!
//! # Node Groups
//!
//! Devices are packed into groups of at most `max_nodes_for_collector`. Each
//! group owns one scheduler task that, every `min_request_interval`, expires
//! timed-out requests and kicks a new poll cycle for each member. A group
//! whose last member leaves is removed and its task cancelled.
//!
//! ```text
//!   group 0: [d1, d2, .. d16] ── tick ──▶ expire + collect_next_statistics
//!   group 1: [d17, ..]        ── tick ──▶ ...
//!
//!   device responses ──▶ mpsc(global_notification_quota) ──▶ on_response
//! ```
//!
//! # Lock Ordering
//!
//! `groups` is never held while touching a collector. Collector locks are
//! taken before the chain manager's state lock, never the reverse.

use crate::collector::{CollectOutcome, CollectorResources, ResponseOutcome, StatisticsCollector};
use crate::metrics::{StatisticsMetrics, StatisticsStats};
use crate::quota::{QuotaGate, QuotaStats};
use crate::rpc::{DeviceRpc, StatsResponse};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use plugin_config::{PluginConfig, StatisticsConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use txchain::{Registration, StatOperation, TransactionChainManager};
use types::{Capability, CapabilitySet, CollectorState, DeviceId, IdGenerator, PluginError, Result, SessionToken, TransactionId};

struct NodeGroup {
    id: u64,
    members: Vec<DeviceId>,
    scheduler: Option<CancellationToken>,
}

#[derive(Default)]
struct NodeGroups {
    next_id: u64,
    groups: Vec<NodeGroup>,
}

pub struct StatisticsManager {
    config: StatisticsConfig,
    resources: CollectorResources,
    collectors: DashMap<DeviceId, Arc<StatisticsCollector>>,
    groups: Mutex<NodeGroups>,
    response_tx: mpsc::Sender<StatsResponse>,
    response_rx: Mutex<Option<mpsc::Receiver<StatsResponse>>>,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl StatisticsManager {
    /// Build the manager and its system-wide quota gate.
    ///
    /// Fails with a configuration error if a quota bound is invalid.
    pub fn new(config: &PluginConfig, rpc: Arc<dyn DeviceRpc>) -> Result<Self> {
        let global_quota = Arc::new(QuotaGate::new("rpc_requests_quota", config.rpc_requests_quota)?);

        let capacity = usize::try_from(config.global_notification_quota)
            .ok()
            .filter(|capacity| *capacity > 0)
            .ok_or_else(|| {
                PluginError::configuration(
                    format!("global notification quota {} is not a valid capacity", config.global_notification_quota),
                    Some("global_notification_quota"),
                )
            })?;
        let (response_tx, response_rx) = mpsc::channel(capacity);

        if let Some(0) = config.statistics.per_device_quota {
            return Err(PluginError::configuration(
                "per-device quota must be at least 1",
                Some("statistics.per_device_quota"),
            ));
        }

        Ok(Self {
            config: config.statistics.clone(),
            resources: CollectorResources {
                rpc,
                global_quota,
                ids: Arc::new(IdGenerator::default()),
                metrics: Arc::new(StatisticsMetrics::default()),
            },
            collectors: DashMap::new(),
            groups: Mutex::new(NodeGroups::default()),
            response_tx,
            response_rx: Mutex::new(Some(response_rx)),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        })
    }

    /// Register a freshly connected device for collection.
    ///
    /// Idempotent per session: a repeated call for the same session is logged
    /// and returns a no-op handle. A registration for a newer session replaces
    /// the old collector. Releasing the returned handle unregisters exactly
    /// this session.
    pub fn connected_node_registration(
        self: &Arc<Self>,
        chain: Arc<TransactionChainManager>,
        capabilities: CapabilitySet,
    ) -> Result<Registration> {
        let device = chain.device_id().clone();
        let session = chain.session_token();

        let device_quota = match self.config.per_device_quota {
            Some(ceiling) => Some(Arc::new(QuotaGate::new("per_device_quota", ceiling as u64)?)),
            None => None,
        };
        let collector = Arc::new(StatisticsCollector::new(
            Arc::clone(&chain),
            capabilities.clone(),
            device_quota,
            self.resources.clone(),
        ));

        let previous = match self.collectors.entry(device.clone()) {
            Entry::Occupied(entry) if entry.get().session_token() == session => {
                warn!(device = %device, session = %session, "Device already registered for statistics");
                return Ok(Registration::noop());
            }
            Entry::Occupied(mut entry) => Some(entry.insert(Arc::clone(&collector))),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&collector));
                None
            }
        };

        if let Some(previous) = previous {
            info!(device = %device, old_session = %previous.session_token(), "Replacing collector of superseded session");
            previous.disconnect();
        }

        let update = StatOperation::NodeUpdate {
            device: device.clone(),
            session,
            capabilities: capabilities.clone(),
        };
        if let Err(e) = chain.enqueue(update) {
            self.collectors.remove_if(&device, |_, c| c.session_token() == session);
            collector.disconnect();
            return Err(e);
        }
        StatisticsMetrics::bump(&self.resources.metrics.operations_enqueued);

        self.join_group(&device);
        StatisticsMetrics::bump(&self.resources.metrics.nodes_registered);
        info!(
            device = %device,
            session = %session,
            capabilities = capabilities.len(),
            table_count = capabilities.table_count(),
            "Device registered for statistics collection"
        );

        let manager: Weak<Self> = Arc::downgrade(self);
        Ok(Registration::new(move || {
            if let Some(manager) = manager.upgrade() {
                manager.unregister(&device, Some(session));
            }
        }))
    }

    /// Stop collecting from `device`, whatever its session
    pub fn disconnected_node_unregistration(&self, device: &DeviceId) -> bool {
        self.unregister(device, None)
    }

    fn unregister(&self, device: &DeviceId, session: Option<SessionToken>) -> bool {
        let removed = match session {
            Some(session) => self.collectors.remove_if(device, |_, c| c.session_token() == session),
            None => self.collectors.remove(device),
        };
        let Some((_, collector)) = removed else {
            return false;
        };

        collector.disconnect();
        self.leave_group(device);
        StatisticsMetrics::bump(&self.resources.metrics.nodes_unregistered);
        info!(device = %device, session = %collector.session_token(), "Device unregistered from statistics collection");
        true
    }

    pub fn register_additional_node_feature(&self, device: &DeviceId, capability: Capability) -> Result<bool> {
        let collector = self.collector(device).ok_or_else(|| PluginError::not_registered(device))?;
        Ok(collector.register_additional_node_feature(capability))
    }

    pub async fn collect_next_statistics(&self, device: &DeviceId, transaction: TransactionId) -> Result<CollectOutcome> {
        let collector = self.collector(device).ok_or_else(|| PluginError::not_registered(device))?;
        Ok(collector.collect_next_statistics(transaction).await)
    }

    /// Route a device reply to its collector; submits the chain when the
    /// reply completes a cycle.
    pub async fn on_response(&self, response: StatsResponse) -> Result<ResponseOutcome> {
        let Some(collector) = self.collector(&response.device) else {
            StatisticsMetrics::bump(&self.resources.metrics.stale_responses);
            debug!(device = %response.device, request_id = %response.request_id, "Response for unregistered device");
            return Err(PluginError::stale(&response.device, response.request_id, Some(response.session)));
        };

        let outcome = collector.on_response(response)?;
        if let ResponseOutcome::CycleComplete { .. } = outcome {
            Self::commit_cycle(&collector).await?;
        }
        Ok(outcome)
    }

    /// Expire timed-out requests across every collector
    pub async fn sweep_timeouts(&self) -> usize {
        let now = std::time::Instant::now();
        let timeout = self.config.request_timeout();
        let mut abandoned = 0;

        for collector in self.snapshot() {
            let expired = collector.expire_timed_out(now, timeout);
            abandoned += expired.abandoned;
            if expired.cycle_complete {
                let _ = Self::commit_cycle(&collector).await;
            }
        }
        abandoned
    }

    pub fn is_provided_flow_node_active(&self, device: &DeviceId) -> bool {
        self.collector(device).is_some_and(|c| c.state() != CollectorState::Disconnected && c.chain().is_working())
    }

    /// Session token the device was accepted with, if it is registered
    pub fn generated_uuid_for_node(&self, device: &DeviceId) -> Option<SessionToken> {
        self.collector(device).map(|c| c.session_token())
    }

    pub fn collector(&self, device: &DeviceId) -> Option<Arc<StatisticsCollector>> {
        self.collectors.get(device).map(|entry| Arc::clone(entry.value()))
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        self.collectors.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// Sizes of the node groups, in creation order
    pub fn group_sizes(&self) -> Vec<usize> {
        self.groups.lock().groups.iter().map(|g| g.members.len()).collect()
    }

    pub fn response_sender(&self) -> mpsc::Sender<StatsResponse> {
        self.response_tx.clone()
    }

    pub fn next_transaction_id(&self) -> TransactionId {
        self.resources.ids.next_transaction_id()
    }

    pub fn metrics(&self) -> StatisticsStats {
        self.resources.metrics.get_stats()
    }

    pub fn quota_stats(&self) -> QuotaStats {
        self.resources.global_quota.get_stats()
    }

    /// Start the response pump and one scheduler per node group
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(receiver) = self.response_rx.lock().take() {
            self.spawn_response_pump(receiver);
        }

        let mut groups = self.groups.lock();
        for group in groups.groups.iter_mut().filter(|g| g.scheduler.is_none()) {
            group.scheduler = Some(self.spawn_group_scheduler(group.id));
        }
        info!(groups = groups.groups.len(), "Statistics manager started");
    }

    /// Cancel background tasks and unregister every device
    pub fn shutdown(&self) -> usize {
        self.shutdown.cancel();
        self.running.store(false, Ordering::Release);

        let devices = self.devices();
        let count = devices
            .iter()
            .filter(|device| self.disconnected_node_unregistration(device))
            .count();
        info!(unregistered = count, "Statistics manager stopped");
        count
    }

    async fn commit_cycle(collector: &StatisticsCollector) -> Result<()> {
        if let Err(e) = collector.chain().submit_chain().await {
            warn!(device = %collector.device_id(), error = %e, "Failed to commit statistics");
            return Err(e);
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<Arc<StatisticsCollector>> {
        self.collectors.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    fn join_group(self: &Arc<Self>, device: &DeviceId) {
        let capacity = self.config.max_nodes_for_collector.max(1);
        let running = self.running.load(Ordering::Acquire);
        let mut groups = self.groups.lock();

        if groups.groups.iter().any(|g| g.members.contains(device)) {
            return;
        }

        if let Some(group) = groups.groups.iter_mut().find(|g| g.members.len() < capacity) {
            group.members.push(device.clone());
            return;
        }

        let id = groups.next_id;
        groups.next_id += 1;
        let scheduler = running.then(|| self.spawn_group_scheduler(id));
        groups.groups.push(NodeGroup {
            id,
            members: vec![device.clone()],
            scheduler,
        });
        debug!(group = id, "Created collector group");
    }

    fn leave_group(&self, device: &DeviceId) {
        let mut groups = self.groups.lock();
        let Some(index) = groups.groups.iter().position(|g| g.members.contains(device)) else {
            return;
        };

        let group = &mut groups.groups[index];
        group.members.retain(|member| member != device);
        if group.members.is_empty() {
            let group = groups.groups.remove(index);
            if let Some(scheduler) = group.scheduler {
                scheduler.cancel();
            }
            debug!(group = group.id, "Stopped empty collector group");
        }
    }

    fn group_members(&self, id: u64) -> Option<Vec<DeviceId>> {
        self.groups
            .lock()
            .groups
            .iter()
            .find(|g| g.id == id)
            .map(|g| g.members.clone())
    }

    async fn poll_group(&self, members: Vec<DeviceId>) {
        let timeout = self.config.request_timeout();

        for device in members {
            let Some(collector) = self.collector(&device) else {
                continue;
            };

            let expired = collector.expire_timed_out(std::time::Instant::now(), timeout);
            if expired.cycle_complete {
                let _ = Self::commit_cycle(&collector).await;
            }

            let transaction = self.next_transaction_id();
            match collector.collect_next_statistics(transaction).await {
                CollectOutcome::Started { requested, .. } => {
                    debug!(device = %device, transaction = %transaction, requested, "Poll cycle kicked")
                }
                outcome => debug!(device = %device, outcome = ?outcome, "Poll cycle not started"),
            }
        }
    }

    fn spawn_group_scheduler(self: &Arc<Self>, id: u64) -> CancellationToken {
        let token = self.shutdown.child_token();
        let cancelled = token.clone();
        let manager = Arc::downgrade(self);
        let period = self.config.min_request_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        let Some(members) = manager.group_members(id) else {
                            break;
                        };
                        manager.poll_group(members).await;
                    }
                }
            }
            debug!(group = id, "Collector group scheduler exited");
        });

        token
    }

    fn spawn_response_pump(self: &Arc<Self>, mut receiver: mpsc::Receiver<StatsResponse>) {
        let manager = Arc::downgrade(self);
        let cancelled = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let response = tokio::select! {
                    _ = cancelled.cancelled() => break,
                    response = receiver.recv() => response,
                };
                let Some(response) = response else {
                    break;
                };
                let Some(manager) = manager.upgrade() else {
                    break;
                };

                if let Err(e) = manager.on_response(response).await {
                    if e.is_benign() {
                        debug!(error = %e, "Response discarded");
                    } else {
                        warn!(error = %e, "Failed to process statistics response");
                    }
                }
            }
            debug!("Statistics response pump exited");
        });
    }
}

impl std::fmt::Debug for StatisticsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatisticsManager")
            .field("collectors", &self.collectors.len())
            .field("groups", &self.group_sizes())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}
