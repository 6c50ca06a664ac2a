//! Device Lifecycle Coordinator
//!
//! Sequences every connection through
//!
//! ```text
//! device_connected ─▶ chain manager ready ─▶ capabilities registered ─▶ collection active
//!        │                    │
//!        │                    ├─ waiting: parked as successor, promoted when the
//!        │                    │           current manager closes
//!        │                    └─ dropped: transport closed, nothing created
//!        └─ mandatory features missing: transport closed, nothing created
//!
//! device_disconnected ─▶ statistics unregistered ─▶ chain manager closed
//! ```

use dashmap::DashMap;
use plugin_config::PluginConfig;
use serde::{Deserialize, Serialize};
use statistics::StatisticsManager;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use txchain::{
    ChainManagerRegistry, ChainProvision, ConnectionContext, ReadyForNewChainHandler, Registration,
    TransactionChainManager,
};
use types::{CapabilitySet, ChainStatus, DeviceId, PluginError, Result, SessionToken};

/// Where a successfully handled connection ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Owns the device's chain manager; statistics collection is active
    Active { session: SessionToken },
    /// Parked behind the current owner
    Waiting,
}

#[derive(Debug, Default)]
pub struct LifecycleMetrics {
    pub connected: AtomicU64,
    pub waiting: AtomicU64,
    pub promoted: AtomicU64,
    pub conflicts: AtomicU64,
    pub features_missing: AtomicU64,
    pub disconnected: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleStats {
    pub connected: u64,
    pub waiting: u64,
    pub promoted: u64,
    pub conflicts: u64,
    pub features_missing: u64,
    pub disconnected: u64,
}

impl LifecycleMetrics {
    pub fn get_stats(&self) -> LifecycleStats {
        LifecycleStats {
            connected: self.connected.load(Ordering::Relaxed),
            waiting: self.waiting.load(Ordering::Relaxed),
            promoted: self.promoted.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            features_missing: self.features_missing.load(Ordering::Relaxed),
            disconnected: self.disconnected.load(Ordering::Relaxed),
        }
    }
}

struct ActiveDevice {
    connection: Arc<dyn ConnectionContext>,
    chain: Arc<TransactionChainManager>,
    statistics: Registration,
}

struct WaitingDevice {
    connection: Arc<dyn ConnectionContext>,
    capabilities: CapabilitySet,
    /// Registered on the current owner's chain manager
    handler: Arc<dyn ReadyForNewChainHandler>,
}

fn same_connection(a: &Arc<dyn ConnectionContext>, b: &Arc<dyn ConnectionContext>) -> bool {
    Arc::ptr_eq(a, b)
}

pub struct LifecycleCoordinator {
    config: PluginConfig,
    registry: ChainManagerRegistry,
    statistics: Arc<StatisticsManager>,
    active: DashMap<DeviceId, ActiveDevice>,
    waiting: DashMap<DeviceId, WaitingDevice>,
    metrics: LifecycleMetrics,
    shutting_down: AtomicBool,
    this: Weak<LifecycleCoordinator>,
}

impl std::fmt::Debug for LifecycleCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleCoordinator").finish_non_exhaustive()
    }
}

impl LifecycleCoordinator {
    pub fn new(config: PluginConfig, registry: ChainManagerRegistry, statistics: Arc<StatisticsManager>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            registry,
            statistics,
            active: DashMap::new(),
            waiting: DashMap::new(),
            metrics: LifecycleMetrics::default(),
            shutting_down: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// Run a new connection through the connect sequence.
    ///
    /// A conflicting or under-featured connection has its transport closed
    /// and is reported as an error; no chain manager or collector is kept for
    /// it.
    pub async fn device_connected(
        &self,
        connection: Arc<dyn ConnectionContext>,
        capabilities: CapabilitySet,
    ) -> Result<ConnectOutcome> {
        let device = connection.device_id().clone();

        if self.config.switch_features_mandatory {
            let missing = capabilities.missing_mandatory();
            if !missing.is_empty() {
                self.metrics.features_missing.fetch_add(1, Ordering::Relaxed);
                warn!(device = %device, missing = ?missing, "Switch lacks mandatory features, refusing connection");
                connection.close_connection(false);
                return Err(PluginError::FeaturesMissing { device, missing });
            }
        }

        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                debug!(device = %device, "Refusing connection during shutdown");
                connection.close_connection(false);
                return Err(PluginError::rejected(&device, ChainStatus::Closed));
            }

            let successor = Arc::new(SuccessorHandler {
                coordinator: self.this.clone(),
                device: device.clone(),
                connection: Arc::downgrade(&connection),
                fired: AtomicBool::new(false),
            });
            let handler: Arc<dyn ReadyForNewChainHandler> = successor.clone();

            match self.registry.provide_or_wait(&connection, Arc::clone(&handler)) {
                ChainProvision::Ready(chain) => return self.activate(connection, chain, capabilities).await,
                ChainProvision::Waiting => {
                    let displaced = self.waiting.insert(
                        device.clone(),
                        WaitingDevice {
                            connection: Arc::clone(&connection),
                            capabilities: capabilities.clone(),
                            handler,
                        },
                    );
                    if let Some(displaced) = displaced {
                        // its chain manager is gone, nothing would ever promote it
                        info!(device = %device, "Closing waiting connection superseded by a newer successor");
                        self.metrics.conflicts.fetch_add(1, Ordering::Relaxed);
                        displaced.connection.close_connection(false);
                    }

                    if !successor.fired.load(Ordering::SeqCst) {
                        self.metrics.waiting.fetch_add(1, Ordering::Relaxed);
                        return Ok(ConnectOutcome::Waiting);
                    }

                    // owner closed before the connection was parked
                    if self
                        .waiting
                        .remove_if(&device, |_, waiting| same_connection(&waiting.connection, &connection))
                        .is_none()
                    {
                        // the promotion task already took it over
                        return Ok(ConnectOutcome::Waiting);
                    }
                    debug!(device = %device, "Chain manager closed while parking, retrying");
                }
                ChainProvision::Dropped { existing } => {
                    self.metrics.conflicts.fetch_add(1, Ordering::Relaxed);
                    return Err(PluginError::conflict(&device, existing));
                }
            }
        }
    }

    async fn activate(
        &self,
        connection: Arc<dyn ConnectionContext>,
        chain: Arc<TransactionChainManager>,
        capabilities: CapabilitySet,
    ) -> Result<ConnectOutcome> {
        let device = chain.device_id().clone();
        let session = chain.session_token();

        chain.start_periodic_submit(self.config.chain.submit_interval());
        debug!(device = %device, session = %session, "Chain manager ready");

        if capabilities.is_empty() {
            info!(device = %device, "No statistics capabilities declared, collecting with an empty set");
        }

        let statistics = match self.statistics.connected_node_registration(Arc::clone(&chain), capabilities) {
            Ok(registration) => registration,
            Err(e) => {
                warn!(device = %device, error = %e, "Statistics registration failed, closing chain");
                chain.close().await;
                connection.close_connection(false);
                return Err(e);
            }
        };

        self.active.insert(
            device.clone(),
            ActiveDevice {
                connection,
                chain,
                statistics,
            },
        );
        self.metrics.connected.fetch_add(1, Ordering::Relaxed);
        info!(device = %device, session = %session, "Device collection active");

        Ok(ConnectOutcome::Active { session })
    }

    /// Tear down whatever `connection` owns: statistics first, then the chain
    /// manager (which promotes a waiting successor). Returns false if the
    /// connection owned nothing.
    pub async fn device_disconnected(&self, connection: &Arc<dyn ConnectionContext>) -> bool {
        let device = connection.device_id().clone();

        if let Some((_, waiting)) = self
            .waiting
            .remove_if(&device, |_, waiting| same_connection(&waiting.connection, connection))
        {
            // free the successor slot so a later connection can wait in its place
            if let Some(chain) = self.registry.get(&device) {
                chain.unregister_handler(&waiting.handler);
            }
            info!(device = %device, "Waiting connection went away before promotion");
            return true;
        }

        let Some((_, active)) = self
            .active
            .remove_if(&device, |_, active| same_connection(&active.connection, connection))
        else {
            debug!(device = %device, "Disconnect for a connection that owns nothing");
            return false;
        };

        active.statistics.close();
        active.chain.close().await;
        self.metrics.disconnected.fetch_add(1, Ordering::Relaxed);
        info!(device = %device, session = %active.chain.session_token(), "Device disconnected");
        true
    }

    async fn promote(&self, device: DeviceId, connection: Weak<dyn ConnectionContext>) {
        let Some((_, waiting)) = self
            .waiting
            .remove_if(&device, |_, waiting| Weak::ptr_eq(&Arc::downgrade(&waiting.connection), &connection))
        else {
            debug!(device = %device, "No waiting connection to promote");
            return;
        };

        info!(device = %device, "Promoting waiting connection");
        match self.device_connected(waiting.connection, waiting.capabilities).await {
            Ok(ConnectOutcome::Active { session }) => {
                self.metrics.promoted.fetch_add(1, Ordering::Relaxed);
                debug!(device = %device, session = %session, "Waiting connection promoted");
            }
            Ok(ConnectOutcome::Waiting) => debug!(device = %device, "Promoted connection is waiting again"),
            Err(e) => warn!(device = %device, error = %e, "Promotion failed"),
        }
    }

    /// Refuse new connections and promotions from now on
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Disconnect every device; waiting connections are closed outright
    pub async fn close_all(&self) -> usize {
        self.begin_shutdown();

        let waiting: Vec<DeviceId> = self.waiting.iter().map(|entry| entry.key().clone()).collect();
        for device in waiting {
            if let Some((_, waiting)) = self.waiting.remove(&device) {
                waiting.connection.close_connection(false);
            }
        }

        let connections: Vec<Arc<dyn ConnectionContext>> = self
            .active
            .iter()
            .map(|entry| Arc::clone(&entry.value().connection))
            .collect();

        let mut closed = 0;
        for connection in connections {
            if self.device_disconnected(&connection).await {
                connection.close_connection(false);
                closed += 1;
            }
        }
        closed
    }

    pub fn is_active(&self, device: &DeviceId) -> bool {
        self.active.contains_key(device)
    }

    pub fn is_waiting(&self, device: &DeviceId) -> bool {
        self.waiting.contains_key(device)
    }

    pub fn active_devices(&self) -> Vec<DeviceId> {
        self.active.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn chain_for(&self, device: &DeviceId) -> Option<Arc<TransactionChainManager>> {
        self.active.get(device).map(|entry| Arc::clone(&entry.value().chain))
    }

    pub fn registry(&self) -> &ChainManagerRegistry {
        &self.registry
    }

    pub fn statistics(&self) -> &Arc<StatisticsManager> {
        &self.statistics
    }

    pub fn metrics(&self) -> LifecycleStats {
        self.metrics.get_stats()
    }
}

/// Registered on the current chain manager for a waiting connection
struct SuccessorHandler {
    coordinator: Weak<LifecycleCoordinator>,
    device: DeviceId,
    connection: Weak<dyn ConnectionContext>,
    fired: AtomicBool,
}

impl ReadyForNewChainHandler for SuccessorHandler {
    fn on_ready_for_new_chain(&self) {
        self.fired.store(true, Ordering::SeqCst);
        let Some(coordinator) = self.coordinator.upgrade() else {
            return;
        };
        let device = self.device.clone();
        let connection = self.connection.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { coordinator.promote(device, connection).await });
            }
            Err(_) => warn!(device = %device, "No runtime to promote waiting connection on"),
        }
    }
}
