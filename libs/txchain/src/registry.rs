//! Transaction Chain Manager Registry
//!
//! Maps each device to its single chain manager and arbitrates between
//! near-simultaneous connections for the same device.
//!
//! `provide_or_wait` runs under a lock scoped to the device identity. The
//! final insert-or-drop decision takes the registry-wide map lock as a second,
//! nested critical section so only one writer can ever win, even if two
//! callers both observed "no manager yet".

use crate::connection::{ConnectionContext, ReadyForNewChainHandler};
use crate::datastore::DataBroker;
use crate::manager::TransactionChainManager;
use crate::metrics::{RegistryMetrics, RegistryStats};
use crate::registration::Registration;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tracing::{debug, info};
use types::{ChainStatus, DeviceId, SessionToken};

/// Outcome of [`ChainManagerRegistry::provide_or_wait`]
#[derive(Debug, Clone)]
pub enum ChainProvision {
    /// A fresh manager was created; the caller is its sole active connection
    Ready(Arc<TransactionChainManager>),
    /// The caller is the registered successor and will be notified when the
    /// current manager closes
    Waiting,
    /// The connection conflicted with an existing manager and was closed
    Dropped { existing: ChainStatus },
}

impl ChainProvision {
    pub fn manager(&self) -> Option<&Arc<TransactionChainManager>> {
        match self {
            ChainProvision::Ready(manager) => Some(manager),
            _ => None,
        }
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self, ChainProvision::Dropped { .. })
    }
}

struct RegistryInner {
    broker: Arc<dyn DataBroker>,
    identity_locks: DashMap<DeviceId, Arc<Mutex<()>>>,
    managers: Mutex<HashMap<DeviceId, Arc<TransactionChainManager>>>,
    metrics: RegistryMetrics,
}

impl RegistryInner {
    fn identity_lock(&self, device: &DeviceId) -> Arc<Mutex<()>> {
        self.identity_locks
            .entry(device.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Removal callback target: only removes the association if it still
    /// points at the manager created under `session`
    fn remove_if_current(&self, device: &DeviceId, session: SessionToken) {
        let removed = {
            let mut managers = self.managers.lock();
            match managers.get(device) {
                Some(current) if current.session_token() == session => managers.remove(device).is_some(),
                _ => false,
            }
        };

        if removed {
            self.metrics.managers_removed.fetch_add(1, Ordering::Relaxed);
            // nobody else holds a clone while the shard lock is taken
            self.identity_locks
                .remove_if(device, |_, lock| Arc::strong_count(lock) == 1);
            debug!(device = %device, session = %session, "Chain manager removed from registry");
        } else {
            debug!(device = %device, session = %session, "Registry already superseded this chain manager");
        }
    }
}

/// Registry of per-device transaction chain managers.
///
/// Constructed once by the top-level service and shared by reference.
#[derive(Clone)]
pub struct ChainManagerRegistry {
    inner: Arc<RegistryInner>,
}

impl ChainManagerRegistry {
    pub fn new(broker: Arc<dyn DataBroker>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                broker,
                identity_locks: DashMap::new(),
                managers: Mutex::new(HashMap::new()),
                metrics: RegistryMetrics::default(),
            }),
        }
    }

    /// Hand out the device's chain manager, park the connection as successor,
    /// or drop it as a conflict.
    pub fn provide_or_wait(
        &self,
        connection: &Arc<dyn ConnectionContext>,
        handler: Arc<dyn ReadyForNewChainHandler>,
    ) -> ChainProvision {
        let device = connection.device_id().clone();
        let identity_lock = self.inner.identity_lock(&device);
        let _identity = identity_lock.lock();

        let existing = self.inner.managers.lock().get(&device).cloned();

        match existing {
            None => {
                let manager = Arc::new(self.create_manager(&device));

                let mut managers = self.inner.managers.lock();
                match managers.entry(device.clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert(Arc::clone(&manager));
                        drop(managers);
                        self.inner.metrics.managers_created.fetch_add(1, Ordering::Relaxed);
                        ChainProvision::Ready(manager)
                    }
                    Entry::Occupied(winner) => {
                        // another writer got in first - drop this one
                        let existing = winner.get().status();
                        drop(managers);
                        manager.abandon();
                        self.drop_connection(connection, &device, existing);
                        ChainProvision::Dropped { existing }
                    }
                }
            }
            Some(manager) => {
                if manager.attempt_to_register_handler(handler) {
                    self.inner.metrics.connections_waiting.fetch_add(1, Ordering::Relaxed);
                    info!(
                        device = %device,
                        current_session = %manager.session_token(),
                        "Connection waiting for current transaction chain to close"
                    );
                    ChainProvision::Waiting
                } else {
                    let existing = manager.status();
                    self.drop_connection(connection, &device, existing);
                    ChainProvision::Dropped { existing }
                }
            }
        }
    }

    fn create_manager(&self, device: &DeviceId) -> TransactionChainManager {
        // session is only known after construction, so the callback reads it back
        let session_slot: Arc<Mutex<Option<SessionToken>>> = Arc::new(Mutex::new(None));
        let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let callback_device = device.clone();
        let callback_session = Arc::clone(&session_slot);

        let registration = Registration::new(move || {
            let session = *callback_session.lock();
            if let (Some(registry), Some(session)) = (registry.upgrade(), session) {
                registry.remove_if_current(&callback_device, session);
            }
        });

        let manager = TransactionChainManager::new(device.clone(), self.inner.broker.as_ref(), registration);
        *session_slot.lock() = Some(manager.session_token());
        manager
    }

    fn drop_connection(&self, connection: &Arc<dyn ConnectionContext>, device: &DeviceId, existing: ChainStatus) {
        self.inner.metrics.connections_dropped.fetch_add(1, Ordering::Relaxed);
        info!(
            device = %device,
            existing_status = %existing,
            "There already exists one handler for this device, dropping new connection"
        );
        connection.close_connection(false);
    }

    pub fn get(&self, device: &DeviceId) -> Option<Arc<TransactionChainManager>> {
        self.inner.managers.lock().get(device).cloned()
    }

    pub fn contains(&self, device: &DeviceId) -> bool {
        self.inner.managers.lock().contains_key(device)
    }

    pub fn len(&self) -> usize {
        self.inner.managers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        self.inner.managers.lock().keys().cloned().collect()
    }

    pub fn metrics(&self) -> RegistryStats {
        self.inner.metrics.get_stats()
    }

    /// Close every registered manager (shutdown path)
    pub async fn close_all(&self) {
        let managers: Vec<_> = self.inner.managers.lock().values().cloned().collect();
        for manager in managers {
            manager.close().await;
        }
    }
}
