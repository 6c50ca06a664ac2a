//! Simulated switch fabric
//!
//! Stands in for the OpenFlow connection listener and device transport: it
//! connects a configurable number of switches, answers statistics requests
//! after a short delay (splitting larger replies into multipart responses)
//! and disconnects everything on stop.

use crate::lifecycle::{ConnectOutcome, LifecycleCoordinator};
use crate::provider::ConnectionProvider;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use statistics::{DeviceRpc, StatsRequest, StatsResponse};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use txchain::ConnectionContext;
use types::{Capability, CapabilitySet, DeviceId, PluginError, Result};

/// Entries per response part
const PART_SIZE: usize = 2;

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub switches: usize,
    pub duplicate_connections: bool,
    pub capabilities: Vec<Capability>,
    pub table_count: u8,
    pub response_delay: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            switches: 4,
            duplicate_connections: false,
            capabilities: Capability::ALL.to_vec(),
            table_count: 4,
            response_delay: Duration::from_millis(5),
        }
    }
}

/// One simulated switch session
pub struct SimulatedConnection {
    device: DeviceId,
    id: u64,
    closed: AtomicBool,
}

impl SimulatedConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl ConnectionContext for SimulatedConnection {
    fn device_id(&self) -> &DeviceId {
        &self.device
    }

    fn close_connection(&self, propagate: bool) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(device = %self.device, connection = self.id, propagate, "Simulated connection closed");
        }
    }
}

pub struct SwitchSimulator {
    config: SimulatorConfig,
    connections: Mutex<Vec<Arc<SimulatedConnection>>>,
    responses: Mutex<Option<mpsc::Sender<StatsResponse>>>,
    coordinator: Mutex<Weak<LifecycleCoordinator>>,
    next_connection: AtomicU64,
    requests_answered: AtomicU64,
}

impl SwitchSimulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            connections: Mutex::new(Vec::new()),
            responses: Mutex::new(None),
            coordinator: Mutex::new(Weak::new()),
            next_connection: AtomicU64::new(1),
            requests_answered: AtomicU64::new(0),
        }
    }

    pub fn device_id(index: usize) -> DeviceId {
        DeviceId::new(format!("openflow:{}", index + 1))
    }

    pub fn requests_answered(&self) -> u64 {
        self.requests_answered.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> Vec<Arc<SimulatedConnection>> {
        self.connections.lock().clone()
    }

    /// True while any session of `device` is open
    pub fn is_connected(&self, device: &DeviceId) -> bool {
        self.connections
            .lock()
            .iter()
            .any(|connection| &connection.device == device && !connection.is_closed())
    }

    fn open_connection(&self, device: DeviceId) -> Arc<SimulatedConnection> {
        let connection = Arc::new(SimulatedConnection {
            device,
            id: self.next_connection.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
        });
        self.connections.lock().push(Arc::clone(&connection));
        connection
    }

    fn reply_parts(request: &StatsRequest) -> Vec<StatsResponse> {
        let entries: Vec<_> = (0..Self::entry_count(request))
            .map(|n| {
                json!({
                    "capability": request.capability,
                    "index": n,
                    "transaction": request.transaction.0,
                })
            })
            .collect();

        let chunks: Vec<_> = entries.chunks(PART_SIZE).map(<[_]>::to_vec).collect();
        if chunks.is_empty() {
            return vec![StatsResponse::reply_to(request, Vec::new())];
        }

        let last = chunks.len() - 1;
        chunks
            .into_iter()
            .enumerate()
            .map(|(n, chunk)| StatsResponse::reply_to(request, chunk).with_more(n < last))
            .collect()
    }

    fn entry_count(request: &StatsRequest) -> usize {
        match request.capability {
            Capability::Table => request.table_count as usize,
            Capability::Flow => 5,
            _ => 1,
        }
    }
}

#[async_trait]
impl DeviceRpc for SwitchSimulator {
    async fn send_request(&self, request: StatsRequest) -> Result<()> {
        if !self.is_connected(&request.device) {
            return Err(PluginError::rpc(&request.device, "switch not connected"));
        }

        let sender = self
            .responses
            .lock()
            .clone()
            .ok_or_else(|| PluginError::rpc(&request.device, "simulator not started"))?;
        let delay = self.config.response_delay;
        let parts = Self::reply_parts(&request);
        self.requests_answered.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for part in parts {
                if sender.send(part).await.is_err() {
                    debug!("Response channel closed, dropping simulated reply");
                    break;
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl ConnectionProvider for SwitchSimulator {
    fn name(&self) -> &str {
        "switch-simulator"
    }

    async fn start(&self, coordinator: Arc<LifecycleCoordinator>) -> Result<()> {
        *self.responses.lock() = Some(coordinator.statistics().response_sender());
        *self.coordinator.lock() = Arc::downgrade(&coordinator);

        let capabilities = CapabilitySet::new(self.config.capabilities.iter().copied(), self.config.table_count);
        let attempts = if self.config.duplicate_connections { 2 } else { 1 };
        let mut active = 0;

        for index in 0..self.config.switches {
            let device = Self::device_id(index);
            for _ in 0..attempts {
                let context: Arc<dyn ConnectionContext> = self.open_connection(device.clone());

                match coordinator.device_connected(context, capabilities.clone()).await {
                    Ok(ConnectOutcome::Active { session }) => {
                        active += 1;
                        debug!(device = %device, session = %session, "Simulated switch connected");
                    }
                    Ok(ConnectOutcome::Waiting) => {
                        debug!(device = %device, "Simulated duplicate connection waiting")
                    }
                    Err(e) => warn!(device = %device, error = %e, "Simulated switch refused"),
                }
            }
        }

        info!(switches = self.config.switches, active, "Switch simulator started");
        Ok(())
    }

    async fn stop(&self) {
        let Some(coordinator) = self.coordinator.lock().upgrade() else {
            return;
        };

        let connections = self.connections();
        let mut disconnected = 0;
        for connection in connections.iter().filter(|c| !c.is_closed()) {
            let context: Arc<dyn ConnectionContext> = connection.clone();
            if coordinator.device_disconnected(&context).await {
                disconnected += 1;
            }
            connection.close_connection(false);
        }
        info!(disconnected, "Switch simulator stopped");
    }
}
