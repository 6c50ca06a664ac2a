//! Shared fixtures for the scenario suites

use async_trait::async_trait;
use ofplugin::{ConnectOutcome, LifecycleCoordinator};
use parking_lot::Mutex;
use plugin_config::PluginConfig;
use statistics::{DeviceRpc, StatisticsManager, StatsRequest, StatsResponse};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};
use txchain::{ChainManagerRegistry, ConnectionContext, MemoryDataBroker, Mutation};
use types::{Capability, CapabilitySet, DeviceId, Result};

static LOGGING: Once = Once::new();

/// Install a test-writer subscriber once per test binary (`RUST_LOG` applies)
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub struct TestConnection {
    device: DeviceId,
    closed: AtomicBool,
}

impl TestConnection {
    pub fn new(device: &str) -> Arc<Self> {
        Arc::new(Self {
            device: DeviceId::new(device),
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn context(self: &Arc<Self>) -> Arc<dyn ConnectionContext> {
        self.clone()
    }
}

impl ConnectionContext for TestConnection {
    fn device_id(&self) -> &DeviceId {
        &self.device
    }

    fn close_connection(&self, _propagate: bool) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Records requests; responses are injected by the test
#[derive(Default)]
pub struct ScriptedRpc {
    sent: Mutex<Vec<StatsRequest>>,
}

impl ScriptedRpc {
    pub fn sent(&self) -> Vec<StatsRequest> {
        self.sent.lock().clone()
    }

    pub fn sent_for(&self, device: &DeviceId) -> Vec<StatsRequest> {
        self.sent().into_iter().filter(|r| &r.device == device).collect()
    }

    /// Latest request for `capability` on `device`
    pub fn request_for(&self, device: &DeviceId, capability: Capability) -> Option<StatsRequest> {
        self.sent_for(device).into_iter().rev().find(|r| r.capability == capability)
    }
}

#[async_trait]
impl DeviceRpc for ScriptedRpc {
    async fn send_request(&self, request: StatsRequest) -> Result<()> {
        self.sent.lock().push(request);
        Ok(())
    }
}

/// Real components over the in-memory datastore, without background
/// schedulers so every cycle is driven explicitly
pub struct Harness {
    pub broker: MemoryDataBroker,
    pub rpc: Arc<ScriptedRpc>,
    pub coordinator: Arc<LifecycleCoordinator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(PluginConfig::default())
    }

    pub fn with_config(config: PluginConfig) -> Self {
        init_test_logging();
        let broker = MemoryDataBroker::new();
        let rpc = Arc::new(ScriptedRpc::default());
        let registry = ChainManagerRegistry::new(Arc::new(broker.clone()));
        let statistics = Arc::new(
            StatisticsManager::new(&config, rpc.clone()).unwrap_or_else(|e| panic!("invalid test config: {}", e)),
        );
        let coordinator = LifecycleCoordinator::new(config, registry, statistics);

        Self {
            broker,
            rpc,
            coordinator,
        }
    }

    pub fn statistics(&self) -> &Arc<StatisticsManager> {
        self.coordinator.statistics()
    }

    pub fn registry(&self) -> &ChainManagerRegistry {
        self.coordinator.registry()
    }

    pub async fn connect(
        &self,
        device: &str,
        capabilities: CapabilitySet,
    ) -> (Arc<TestConnection>, Result<ConnectOutcome>) {
        let connection = TestConnection::new(device);
        let outcome = self
            .coordinator
            .device_connected(connection.context(), capabilities)
            .await;
        (connection, outcome)
    }

    pub async fn respond(&self, request: &StatsRequest, body: Vec<serde_json::Value>) -> Result<statistics::ResponseOutcome> {
        self.statistics()
            .on_response(StatsResponse::reply_to(request, body))
            .await
    }

    /// Paths written by `Put` mutations for `device`, in commit order
    pub fn committed_puts(&self, device: &DeviceId) -> Vec<String> {
        self.broker
            .journal_for(device)
            .into_iter()
            .filter_map(|entry| match entry.mutation {
                Mutation::Put { path, .. } => Some(path),
                _ => None,
            })
            .collect()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
