//! Full pipeline against the switch simulator: provider bootstrap, scheduled
//! collection through the response channel, and orderly shutdown.

use e2e_tests::{init_test_logging, wait_until};
use ofplugin::{PluginProvider, SimulatorConfig, SwitchSimulator};
use plugin_config::PluginConfig;
use std::sync::Arc;
use std::time::Duration;
use txchain::{ConnectionContext, MemoryDataBroker};
use types::{Capability, DeviceId};

fn fast_config() -> PluginConfig {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plugin.toml");
    std::fs::write(
        &path,
        r#"
rpc_requests_quota = 64
global_notification_quota = 256

[statistics]
min_request_interval_ms = 20
max_nodes_for_collector = 2
request_timeout_ms = 500

[chain]
submit_interval_ms = 20
"#,
    )
    .unwrap();
    PluginConfig::load(Some(&path)).unwrap()
}

fn simulator(switches: usize, duplicate_connections: bool) -> Arc<SwitchSimulator> {
    Arc::new(SwitchSimulator::new(SimulatorConfig {
        switches,
        duplicate_connections,
        response_delay: Duration::from_millis(1),
        ..Default::default()
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simulated_switches_reach_the_datastore() {
    init_test_logging();
    let broker = MemoryDataBroker::new();
    let simulator = simulator(3, false);

    let provider = PluginProvider::builder()
        .config(fast_config())
        .data_broker(Arc::new(broker.clone()))
        .device_rpc(simulator.clone())
        .connection_provider(simulator.clone())
        .build();
    let coordinator = provider.initialize().await.unwrap();

    assert_eq!(coordinator.active_devices().len(), 3);
    assert_eq!(coordinator.statistics().group_sizes(), vec![2, 1]);

    let devices: Vec<DeviceId> = (0..3).map(SwitchSimulator::device_id).collect();
    let collected = wait_until(Duration::from_secs(5), || {
        devices.iter().all(|device| {
            Capability::ALL
                .iter()
                .all(|capability| broker.read(&capability.data_path(&device.node_path())).is_some())
        })
    })
    .await;
    assert!(collected, "every capability of every switch is committed");

    // flow replies are multipart; the committed record holds all parts
    let flow = broker
        .read(&Capability::Flow.data_path(&devices[0].node_path()))
        .unwrap();
    assert_eq!(flow["entries"].as_array().unwrap().len(), 5);

    provider.close().await;

    assert!(coordinator.registry().is_empty());
    assert!(coordinator.statistics().is_empty());
    assert!(devices.iter().all(|device| broker.read(&device.node_path()).is_none()));
    assert!(simulator.connections().iter().all(|c| c.is_closed()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_connections_wait_and_take_over() {
    init_test_logging();
    let broker = MemoryDataBroker::new();
    let simulator = simulator(2, true);

    let provider = PluginProvider::builder()
        .config(fast_config())
        .data_broker(Arc::new(broker.clone()))
        .device_rpc(simulator.clone())
        .connection_provider(simulator.clone())
        .build();
    let coordinator = provider.initialize().await.unwrap();

    assert_eq!(coordinator.metrics().connected, 2);
    assert_eq!(coordinator.metrics().waiting, 2);
    assert_eq!(coordinator.registry().metrics().managers_created, 2);

    // drop the first connection of switch 1; its waiting twin takes over
    let device = SwitchSimulator::device_id(0);
    let first = simulator
        .connections()
        .into_iter()
        .find(|c| c.device_id() == &device)
        .unwrap();
    let first: Arc<dyn ConnectionContext> = first;
    let old_session = coordinator.statistics().generated_uuid_for_node(&device).unwrap();
    assert!(coordinator.device_disconnected(&first).await);
    first.close_connection(false);

    let promoted = wait_until(Duration::from_secs(2), || {
        coordinator
            .statistics()
            .generated_uuid_for_node(&device)
            .is_some_and(|session| session.supersedes(&old_session))
    })
    .await;
    assert!(promoted);
    assert_eq!(coordinator.metrics().promoted, 1);

    provider.close().await;
    assert!(coordinator.registry().is_empty());
}

#[tokio::test]
async fn mandatory_features_refuse_limited_switches() {
    init_test_logging();
    let mut config = PluginConfig::default();
    config.switch_features_mandatory = true;

    let simulator = Arc::new(SwitchSimulator::new(SimulatorConfig {
        switches: 2,
        capabilities: vec![Capability::Flow, Capability::Port],
        ..Default::default()
    }));
    let provider = PluginProvider::builder()
        .config(config)
        .data_broker(Arc::new(MemoryDataBroker::new()))
        .device_rpc(simulator.clone())
        .connection_provider(simulator.clone())
        .build();

    let coordinator = provider.initialize().await.unwrap();
    assert!(coordinator.active_devices().is_empty());
    assert_eq!(coordinator.metrics().features_missing, 2);
    assert!(simulator.connections().iter().all(|c| c.is_closed()));

    provider.close().await;
}
