//! Poll cycle scenarios: ordering, single cycle per device, quota ceiling and
//! disconnects in the middle of a cycle.

use e2e_tests::Harness;
use ofplugin::ConnectOutcome;
use plugin_config::PluginConfig;
use proptest::prelude::*;
use serde_json::json;
use statistics::{CollectOutcome, ResponseOutcome};
use std::sync::Arc;
use txchain::{ChainManagerRegistry, MemoryDataBroker, Mutation, StatOperation, TransactionChainManager};
use types::{Capability, CapabilitySet, CollectorState, DeviceId, PluginError, TransactionId};

#[tokio::test]
async fn poll_cycle_commits_flow_then_port() {
    let harness = Harness::new();
    let device = DeviceId::new("openflow:D1");

    let (_connection, outcome) = harness
        .connect("openflow:D1", CapabilitySet::new([Capability::Port, Capability::Flow], 4))
        .await;
    assert!(matches!(outcome, Ok(ConnectOutcome::Active { .. })));

    let collector = harness.statistics().collector(&device).unwrap();
    assert_eq!(collector.state(), CollectorState::Idle);

    let outcome = harness
        .statistics()
        .collect_next_statistics(&device, TransactionId(1))
        .await
        .unwrap();
    assert!(matches!(outcome, CollectOutcome::Started { requested: 2, .. }));
    assert_eq!(collector.state(), CollectorState::Collecting);

    let sent: Vec<_> = harness.rpc.sent_for(&device).iter().map(|r| r.capability).collect();
    assert_eq!(sent, vec![Capability::Flow, Capability::Port]);
    assert!(harness.rpc.sent_for(&device).iter().all(|r| r.table_count == 4));

    // port answers first; commit order still follows poll order
    let port = harness.rpc.request_for(&device, Capability::Port).unwrap();
    let flow = harness.rpc.request_for(&device, Capability::Flow).unwrap();
    assert_eq!(
        harness.respond(&port, vec![json!({"port": 1})]).await.unwrap(),
        ResponseOutcome::Accepted
    );
    assert_eq!(
        harness.respond(&flow, vec![json!({"flow": 1})]).await.unwrap(),
        ResponseOutcome::CycleComplete { committed: 2 }
    );
    assert_eq!(collector.state(), CollectorState::Idle);

    assert_eq!(
        harness.committed_puts(&device),
        vec![
            "nodes/openflow:D1/flow-statistics".to_string(),
            "nodes/openflow:D1/port-statistics".to_string(),
        ]
    );
}

#[tokio::test]
async fn collect_while_collecting_is_a_no_op() {
    let harness = Harness::new();
    let device = DeviceId::new("openflow:busy");
    harness
        .connect("openflow:busy", CapabilitySet::new(Capability::ALL, 2))
        .await
        .1
        .unwrap();

    harness
        .statistics()
        .collect_next_statistics(&device, TransactionId(1))
        .await
        .unwrap();
    let sent = harness.rpc.sent().len();

    for xid in 2..6 {
        let outcome = harness
            .statistics()
            .collect_next_statistics(&device, TransactionId(xid))
            .await
            .unwrap();
        assert_eq!(outcome, CollectOutcome::Busy);
    }
    assert_eq!(harness.rpc.sent().len(), sent);
    assert_eq!(harness.statistics().metrics().cycles_started, 1);
}

#[tokio::test]
async fn disconnect_mid_cycle_discards_late_port_response() {
    let harness = Harness::new();
    let device = DeviceId::new("openflow:D1");

    let (connection, _) = harness
        .connect("openflow:D1", CapabilitySet::new([Capability::Flow, Capability::Port], 4))
        .await;
    let collector = harness.statistics().collector(&device).unwrap();
    let chain = harness.coordinator.chain_for(&device).unwrap();

    harness
        .statistics()
        .collect_next_statistics(&device, TransactionId(1))
        .await
        .unwrap();
    let flow = harness.rpc.request_for(&device, Capability::Flow).unwrap();
    let port = harness.rpc.request_for(&device, Capability::Port).unwrap();

    harness.respond(&flow, vec![json!({"flow": 1})]).await.unwrap();
    assert_eq!(harness.statistics().quota_stats().outstanding, 1);

    assert!(harness.coordinator.device_disconnected(&connection.context()).await);
    assert_eq!(collector.state(), CollectorState::Disconnected);
    assert_eq!(harness.statistics().quota_stats().outstanding, 0);

    let late = harness.respond(&port, vec![json!({"port": 1})]).await;
    assert!(matches!(late, Err(PluginError::StaleResponse { .. })));
    // the collector itself discards it too
    let late = collector.on_response(statistics::StatsResponse::reply_to(&port, vec![]));
    assert!(late.is_err());

    let puts = harness.committed_puts(&device);
    assert!(puts.contains(&"nodes/openflow:D1/flow-statistics".to_string()));
    assert!(!puts.iter().any(|path| path.ends_with("port-statistics")));
    assert_eq!(chain.pending_len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn global_quota_bounds_outstanding_requests() {
    let mut config = PluginConfig::default();
    config.rpc_requests_quota = 5;
    let harness = Arc::new(Harness::with_config(config));

    let devices: Vec<DeviceId> = (0..8).map(|n| DeviceId::new(format!("openflow:q{}", n))).collect();
    for device in &devices {
        harness
            .connect(device.as_str(), CapabilitySet::new(Capability::ALL, 1))
            .await
            .1
            .unwrap();
    }

    let tasks: Vec<_> = devices
        .iter()
        .cloned()
        .map(|device| {
            let harness = Arc::clone(&harness);
            tokio::spawn(async move {
                let xid = harness.statistics().next_transaction_id();
                harness.statistics().collect_next_statistics(&device, xid).await.unwrap()
            })
        })
        .collect();

    let mut requested = 0;
    let mut skipped = 0;
    for task in tasks {
        if let CollectOutcome::Started {
            requested: r,
            skipped: s,
            ..
        } = task.await.unwrap()
        {
            requested += r;
            skipped += s.len();
        }
    }

    assert_eq!(requested, 5);
    assert_eq!(requested + skipped, 8 * 6);
    assert_eq!(harness.rpc.sent().len(), 5);
    assert!(harness.statistics().quota_stats().outstanding <= 5);

    // answering frees the quota for the next round
    for request in harness.rpc.sent() {
        harness.respond(&request, vec![]).await.unwrap();
    }
    assert_eq!(harness.statistics().quota_stats().outstanding, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn operations_from_different_threads_commit_in_enqueue_order() {
    let broker = MemoryDataBroker::new();
    let manager = Arc::new(TransactionChainManager::new(
        DeviceId::new("openflow:order"),
        &broker,
        txchain::Registration::noop(),
    ));

    for (n, capability) in [Capability::Queue, Capability::Flow, Capability::Meter].into_iter().enumerate() {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager.enqueue(StatOperation::DataCommit {
                device: DeviceId::new("openflow:order"),
                capability,
                transaction: TransactionId(n as u64),
                entries: vec![],
            })
        })
        .await
        .unwrap()
        .unwrap();
    }

    manager.submit_chain().await.unwrap();
    let order: Vec<String> = broker
        .journal()
        .into_iter()
        .filter_map(|entry| match entry.mutation {
            Mutation::Put { path, .. } => Some(path),
            _ => None,
        })
        .collect();
    assert_eq!(
        order,
        vec![
            "nodes/openflow:order/queue-statistics".to_string(),
            "nodes/openflow:order/flow-statistics".to_string(),
            "nodes/openflow:order/meter-statistics".to_string(),
        ]
    );
}

fn capability() -> impl Strategy<Value = Capability> {
    prop::sample::select(Capability::ALL.to_vec())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_registry_manager_commits_in_enqueue_order(
        kinds in prop::collection::vec(capability(), 1..24),
        split in 0usize..24,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let broker = MemoryDataBroker::new();
            let registry = ChainManagerRegistry::new(Arc::new(broker.clone()));
            let connection = e2e_tests::TestConnection::new("openflow:prop");
            let handler: Arc<dyn txchain::ReadyForNewChainHandler> = Arc::new(NoopHandler);
            let manager = registry
                .provide_or_wait(&connection.context(), handler)
                .manager()
                .cloned()
                .unwrap();

            let device = DeviceId::new("openflow:prop");
            for (n, capability) in kinds.iter().enumerate() {
                manager
                    .enqueue(StatOperation::DataCommit {
                        device: device.clone(),
                        capability: *capability,
                        transaction: TransactionId(n as u64),
                        entries: vec![],
                    })
                    .unwrap();
                if n == split {
                    manager.submit_chain().await.unwrap();
                }
            }
            manager.close().await;

            let transactions: Vec<u64> = broker
                .journal()
                .into_iter()
                .filter_map(|entry| match entry.mutation {
                    Mutation::Put { value, .. } => value["transaction"].as_u64(),
                    _ => None,
                })
                .collect();
            let expected: Vec<u64> = (0..kinds.len() as u64).collect();
            assert_eq!(transactions, expected);
            assert!(registry.is_empty());
        });
    }
}

struct NoopHandler;

impl txchain::ReadyForNewChainHandler for NoopHandler {
    fn on_ready_for_new_chain(&self) {}
}
