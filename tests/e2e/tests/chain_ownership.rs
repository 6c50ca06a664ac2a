//! Chain ownership scenarios: one WORKING manager per device, conflict
//! handling and successor promotion.

use e2e_tests::{wait_until, Harness, TestConnection};
use ofplugin::ConnectOutcome;
use statistics::StatsResponse;
use std::sync::Arc;
use std::time::Duration;
use types::{Capability, CapabilitySet, ChainStatus, DeviceId, PluginError};

fn caps() -> CapabilitySet {
    CapabilitySet::new([Capability::Flow, Capability::Port], 4)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_connects_yield_exactly_one_owner() {
    let harness = Arc::new(Harness::new());
    let device = DeviceId::new("openflow:race");

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let harness = Arc::clone(&harness);
            tokio::spawn(async move { harness.connect("openflow:race", caps()).await })
        })
        .collect();

    let mut active = 0;
    let mut waiting = 0;
    let mut dropped = Vec::new();
    for task in tasks {
        let (connection, outcome) = task.await.unwrap();
        match outcome {
            Ok(ConnectOutcome::Active { .. }) => active += 1,
            Ok(ConnectOutcome::Waiting) => waiting += 1,
            Err(PluginError::Conflict { .. }) => dropped.push(connection),
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }

    assert_eq!(active, 1);
    assert_eq!(waiting, 1);
    assert_eq!(dropped.len(), 14);
    assert!(dropped.iter().all(|connection| connection.is_closed()));

    // nothing leaked for the dropped connections
    assert_eq!(harness.registry().len(), 1);
    assert_eq!(harness.registry().metrics().managers_created, 1);
    assert_eq!(harness.statistics().len(), 1);
    assert_eq!(harness.registry().get(&device).unwrap().status(), ChainStatus::Working);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconnect_storm_never_has_two_working_managers() {
    let harness = Arc::new(Harness::new());
    let device = DeviceId::new("openflow:storm");

    for _ in 0..10 {
        let (first, outcome) = harness.connect("openflow:storm", caps()).await;
        assert!(matches!(outcome, Ok(ConnectOutcome::Active { .. })));
        let old = harness.registry().get(&device).unwrap();

        let (second, outcome) = harness.connect("openflow:storm", caps()).await;
        assert_eq!(outcome.unwrap(), ConnectOutcome::Waiting);

        assert!(harness.coordinator.device_disconnected(&first.context()).await);
        assert_eq!(old.status(), ChainStatus::Closed);

        let promoted = wait_until(Duration::from_secs(2), || harness.coordinator.is_active(&device)).await;
        assert!(promoted);

        let current = harness.registry().get(&device).unwrap();
        assert!(current.is_working());
        assert!(current.session_token().supersedes(&old.session_token()));
        assert_eq!(harness.registry().len(), 1);

        assert!(harness.coordinator.device_disconnected(&second.context()).await);
        assert!(harness.registry().is_empty());
    }

    assert_eq!(harness.coordinator.metrics().promoted, 10);
}

#[tokio::test]
async fn second_connection_does_not_disturb_working_owner() {
    let harness = Harness::new();
    let device = DeviceId::new("openflow:d2");

    let (_first, outcome) = harness.connect("openflow:d2", caps()).await;
    let session = match outcome.unwrap() {
        ConnectOutcome::Active { session } => session,
        other => panic!("unexpected outcome {:?}", other),
    };
    let manager = harness.registry().get(&device).unwrap();

    let (waiting, outcome) = harness.connect("openflow:d2", caps()).await;
    assert_eq!(outcome.unwrap(), ConnectOutcome::Waiting);
    assert!(!waiting.is_closed());

    let (late, outcome) = harness.connect("openflow:d2", caps()).await;
    assert!(matches!(outcome, Err(PluginError::Conflict { status: ChainStatus::Working, .. })));
    assert!(late.is_closed());

    assert!(manager.is_working());
    assert_eq!(manager.session_token(), session);
    assert!(harness.statistics().is_provided_flow_node_active(&device));
    assert_eq!(harness.statistics().generated_uuid_for_node(&device), Some(session));
}

#[tokio::test]
async fn connection_during_teardown_is_dropped() {
    let harness = Harness::new();
    let device = DeviceId::new("openflow:broken");

    let (_first, outcome) = harness.connect("openflow:broken", caps()).await;
    assert!(outcome.is_ok());
    let manager = harness.registry().get(&device).unwrap();

    harness.broker.fail_next_commits(1);
    assert!(matches!(manager.submit_chain().await, Err(PluginError::ChainBroken { .. })));
    assert_eq!(manager.status(), ChainStatus::TearingDown);

    let (late, outcome) = harness.connect("openflow:broken", caps()).await;
    assert!(matches!(outcome, Err(PluginError::Conflict { status: ChainStatus::TearingDown, .. })));
    assert!(late.is_closed());

    // a broken chain stops collection for that device only
    assert!(!harness.statistics().is_provided_flow_node_active(&device));
    let (_other, outcome) = harness.connect("openflow:healthy", caps()).await;
    assert!(matches!(outcome, Ok(ConnectOutcome::Active { .. })));
}

#[tokio::test]
async fn response_from_previous_session_is_discarded_after_reconnect() {
    let harness = Harness::new();
    let device = DeviceId::new("openflow:re");

    let (first, _) = harness.connect("openflow:re", caps()).await;
    harness
        .statistics()
        .collect_next_statistics(&device, harness.statistics().next_transaction_id())
        .await
        .unwrap();
    let old_request = harness.rpc.request_for(&device, Capability::Flow).unwrap();

    harness.coordinator.device_disconnected(&first.context()).await;
    let (_second, outcome) = harness.connect("openflow:re", caps()).await;
    assert!(matches!(outcome, Ok(ConnectOutcome::Active { .. })));

    harness
        .statistics()
        .collect_next_statistics(&device, harness.statistics().next_transaction_id())
        .await
        .unwrap();

    let stale = harness
        .statistics()
        .on_response(StatsResponse::reply_to(&old_request, vec![]))
        .await;
    assert!(matches!(stale, Err(PluginError::StaleResponse { .. })));

    let collector = harness.statistics().collector(&device).unwrap();
    assert_eq!(collector.outstanding_requests(), 2);
}

#[tokio::test]
async fn dropped_connection_transport_is_closed_once_owner_is_set() {
    let harness = Harness::new();
    let owner = TestConnection::new("openflow:8");
    harness
        .coordinator
        .device_connected(owner.context(), caps())
        .await
        .unwrap();

    let mut closed = 0;
    for _ in 0..3 {
        let (connection, _) = harness.connect("openflow:8", caps()).await;
        if connection.is_closed() {
            closed += 1;
        }
    }

    // the first extra connection waits; the rest are dropped
    assert_eq!(closed, 2);
    assert!(!owner.is_closed());
    assert_eq!(harness.registry().metrics().connections_dropped, 2);
}

#[tokio::test]
async fn departed_waiter_does_not_block_the_next_successor() {
    let harness = Harness::new();
    let device = DeviceId::new("openflow:handover");

    let (owner, outcome) = harness.connect("openflow:handover", caps()).await;
    assert!(matches!(outcome, Ok(ConnectOutcome::Active { .. })));

    let (departed, outcome) = harness.connect("openflow:handover", caps()).await;
    assert_eq!(outcome.unwrap(), ConnectOutcome::Waiting);
    assert!(harness.coordinator.device_disconnected(&departed.context()).await);

    let (next, outcome) = harness.connect("openflow:handover", caps()).await;
    assert_eq!(outcome.unwrap(), ConnectOutcome::Waiting);
    assert!(!next.is_closed());

    assert!(harness.coordinator.device_disconnected(&owner.context()).await);
    let promoted = wait_until(Duration::from_secs(2), || harness.coordinator.is_active(&device)).await;
    assert!(promoted);
    assert!(!harness.coordinator.is_waiting(&device));
    assert_eq!(harness.registry().len(), 1);
    assert_eq!(harness.coordinator.metrics().promoted, 1);
}
