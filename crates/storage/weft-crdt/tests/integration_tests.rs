//! Integration tests for the full state layer: registry, resolver, and
//! synchronization working together across replicas.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use weft_crdt::{
    sync::memory_transport::InMemoryHub, ChangeOrigin, ConflictResolver, CrdtRegistry, Decision,
    JsonValue, LocalChange, MemoryStore, NodeId, NullMetrics, ResolverConfig, StepStatus,
    SyncConfig, SyncEngine, SyncService, Timestamp, TypeTag,
};

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

fn node_stack(hub: &Arc<InMemoryHub>) -> (NodeId, Arc<CrdtRegistry>, Arc<SyncEngine>) {
    init_tracing();
    let node = NodeId::new();
    let registry = Arc::new(CrdtRegistry::new(node, Arc::new(MemoryStore::new())));
    let transport = Arc::new(hub.register(node));
    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&registry),
        transport,
        Arc::new(NullMetrics),
        SyncConfig::default(),
    ));
    (node, registry, engine)
}

/// Deliver queued messages until every engine drains its inbox.
async fn pump(engines: &[&Arc<SyncEngine>]) {
    for _ in 0..24 {
        let mut delivered = false;
        for engine in engines {
            while let Ok(Ok((from, frame))) =
                tokio::time::timeout(Duration::from_millis(20), engine.recv_frame()).await
            {
                let _ = engine.handle_frame(from, frame).await;
                delivered = true;
            }
        }
        if !delivered {
            break;
        }
    }
}

#[tokio::test]
async fn three_replica_counter_scenario_converges_to_fifteen() {
    let hub = InMemoryHub::new();
    let (node_a, registry_a, engine_a) = node_stack(&hub);
    let (node_b, registry_b, engine_b) = node_stack(&hub);
    let (node_c, registry_c, engine_c) = node_stack(&hub);

    // 5, 3, and 7 with no synchronization in between.
    registry_a
        .apply_local(TypeTag::GCounter, "total", LocalChange::Increment { amount: 5 })
        .await
        .unwrap();
    registry_b
        .apply_local(TypeTag::GCounter, "total", LocalChange::Increment { amount: 3 })
        .await
        .unwrap();
    registry_c
        .apply_local(TypeTag::GCounter, "total", LocalChange::Increment { amount: 7 })
        .await
        .unwrap();

    // Pairwise rounds in arbitrary order.
    engine_a.begin_round(node_b).await.unwrap();
    pump(&[&engine_a, &engine_b, &engine_c]).await;
    engine_c.begin_round(node_a).await.unwrap();
    pump(&[&engine_a, &engine_b, &engine_c]).await;
    engine_b.begin_round(node_c).await.unwrap();
    pump(&[&engine_a, &engine_b, &engine_c]).await;

    for registry in [&registry_a, &registry_b, &registry_c] {
        assert_eq!(
            registry.value(TypeTag::GCounter, "total").await.unwrap(),
            serde_json::json!(15)
        );
    }
}

#[tokio::test]
async fn or_set_add_wins_through_the_full_pipeline() {
    let hub = InMemoryHub::new();
    let (_node_a, registry_a, engine_a) = node_stack(&hub);
    let (node_b, registry_b, engine_b) = node_stack(&hub);

    // Replicate the element to b, then race a's remove against b's re-add.
    registry_a
        .apply_local(
            TypeTag::OrSet,
            "tags",
            LocalChange::AddElement {
                element: "keep".to_string(),
            },
        )
        .await
        .unwrap();
    engine_a.begin_round(node_b).await.unwrap();
    pump(&[&engine_a, &engine_b]).await;

    registry_a
        .apply_local(
            TypeTag::OrSet,
            "tags",
            LocalChange::RemoveElement {
                element: "keep".to_string(),
            },
        )
        .await
        .unwrap();
    registry_b
        .apply_local(
            TypeTag::OrSet,
            "tags",
            LocalChange::AddElement {
                element: "keep".to_string(),
            },
        )
        .await
        .unwrap();

    engine_a.begin_round(node_b).await.unwrap();
    pump(&[&engine_a, &engine_b]).await;

    // b's unobserved add survives on both sides.
    for registry in [&registry_a, &registry_b] {
        assert_eq!(
            registry.value(TypeTag::OrSet, "tags").await.unwrap(),
            serde_json::json!(["keep"])
        );
    }
}

#[tokio::test]
async fn partitioned_replica_catches_up_in_one_round() {
    let hub = InMemoryHub::new();
    let (node_a, registry_a, engine_a) = node_stack(&hub);
    let (node_b, registry_b, engine_b) = node_stack(&hub);

    hub.partition(node_b);

    // The isolated replica keeps writing locally.
    for i in 0..10 {
        registry_b
            .apply_local(
                TypeTag::TimeSeries,
                "pulse",
                LocalChange::RecordPoint {
                    timestamp: Some(Timestamp::from_millis(i * 10)),
                    value: i as f64,
                },
            )
            .await
            .unwrap();
    }
    registry_a
        .apply_local(
            TypeTag::TimeSeries,
            "pulse",
            LocalChange::RecordPoint {
                timestamp: Some(Timestamp::from_millis(5)),
                value: 99.0,
            },
        )
        .await
        .unwrap();

    hub.heal(node_b);

    // A single round after reconnection reaches convergence, with no
    // operation applied twice.
    engine_b.begin_round(node_a).await.unwrap();
    pump(&[&engine_a, &engine_b]).await;

    let value_a = registry_a.value(TypeTag::TimeSeries, "pulse").await.unwrap();
    let value_b = registry_b.value(TypeTag::TimeSeries, "pulse").await.unwrap();
    assert_eq!(value_a, value_b);
    assert_eq!(value_a.as_array().unwrap().len(), 11);

    let duplicates = engine_a.stats().duplicates_dropped.load(std::sync::atomic::Ordering::Relaxed)
        + engine_b.stats().duplicates_dropped.load(std::sync::atomic::Ordering::Relaxed);
    assert_eq!(duplicates, 0);
}

#[tokio::test]
async fn workflow_transitions_converge_and_conflicts_reach_the_resolver() {
    let hub = InMemoryHub::new();
    let (_node_a, registry_a, engine_a) = node_stack(&hub);
    let (node_b, registry_b, engine_b) = node_stack(&hub);

    // Wire a resolver into replica a.
    let (resolver, conflict_tx, mut outcomes) = ConflictResolver::new(ResolverConfig {
        batch_size: 1,
        batch_timeout: Duration::from_millis(10),
        ..ResolverConfig::default()
    });
    registry_a.set_conflict_channel(conflict_tx);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let resolver_handle = tokio::spawn(resolver.run(cancel_rx));

    // Concurrent transitions on the same step from both replicas.
    registry_a
        .apply_local(
            TypeTag::Workflow,
            "onboarding",
            LocalChange::TransitionStep {
                step: "verify".to_string(),
                status: StepStatus::Failed,
            },
        )
        .await
        .unwrap();
    registry_b
        .apply_local(
            TypeTag::Workflow,
            "onboarding",
            LocalChange::TransitionStep {
                step: "verify".to_string(),
                status: StepStatus::Done,
            },
        )
        .await
        .unwrap();
    registry_b
        .apply_local(
            TypeTag::Workflow,
            "onboarding",
            LocalChange::CompleteStep {
                step: "verify".to_string(),
            },
        )
        .await
        .unwrap();

    engine_a.begin_round(node_b).await.unwrap();
    pump(&[&engine_a, &engine_b]).await;

    // Both sides converge; completion is monotonic.
    let view_a = registry_a.value(TypeTag::Workflow, "onboarding").await.unwrap();
    let view_b = registry_b.value(TypeTag::Workflow, "onboarding").await.unwrap();
    assert_eq!(view_a, view_b);
    assert_eq!(view_a["completed"], serde_json::json!(["verify"]));

    // The concurrent window surfaced as a semantic conflict, and the
    // algebraic merge was not blocked by it.
    let outcome = tokio::time::timeout(Duration::from_secs(1), outcomes.recv())
        .await
        .expect("resolver produced an outcome")
        .expect("outcome channel open");
    assert!(matches!(
        outcome.decision,
        Decision::AcceptMerge | Decision::Selected { .. } | Decision::Deferred
    ));

    let status = registry_a.status(TypeTag::Workflow, "onboarding").await.unwrap();
    assert!(status.pending_conflicts > 0);
    registry_a
        .note_conflicts_settled(&outcome.conflict.key, 1)
        .await;
    let status = registry_a.status(TypeTag::Workflow, "onboarding").await.unwrap();
    assert_eq!(status.pending_conflicts, 0);

    drop(registry_a);
    let _ = resolver_handle.abort();
}

#[tokio::test]
async fn lww_register_sync_is_deterministic_for_ties() {
    let hub = InMemoryHub::new();
    let (_node_a, registry_a, engine_a) = node_stack(&hub);
    let (node_b, registry_b, engine_b) = node_stack(&hub);

    registry_a
        .apply_local(
            TypeTag::LwwRegister,
            "model",
            LocalChange::SetValue {
                value: JsonValue::new(serde_json::json!("draft-a")),
            },
        )
        .await
        .unwrap();
    registry_b
        .apply_local(
            TypeTag::LwwRegister,
            "model",
            LocalChange::SetValue {
                value: JsonValue::new(serde_json::json!("draft-b")),
            },
        )
        .await
        .unwrap();

    engine_a.begin_round(node_b).await.unwrap();
    pump(&[&engine_a, &engine_b]).await;

    let value_a = registry_a.value(TypeTag::LwwRegister, "model").await.unwrap();
    let value_b = registry_b.value(TypeTag::LwwRegister, "model").await.unwrap();
    assert_eq!(value_a, value_b);
    assert!(value_a == serde_json::json!("draft-a") || value_a == serde_json::json!("draft-b"));
}

#[tokio::test]
async fn graph_cycle_added_concurrently_keeps_queries_bounded() {
    let hub = InMemoryHub::new();
    let (node_a, registry_a, engine_a) = node_stack(&hub);
    let (node_b, registry_b, engine_b) = node_stack(&hub);

    for vertex in ["a", "b", "c"] {
        registry_a
            .apply_local(
                TypeTag::Graph,
                "routes",
                LocalChange::AddVertex {
                    vertex: vertex.to_string(),
                },
            )
            .await
            .unwrap();
    }
    registry_a
        .apply_local(
            TypeTag::Graph,
            "routes",
            LocalChange::AddEdge {
                from: "a".to_string(),
                to: "b".to_string(),
            },
        )
        .await
        .unwrap();
    registry_a
        .apply_local(
            TypeTag::Graph,
            "routes",
            LocalChange::AddEdge {
                from: "b".to_string(),
                to: "c".to_string(),
            },
        )
        .await
        .unwrap();
    engine_a.begin_round(node_b).await.unwrap();
    pump(&[&engine_a, &engine_b]).await;

    // b closes the cycle concurrently; a merges it in.
    registry_b
        .apply_local(
            TypeTag::Graph,
            "routes",
            LocalChange::AddEdge {
                from: "c".to_string(),
                to: "a".to_string(),
            },
        )
        .await
        .unwrap();
    engine_b.begin_round(node_a).await.unwrap();
    pump(&[&engine_a, &engine_b]).await;

    let value = registry_a.value(TypeTag::Graph, "routes").await.unwrap();
    assert_eq!(value["edges"].as_array().unwrap().len(), 3);
    assert_eq!(
        registry_a.value(TypeTag::Graph, "routes").await.unwrap(),
        registry_b.value(TypeTag::Graph, "routes").await.unwrap()
    );
}

#[tokio::test]
async fn background_services_converge_two_nodes() {
    let hub = InMemoryHub::new();
    let (_node_a, registry_a, engine_a) = node_stack(&hub);
    let (_node_b, registry_b, engine_b) = node_stack(&hub);

    let service_a = SyncService::new(Arc::clone(&engine_a));
    let service_b = SyncService::new(Arc::clone(&engine_b));
    let handles: Vec<_> = service_a.start().into_iter().chain(service_b.start()).collect();

    let mut events = registry_b
        .subscribe(TypeTag::PnCounter, "budget")
        .await
        .unwrap();

    registry_a
        .apply_local(TypeTag::PnCounter, "budget", LocalChange::Increment { amount: 20 })
        .await
        .unwrap();
    registry_a
        .apply_local(TypeTag::PnCounter, "budget", LocalChange::Decrement { amount: 6 })
        .await
        .unwrap();

    // The subscriber on the other node hears about the merged delta.
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("remote change within the sync interval")
        .expect("event channel open");
    assert!(matches!(event.origin, ChangeOrigin::Remote { .. }));

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(
        registry_b.value(TypeTag::PnCounter, "budget").await.unwrap(),
        serde_json::json!(14)
    );

    service_a.stop();
    service_b.stop();
    for handle in handles {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
}
