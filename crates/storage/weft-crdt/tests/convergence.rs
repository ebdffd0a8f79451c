//! Property tests for the CRDT algebra: permutation convergence,
//! idempotent merge, and lossless serialization for every type.

use proptest::prelude::*;
use weft_crdt::{
    lww_register::LwwOp, workflow::WorkflowOp, Crdt, GCounter, GSet, Graph, LwwRegister,
    Materialize, Mergeable, NodeId, OrSet, PnCounter, StepStatus, TimeSeries, Timestamp, Workflow,
};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime")
}

/// Merge every ordered replica pair once, in the given order. One full
/// pass is enough for convergence: each replica merges directly from
/// every other, and states only grow toward the join.
async fn gossip<T: Mergeable>(replicas: &mut [T], pair_order: &[(usize, usize)]) {
    for &(i, j) in pair_order {
        if i == j {
            continue;
        }
        let source = replicas[j].clone();
        replicas[i].merge(&source).await.expect("merge");
    }
}

/// All ordered pairs of 0..n, shuffled by the proptest-provided indices.
fn pair_orders(n: usize) -> impl Strategy<Value = Vec<(usize, usize)>> {
    let pairs: Vec<(usize, usize)> = (0..n)
        .flat_map(|i| (0..n).map(move |j| (i, j)))
        .filter(|(i, j)| i != j)
        .collect();
    Just(pairs).prop_shuffle()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn gcounter_converges_under_any_merge_order(
        increments in proptest::collection::vec(proptest::collection::vec(1u64..100, 0..8), 3),
        order_a in pair_orders(3),
        order_b in pair_orders(3),
    ) {
        runtime().block_on(async {
            let total: u64 = increments.iter().flatten().sum();

            let build = || async {
                let mut replicas: Vec<GCounter> =
                    (0..3).map(|_| GCounter::new(NodeId::new())).collect();
                for (replica, amounts) in replicas.iter_mut().zip(&increments) {
                    for &amount in amounts {
                        replica.increment(amount).await.unwrap();
                    }
                }
                replicas
            };

            let mut first = build().await;
            gossip(&mut first, &order_a).await;
            let mut second = build().await;
            gossip(&mut second, &order_b).await;

            for replica in first.iter().chain(second.iter()) {
                prop_assert_eq!(replica.value(), total);
            }
            Ok(())
        })?;
    }

    #[test]
    fn pncounter_converges_and_matches_net_total(
        deltas in proptest::collection::vec(
            proptest::collection::vec((proptest::bool::ANY, 1u64..50), 0..8),
            3,
        ),
        order in pair_orders(3),
    ) {
        runtime().block_on(async {
            let net: i64 = deltas
                .iter()
                .flatten()
                .map(|&(negative, amount)| if negative { -(amount as i64) } else { amount as i64 })
                .sum();

            let mut replicas: Vec<PnCounter> =
                (0..3).map(|_| PnCounter::new(NodeId::new())).collect();
            for (replica, ops) in replicas.iter_mut().zip(&deltas) {
                for &(negative, amount) in ops {
                    if negative {
                        replica.decrement(amount).await.unwrap();
                    } else {
                        replica.increment(amount).await.unwrap();
                    }
                }
            }

            gossip(&mut replicas, &order).await;
            for replica in &replicas {
                prop_assert_eq!(replica.value(), net);
            }
            Ok(())
        })?;
    }

    #[test]
    fn gset_converges_to_union(
        additions in proptest::collection::vec(
            proptest::collection::vec("[a-e]", 0..6),
            3,
        ),
        order in pair_orders(3),
    ) {
        runtime().block_on(async {
            let mut replicas: Vec<GSet<String>> =
                (0..3).map(|_| GSet::new(NodeId::new())).collect();
            for (replica, elements) in replicas.iter_mut().zip(&additions) {
                for element in elements {
                    replica.add(element.clone()).await.unwrap();
                }
            }

            gossip(&mut replicas, &order).await;

            let expected: std::collections::HashSet<String> =
                additions.iter().flatten().cloned().collect();
            for replica in &replicas {
                prop_assert_eq!(replica.elements(), expected.clone());
            }
            Ok(())
        })?;
    }

    #[test]
    fn orset_replicas_reach_identical_state(
        scripts in proptest::collection::vec(
            proptest::collection::vec((proptest::bool::ANY, "[a-c]"), 0..8),
            3,
        ),
        order_a in pair_orders(3),
        order_b in pair_orders(3),
    ) {
        runtime().block_on(async {
            let nodes: Vec<NodeId> = (0..3).map(|_| NodeId::new()).collect();

            let build = |node_ids: &[NodeId]| {
                let scripts = scripts.clone();
                let node_ids = node_ids.to_vec();
                async move {
                    let mut replicas: Vec<OrSet<String>> =
                        node_ids.iter().map(|&n| OrSet::new(n)).collect();
                    for (replica, script) in replicas.iter_mut().zip(&scripts) {
                        for (remove, element) in script {
                            if *remove && replica.contains(element) {
                                replica.remove(element).await.unwrap();
                            } else if !*remove {
                                replica.add(element.clone()).await.unwrap();
                            }
                        }
                    }
                    replicas
                }
            };

            let mut first = build(&nodes).await;
            gossip(&mut first, &order_a).await;
            let mut second = build(&nodes).await;
            gossip(&mut second, &order_b).await;

            // Within one run every replica holds identical state.
            for window in first.windows(2) {
                prop_assert_eq!(window[0].clone_state(), window[1].clone_state());
            }
            for window in second.windows(2) {
                prop_assert_eq!(window[0].clone_state(), window[1].clone_state());
            }
            Ok(())
        })?;
    }

    #[test]
    fn lww_register_converges_with_deterministic_tiebreak(
        writes in proptest::collection::vec((0u64..16, "[a-z]{1,4}"), 1..12),
        order_a in pair_orders(3),
        order_b in pair_orders(3),
    ) {
        runtime().block_on(async {
            let nodes: Vec<NodeId> = (0..3).map(|_| NodeId::new()).collect();
            // Each write is stamped deterministically and assigned to a
            // replica round-robin; equal stamps force the node tiebreak.
            let ops: Vec<(usize, LwwOp<String>)> = writes
                .iter()
                .enumerate()
                .map(|(index, (stamp, value))| {
                    let owner = index % 3;
                    (
                        owner,
                        LwwOp {
                            value: value.clone(),
                            timestamp: Timestamp::from_millis(*stamp),
                            node: nodes[owner],
                        },
                    )
                })
                .collect();

            let build = || {
                let ops = ops.clone();
                let nodes = nodes.clone();
                async move {
                    let mut replicas: Vec<LwwRegister<String>> =
                        nodes.iter().map(|&n| LwwRegister::new(n)).collect();
                    for (owner, op) in &ops {
                        replicas[*owner].apply_operation(op.clone()).await.unwrap();
                    }
                    replicas
                }
            };

            let mut first = build().await;
            gossip(&mut first, &order_a).await;
            let mut second = build().await;
            gossip(&mut second, &order_b).await;

            let reference = first[0].get();
            for replica in first.iter().chain(second.iter()) {
                prop_assert_eq!(replica.get(), reference.clone());
            }
            Ok(())
        })?;
    }

    #[test]
    fn time_series_interleaves_identically(
        points in proptest::collection::vec(
            proptest::collection::vec((0u64..1000, -100i64..100), 0..8),
            3,
        ),
        order in pair_orders(3),
    ) {
        runtime().block_on(async {
            let mut replicas: Vec<TimeSeries> =
                (0..3).map(|_| TimeSeries::new(NodeId::new())).collect();
            for (replica, series) in replicas.iter_mut().zip(&points) {
                for &(stamp, value) in series {
                    replica
                        .record_at(Timestamp::from_millis(stamp), value as f64)
                        .await
                        .unwrap();
                }
            }

            gossip(&mut replicas, &order).await;

            let reference = replicas[0].points();
            let expected: usize = points.iter().map(|s| s.len()).sum();
            prop_assert_eq!(reference.len(), expected);
            for replica in &replicas[1..] {
                prop_assert_eq!(replica.points(), reference.clone());
            }
            Ok(())
        })?;
    }

    #[test]
    fn workflow_completion_is_monotonic_everywhere(
        transitions in proptest::collection::vec((0u64..32, 0usize..4, 0usize..5), 0..12),
        completions in proptest::collection::vec(0usize..4, 0..4),
        order in pair_orders(3),
    ) {
        runtime().block_on(async {
            let steps = ["plan", "fetch", "draft", "review"];
            let statuses = [
                StepStatus::Pending,
                StepStatus::Active,
                StepStatus::Done,
                StepStatus::Failed,
                StepStatus::Skipped,
            ];
            let nodes: Vec<NodeId> = (0..3).map(|_| NodeId::new()).collect();

            let mut replicas: Vec<Workflow> =
                nodes.iter().map(|&n| Workflow::new(n)).collect();
            for (index, &(stamp, step, status)) in transitions.iter().enumerate() {
                let owner = index % 3;
                replicas[owner]
                    .apply_operation(WorkflowOp::Transition {
                        step: steps[step].to_string(),
                        status: statuses[status],
                        timestamp: Timestamp::from_millis(stamp),
                        node: nodes[owner],
                    })
                    .await
                    .unwrap();
            }
            for (index, &step) in completions.iter().enumerate() {
                let owner = index % 3;
                replicas[owner].complete(steps[step]).await.unwrap();
            }

            gossip(&mut replicas, &order).await;

            let completed: std::collections::HashSet<String> =
                completions.iter().map(|&s| steps[s].to_string()).collect();
            let reference = replicas[0].view();
            for replica in &replicas {
                let view = replica.view();
                prop_assert_eq!(&view, &reference);
                // Every completion survives every merge order.
                prop_assert_eq!(&view.completed, &completed);
            }
            Ok(())
        })?;
    }

    #[test]
    fn merge_with_self_is_identity(
        increments in proptest::collection::vec(1u64..100, 1..8),
    ) {
        runtime().block_on(async {
            let mut counter = GCounter::new(NodeId::new());
            for &amount in &increments {
                counter.increment(amount).await.unwrap();
            }

            let before = counter.clone_state();
            let snapshot = counter.clone();
            counter.merge(&snapshot).await.unwrap();
            counter.merge(&snapshot).await.unwrap();

            prop_assert_eq!(counter.clone_state(), before);
            Ok(())
        })?;
    }

    #[test]
    fn serialization_round_trips_are_merge_equal(
        elements in proptest::collection::vec("[a-f]{1,3}", 0..10),
        removals in proptest::collection::vec(proptest::bool::ANY, 0..10),
    ) {
        runtime().block_on(async {
            let mut set: OrSet<String> = OrSet::new(NodeId::new());
            for (element, remove) in elements.iter().zip(removals.iter().chain(std::iter::repeat(&false))) {
                set.add(element.clone()).await.unwrap();
                if *remove {
                    set.remove(element).await.unwrap();
                }
            }

            let bytes = set.to_bytes().unwrap();
            let mut restored: OrSet<String> = OrSet::from_bytes(set.node_id(), &bytes).unwrap();
            prop_assert_eq!(restored.clone_state(), set.clone_state());

            // Merging the round-tripped replica back is a no-op.
            let before = set.clone_state();
            restored.merge(&set).await.unwrap();
            set.merge(&restored).await.unwrap();
            prop_assert_eq!(set.clone_state(), before);
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn graph_replicas_converge_after_gossip() {
    let mut a = Graph::new(NodeId::new());
    let mut b = Graph::new(NodeId::new());
    let mut c = Graph::new(NodeId::new());

    a.add_vertex("x".to_string()).await.unwrap();
    a.add_vertex("y".to_string()).await.unwrap();
    a.add_edge("x".to_string(), "y".to_string()).await.unwrap();
    b.add_vertex("z".to_string()).await.unwrap();
    c.add_vertex("x".to_string()).await.unwrap();
    c.remove_vertex(&"x".to_string()).await.unwrap();

    // Two different gossip orders over fresh copies.
    let mut first = [a.clone(), b.clone(), c.clone()];
    for (i, j) in [(0, 1), (1, 2), (2, 0), (0, 2), (2, 1), (1, 0)] {
        let source = first[j].clone();
        first[i].merge(&source).await.unwrap();
    }
    let mut second = [a, b, c];
    for (i, j) in [(2, 0), (1, 0), (0, 1), (2, 1), (1, 2), (0, 2)] {
        let source = second[j].clone();
        second[i].merge(&source).await.unwrap();
    }

    let reference = first[0].view();
    for graph in first.iter().chain(second.iter()) {
        assert_eq!(graph.view(), reference);
    }
    // a's add of "x" was never observed by c's remove: add wins.
    assert!(reference.vertices.contains("x"));
    assert!(reference.vertices.contains("z"));
}
