//! Graph CRDT implementation
//!
//! Vertices and edges are each kept in an observed-remove set, so adds and
//! removes on both converge with add-wins semantics. The read view only
//! surfaces edges whose endpoints are both live, which keeps concurrent
//! vertex removal coherent without cross-set coordination.
//!
//! Traversals run over a snapshot, track a visited set keyed by vertex
//! identity, and bound their iteration count by the vertex count, so a
//! cycle introduced by a concurrent edge addition can never make a query
//! loop indefinitely.

use crate::{
    clock::ClockManager,
    error::{CrdtError, Result},
    or_set::{OrSet, OrSetOp, OrSetState},
    traits::{Crdt, GarbageCollectable, Materialize, Mergeable, Synchronizable},
    types::{Delta, NodeId, VectorClock},
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt::{self, Display},
    hash::Hash,
};

/// A directed edge between two vertices
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge<V> {
    /// Source vertex
    pub from: V,
    /// Target vertex
    pub to: V,
}

impl<V> Edge<V> {
    /// Create an edge
    pub fn new(from: V, to: V) -> Self {
        Self { from, to }
    }
}

/// Graph operation: an OR-Set operation on either the vertex or edge set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "V: Clone + Eq + Hash + Serialize + for<'a> Deserialize<'a>")]
pub enum GraphOp<V>
where
    V: Clone + Eq + Hash,
{
    /// Mutation of the vertex set
    Vertex(OrSetOp<V>),
    /// Mutation of the edge set
    Edge(OrSetOp<Edge<V>>),
}

/// Graph state: the two OR-Set states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "V: Clone + Eq + Hash + Serialize + for<'a> Deserialize<'a>")]
pub struct GraphState<V>
where
    V: Clone + Eq + Hash,
{
    /// Vertex set state
    pub vertices: OrSetState<V>,
    /// Edge set state
    pub edges: OrSetState<Edge<V>>,
}

/// Materialized read view of the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "V: Clone + Eq + Hash + Serialize + for<'a> Deserialize<'a>")]
pub struct GraphView<V>
where
    V: Clone + Eq + Hash,
{
    /// Live vertices
    pub vertices: HashSet<V>,
    /// Live edges with both endpoints present
    pub edges: HashSet<Edge<V>>,
}

/// Graph CRDT built from two observed-remove sets
#[derive(Debug)]
pub struct Graph<V>
where
    V: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    node_id: NodeId,
    vertices: OrSet<V>,
    edges: OrSet<Edge<V>>,
    clock_manager: ClockManager,
}

impl<V> Graph<V>
where
    V: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    /// Create new graph
    pub fn new(node_id: NodeId) -> Self {
        let clock_manager = ClockManager::new(node_id);
        Self {
            node_id,
            vertices: OrSet::with_clock(clock_manager.clone()),
            edges: OrSet::with_clock(clock_manager.clone()),
            clock_manager,
        }
    }

    /// Add a vertex, returning the replicated operation
    pub async fn add_vertex(&mut self, vertex: V) -> Result<GraphOp<V>> {
        Ok(GraphOp::Vertex(self.vertices.add(vertex).await?))
    }

    /// Remove a vertex. Incident edges stay in the edge set but disappear
    /// from the read view until the vertex is re-added.
    pub async fn remove_vertex(&mut self, vertex: &V) -> Result<GraphOp<V>> {
        Ok(GraphOp::Vertex(self.vertices.remove(vertex).await?))
    }

    /// Add an edge between two existing vertices
    pub async fn add_edge(&mut self, from: V, to: V) -> Result<GraphOp<V>> {
        if !self.vertices.contains(&from) || !self.vertices.contains(&to) {
            return Err(CrdtError::malformed(
                "edge endpoints must be present vertices",
            ));
        }
        Ok(GraphOp::Edge(self.edges.add(Edge::new(from, to)).await?))
    }

    /// Remove an edge
    pub async fn remove_edge(&mut self, from: &V, to: &V) -> Result<GraphOp<V>> {
        let edge = Edge::new(from.clone(), to.clone());
        Ok(GraphOp::Edge(self.edges.remove(&edge).await?))
    }

    /// Check if a vertex is live
    pub fn has_vertex(&self, vertex: &V) -> bool {
        self.vertices.contains(vertex)
    }

    /// Check if an edge is live, including its endpoints
    pub fn has_edge(&self, from: &V, to: &V) -> bool {
        self.has_vertex(from)
            && self.has_vertex(to)
            && self.edges.contains(&Edge::new(from.clone(), to.clone()))
    }

    /// Number of live vertices
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Materialize the live view
    pub fn view(&self) -> GraphView<V> {
        let vertices = self.vertices.elements();
        let edges = self
            .edges
            .elements()
            .into_iter()
            .filter(|edge| vertices.contains(&edge.from) && vertices.contains(&edge.to))
            .collect();
        GraphView { vertices, edges }
    }

    /// Out-neighbors of a vertex in the live view
    pub fn neighbors(&self, vertex: &V) -> HashSet<V> {
        let view = self.view();
        view.edges
            .iter()
            .filter(|edge| &edge.from == vertex)
            .map(|edge| edge.to.clone())
            .collect()
    }

    /// Breadth-first shortest path over a snapshot of the live view.
    ///
    /// Terminates within `O(vertex_count)` dequeues: the visited set
    /// prevents revisits and the explicit step bound caps the loop even if
    /// the snapshot were somehow inconsistent.
    pub fn shortest_path(&self, from: &V, to: &V) -> Option<Vec<V>> {
        let view = self.view();
        if !view.vertices.contains(from) || !view.vertices.contains(to) {
            return None;
        }
        if from == to {
            return Some(vec![from.clone()]);
        }

        let mut adjacency: HashMap<&V, Vec<&V>> = HashMap::new();
        for edge in &view.edges {
            adjacency.entry(&edge.from).or_default().push(&edge.to);
        }

        let bound = view.vertices.len();
        let mut visited: HashSet<&V> = HashSet::new();
        let mut parent: HashMap<&V, &V> = HashMap::new();
        let mut queue: VecDeque<&V> = VecDeque::new();

        visited.insert(from);
        queue.push_back(from);
        let mut steps = 0usize;

        while let Some(current) = queue.pop_front() {
            steps += 1;
            if steps > bound {
                break;
            }

            for &next in adjacency.get(current).into_iter().flatten() {
                if !visited.insert(next) {
                    continue;
                }
                parent.insert(next, current);
                if next == to {
                    let mut path = vec![next.clone()];
                    let mut cursor = next;
                    while let Some(&prev) = parent.get(cursor) {
                        path.push(prev.clone());
                        cursor = prev;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next);
            }
        }

        None
    }
}

impl<V> Clone for Graph<V>
where
    V: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    fn clone(&self) -> Self {
        let clock_manager = self.clock_manager.fork();
        Self {
            node_id: self.node_id,
            vertices: OrSet::with_clock_and_state(
                clock_manager.clone(),
                self.vertices.clone_state(),
            ),
            edges: OrSet::with_clock_and_state(clock_manager.clone(), self.edges.clone_state()),
            clock_manager,
        }
    }
}

#[async_trait]
impl<V> Crdt for Graph<V>
where
    V: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    type Operation = GraphOp<V>;
    type State = GraphState<V>;

    async fn apply_operation(&mut self, operation: Self::Operation) -> Result<()> {
        match operation {
            GraphOp::Vertex(op) => self.vertices.apply_operation(op).await,
            GraphOp::Edge(op) => self.edges.apply_operation(op).await,
        }
    }

    async fn apply_remote_operation(&mut self, operation: Self::Operation) -> Result<()> {
        self.apply_operation(operation).await
    }

    fn validate_operation(&self, operation: &Self::Operation) -> Result<()> {
        match operation {
            GraphOp::Vertex(op) => self.vertices.validate_operation(op),
            GraphOp::Edge(op) => self.edges.validate_operation(op),
        }
    }

    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn vector_clock(&self) -> VectorClock {
        self.clock_manager.vector_clock()
    }

    fn clone_state(&self) -> Self::State {
        GraphState {
            vertices: self.vertices.clone_state(),
            edges: self.edges.clone_state(),
        }
    }
}

#[async_trait]
impl<V> Mergeable for Graph<V>
where
    V: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    async fn merge(&mut self, other: &Self) -> Result<()> {
        self.vertices.merge(&other.vertices).await?;
        self.edges.merge(&other.edges).await?;
        Ok(())
    }

    fn can_merge(&self, _other: &Self) -> bool {
        true
    }

    fn diff(&self, other: &Self) -> Vec<Self::Operation> {
        let mut operations: Vec<GraphOp<V>> = self
            .vertices
            .diff(&other.vertices)
            .into_iter()
            .map(GraphOp::Vertex)
            .collect();
        operations.extend(self.edges.diff(&other.edges).into_iter().map(GraphOp::Edge));
        operations
    }
}

#[async_trait]
impl<V> Synchronizable for Graph<V>
where
    V: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    fn delta_since(&self, _clock: &VectorClock) -> Result<Delta<Self::State>> {
        Ok(Delta::FullState(self.clone_state()))
    }

    async fn apply_delta(&mut self, delta: Delta<Self::State>) -> Result<()> {
        match delta {
            Delta::FullState(state) => {
                self.vertices
                    .apply_delta(Delta::FullState(state.vertices))
                    .await?;
                self.edges.apply_delta(Delta::FullState(state.edges)).await?;
                Ok(())
            }
            Delta::Operations(encoded) => {
                for bytes in encoded {
                    let operation: GraphOp<V> = bincode::deserialize(&bytes)?;
                    self.apply_remote_operation(operation).await?;
                }
                Ok(())
            }
        }
    }

    fn operations_since(&self, clock: &VectorClock) -> Vec<Self::Operation> {
        let mut operations: Vec<GraphOp<V>> = self
            .vertices
            .operations_since(clock)
            .into_iter()
            .map(GraphOp::Vertex)
            .collect();
        operations.extend(
            self.edges
                .operations_since(clock)
                .into_iter()
                .map(GraphOp::Edge),
        );
        operations
    }

    fn size_bytes(&self) -> usize {
        self.vertices.size_bytes() + self.edges.size_bytes()
    }
}

impl<V> Materialize for Graph<V>
where
    V: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    type Value = GraphView<V>;

    fn value(&self) -> GraphView<V> {
        self.view()
    }

    fn from_state(node_id: NodeId, state: Self::State) -> Self {
        let clock_manager = ClockManager::new(node_id);
        Self {
            node_id,
            vertices: OrSet::with_clock_and_state(clock_manager.clone(), state.vertices),
            edges: OrSet::with_clock_and_state(clock_manager.clone(), state.edges),
            clock_manager,
        }
    }
}

#[async_trait]
impl<V> GarbageCollectable for Graph<V>
where
    V: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    fn needs_gc(&self) -> bool {
        self.vertices.needs_gc() || self.edges.needs_gc()
    }

    fn garbage_size(&self) -> usize {
        self.vertices.garbage_size() + self.edges.garbage_size()
    }

    async fn collect(&mut self, watermark: &VectorClock) -> Result<usize> {
        let reclaimed_vertices = self.vertices.collect(watermark).await?;
        let reclaimed_edges = self.edges.collect(watermark).await?;
        Ok(reclaimed_vertices + reclaimed_edges)
    }
}

impl<V> Display for Graph<V>
where
    V: Clone + Eq + Hash + Send + Sync + Serialize + for<'de> Deserialize<'de>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let view = self.view();
        write!(
            f,
            "Graph[{}]: {} vertices, {} edges",
            self.node_id,
            view.vertices.len(),
            view.edges.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn chain(graph: &mut Graph<String>, vertices: &[&str]) {
        for v in vertices {
            graph.add_vertex(v.to_string()).await.unwrap();
        }
        for pair in vertices.windows(2) {
            graph
                .add_edge(pair[0].to_string(), pair[1].to_string())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_add_vertices_and_edges() {
        let mut graph = Graph::new(NodeId::new());
        chain(&mut graph, &["a", "b", "c"]).await;

        assert!(graph.has_edge(&"a".to_string(), &"b".to_string()));
        assert_eq!(graph.vertex_count(), 3);
        assert_eq!(
            graph.neighbors(&"b".to_string()),
            HashSet::from(["c".to_string()])
        );
    }

    #[tokio::test]
    async fn test_edge_requires_endpoints() {
        let mut graph: Graph<String> = Graph::new(NodeId::new());
        graph.add_vertex("a".to_string()).await.unwrap();

        let result = graph.add_edge("a".to_string(), "missing".to_string()).await;
        assert!(matches!(result, Err(CrdtError::MalformedOperation { .. })));
    }

    #[tokio::test]
    async fn test_removed_vertex_hides_incident_edges() {
        let mut graph = Graph::new(NodeId::new());
        chain(&mut graph, &["a", "b"]).await;

        graph.remove_vertex(&"b".to_string()).await.unwrap();

        assert!(!graph.has_edge(&"a".to_string(), &"b".to_string()));
        assert!(graph.view().edges.is_empty());

        // Re-adding the vertex resurfaces the surviving edge record.
        graph.add_vertex("b".to_string()).await.unwrap();
        assert!(graph.has_edge(&"a".to_string(), &"b".to_string()));
    }

    #[tokio::test]
    async fn test_shortest_path() {
        let mut graph = Graph::new(NodeId::new());
        chain(&mut graph, &["a", "b", "c", "d"]).await;
        // Shortcut a -> c.
        graph
            .add_edge("a".to_string(), "c".to_string())
            .await
            .unwrap();

        let path = graph
            .shortest_path(&"a".to_string(), &"d".to_string())
            .unwrap();
        assert_eq!(path, vec!["a".to_string(), "c".to_string(), "d".to_string()]);
    }

    #[tokio::test]
    async fn test_shortest_path_terminates_with_cycle() {
        let mut graph = Graph::new(NodeId::new());
        chain(&mut graph, &["a", "b", "c"]).await;
        // Close the cycle c -> a, then query a path to an unreachable node.
        graph
            .add_edge("c".to_string(), "a".to_string())
            .await
            .unwrap();
        graph.add_vertex("island".to_string()).await.unwrap();

        assert_eq!(
            graph.shortest_path(&"a".to_string(), &"island".to_string()),
            None
        );
    }

    #[tokio::test]
    async fn test_cycle_inserted_by_peer_mid_traversal_window() {
        // A peer closes a cycle concurrently; after merging, traversal
        // still terminates and finds paths.
        let mut a = Graph::new(NodeId::new());
        let mut b = Graph::new(NodeId::new());

        chain(&mut a, &["a", "b", "c"]).await;
        b.merge(&a).await.unwrap();
        b.add_edge("c".to_string(), "a".to_string()).await.unwrap();
        a.merge(&b).await.unwrap();

        let path = a
            .shortest_path(&"a".to_string(), &"c".to_string())
            .unwrap();
        assert_eq!(path.len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_add_remove_vertex_is_add_wins() {
        let mut a = Graph::new(NodeId::new());
        let mut b = Graph::new(NodeId::new());

        a.add_vertex("x".to_string()).await.unwrap();
        b.merge(&a).await.unwrap();

        // a removes while b re-adds concurrently.
        a.remove_vertex(&"x".to_string()).await.unwrap();
        b.add_vertex("x".to_string()).await.unwrap();

        a.merge(&b).await.unwrap();
        b.merge(&a).await.unwrap();

        assert!(a.has_vertex(&"x".to_string()));
        assert_eq!(a.clone_state(), b.clone_state());
    }

    #[tokio::test]
    async fn test_state_round_trip() {
        let mut graph = Graph::new(NodeId::new());
        chain(&mut graph, &["a", "b"]).await;

        let bytes = graph.to_bytes().unwrap();
        let restored: Graph<String> = Graph::from_bytes(graph.node_id(), &bytes).unwrap();
        assert_eq!(restored.view(), graph.view());
    }
}
