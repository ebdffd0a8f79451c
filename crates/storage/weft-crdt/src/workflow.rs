//! Workflow CRDT implementation
//!
//! A finite set of steps, each with a last-writer-wins status register, plus
//! an add-only observed set of completed steps. Concurrent transitions on
//! the same step resolve by the register's LWW rule; completion is
//! monotonic — no merge can un-complete a step.

use crate::{
    clock::ClockManager,
    error::{CrdtError, Result},
    lww_register::LwwState,
    or_set::{OrSet, OrSetOp, OrSetState},
    traits::{Crdt, GarbageCollectable, Materialize, Mergeable, Synchronizable},
    types::{Delta, NodeId, Timestamp, VectorClock},
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    fmt::{self, Display},
};

/// Status of a workflow step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepStatus {
    /// Not started
    Pending,
    /// Currently executing
    Active,
    /// Finished successfully
    Done,
    /// Finished with an error
    Failed,
    /// Deliberately skipped
    Skipped,
}

impl Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StepStatus::Pending => "pending",
            StepStatus::Active => "active",
            StepStatus::Done => "done",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// Workflow operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkflowOp {
    /// LWW write of a step's status
    Transition {
        /// Step identifier
        step: String,
        /// New status
        status: StepStatus,
        /// Write stamp
        timestamp: Timestamp,
        /// Writing node
        node: NodeId,
    },
    /// Monotonic completion marker; only the add form is valid
    Complete(OrSetOp<String>),
}

/// Workflow state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Per-step LWW registers keyed by step id
    pub steps: HashMap<String, LwwState<StepStatus>>,
    /// Completed steps
    pub completed: OrSetState<String>,
}

/// Materialized read view of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowView {
    /// Current status per step
    pub steps: HashMap<String, StepStatus>,
    /// Steps marked complete
    pub completed: HashSet<String>,
}

/// Workflow CRDT
#[derive(Debug)]
pub struct Workflow {
    node_id: NodeId,
    steps: RwLock<HashMap<String, LwwState<StepStatus>>>,
    completed: OrSet<String>,
    clock_manager: ClockManager,
}

impl Workflow {
    /// Create new workflow
    pub fn new(node_id: NodeId) -> Self {
        let clock_manager = ClockManager::new(node_id);
        Self {
            node_id,
            steps: RwLock::new(HashMap::new()),
            completed: OrSet::with_clock(clock_manager.clone()),
            clock_manager,
        }
    }

    /// Transition a step to a new status, returning the replicated operation
    pub async fn transition(&mut self, step: impl Into<String>, status: StepStatus) -> Result<WorkflowOp> {
        let step = step.into();
        if step.is_empty() {
            return Err(CrdtError::malformed("step id must not be empty"));
        }

        self.clock_manager.advance_local();
        let operation = WorkflowOp::Transition {
            step,
            status,
            timestamp: self.clock_manager.next_timestamp(),
            node: self.node_id,
        };
        self.apply_operation(operation.clone()).await?;
        Ok(operation)
    }

    /// Mark a step complete. Completion survives every merge.
    pub async fn complete(&mut self, step: impl Into<String>) -> Result<WorkflowOp> {
        let step = step.into();
        if step.is_empty() {
            return Err(CrdtError::malformed("step id must not be empty"));
        }
        Ok(WorkflowOp::Complete(self.completed.add(step).await?))
    }

    /// Current status of a step
    pub fn status_of(&self, step: &str) -> Option<StepStatus> {
        self.steps.read().get(step).and_then(|state| state.value)
    }

    /// Whether a step has been completed
    pub fn is_complete(&self, step: &str) -> bool {
        self.completed.contains(&step.to_string())
    }

    /// All completed steps
    pub fn completed_steps(&self) -> HashSet<String> {
        self.completed.elements()
    }

    /// Materialize the read view
    pub fn view(&self) -> WorkflowView {
        let steps = self
            .steps
            .read()
            .iter()
            .filter_map(|(step, state)| state.value.map(|status| (step.clone(), status)))
            .collect();
        WorkflowView {
            steps,
            completed: self.completed.elements(),
        }
    }
}

impl Clone for Workflow {
    fn clone(&self) -> Self {
        let clock_manager = self.clock_manager.fork();
        Self {
            node_id: self.node_id,
            steps: RwLock::new(self.steps.read().clone()),
            completed: OrSet::with_clock_and_state(
                clock_manager.clone(),
                self.completed.clone_state(),
            ),
            clock_manager,
        }
    }
}

#[async_trait]
impl Crdt for Workflow {
    type Operation = WorkflowOp;
    type State = WorkflowState;

    async fn apply_operation(&mut self, operation: Self::Operation) -> Result<()> {
        self.validate_operation(&operation)?;
        match operation {
            WorkflowOp::Transition {
                step,
                status,
                timestamp,
                node,
            } => {
                self.steps
                    .write()
                    .entry(step)
                    .or_default()
                    .absorb(status, timestamp, node);
                Ok(())
            }
            WorkflowOp::Complete(op) => self.completed.apply_operation(op).await,
        }
    }

    async fn apply_remote_operation(&mut self, operation: Self::Operation) -> Result<()> {
        self.apply_operation(operation).await
    }

    fn validate_operation(&self, operation: &Self::Operation) -> Result<()> {
        match operation {
            WorkflowOp::Transition { step, .. } => {
                if step.is_empty() {
                    Err(CrdtError::malformed("step id must not be empty"))
                } else {
                    Ok(())
                }
            }
            WorkflowOp::Complete(op) => match op {
                OrSetOp::Add { .. } => self.completed.validate_operation(op),
                OrSetOp::Remove { .. } => Err(CrdtError::malformed(
                    "step completion cannot be retracted",
                )),
            },
        }
    }

    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn vector_clock(&self) -> VectorClock {
        self.clock_manager.vector_clock()
    }

    fn clone_state(&self) -> Self::State {
        WorkflowState {
            steps: self.steps.read().clone(),
            completed: self.completed.clone_state(),
        }
    }
}

#[async_trait]
impl Mergeable for Workflow {
    async fn merge(&mut self, other: &Self) -> Result<()> {
        let other_state = other.clone_state();
        {
            let mut steps = self.steps.write();
            for (step, incoming) in other_state.steps {
                if let (Some(status), Some(node)) = (incoming.value, incoming.node) {
                    steps
                        .entry(step)
                        .or_default()
                        .absorb(status, incoming.timestamp, node);
                }
            }
        }
        self.completed
            .apply_delta(Delta::FullState(other_state.completed))
            .await?;
        self.clock_manager.merge_vector_clock(&other.vector_clock());
        Ok(())
    }

    fn can_merge(&self, _other: &Self) -> bool {
        true
    }

    fn diff(&self, other: &Self) -> Vec<Self::Operation> {
        let mut operations = Vec::new();

        {
            let steps = self.steps.read();
            let other_steps = other.steps.read();
            for (step, incoming) in other_steps.iter() {
                if let (Some(status), Some(node)) = (incoming.value, incoming.node) {
                    let superseded = steps
                        .get(step)
                        .map_or(true, |state| state.loses_to(incoming.timestamp, node));
                    if superseded {
                        operations.push(WorkflowOp::Transition {
                            step: step.clone(),
                            status,
                            timestamp: incoming.timestamp,
                            node,
                        });
                    }
                }
            }
        }

        operations.extend(
            self.completed
                .diff(&other.completed)
                .into_iter()
                .map(WorkflowOp::Complete),
        );
        operations
    }
}

#[async_trait]
impl Synchronizable for Workflow {
    fn delta_since(&self, _clock: &VectorClock) -> Result<Delta<Self::State>> {
        Ok(Delta::FullState(self.clone_state()))
    }

    async fn apply_delta(&mut self, delta: Delta<Self::State>) -> Result<()> {
        match delta {
            Delta::FullState(state) => {
                {
                    let mut steps = self.steps.write();
                    for (step, incoming) in state.steps {
                        if let (Some(status), Some(node)) = (incoming.value, incoming.node) {
                            steps
                                .entry(step)
                                .or_default()
                                .absorb(status, incoming.timestamp, node);
                        }
                    }
                }
                self.completed
                    .apply_delta(Delta::FullState(state.completed))
                    .await
            }
            Delta::Operations(encoded) => {
                for bytes in encoded {
                    let operation: WorkflowOp = bincode::deserialize(&bytes)?;
                    self.apply_remote_operation(operation).await?;
                }
                Ok(())
            }
        }
    }

    fn operations_since(&self, clock: &VectorClock) -> Vec<Self::Operation> {
        let mut operations: Vec<WorkflowOp> = {
            let steps = self.steps.read();
            steps
                .iter()
                .filter_map(|(step, state)| {
                    let (status, node) = (state.value?, state.node?);
                    Some(WorkflowOp::Transition {
                        step: step.clone(),
                        status,
                        timestamp: state.timestamp,
                        node,
                    })
                })
                .collect()
        };
        operations.extend(
            self.completed
                .operations_since(clock)
                .into_iter()
                .map(WorkflowOp::Complete),
        );
        operations
    }

    fn size_bytes(&self) -> usize {
        let steps = self.steps.read();
        steps.len() * (std::mem::size_of::<LwwState<StepStatus>>() + 32)
            + self.completed.size_bytes()
    }
}

impl Materialize for Workflow {
    type Value = WorkflowView;

    fn value(&self) -> WorkflowView {
        self.view()
    }

    fn from_state(node_id: NodeId, state: Self::State) -> Self {
        let clock_manager = ClockManager::new(node_id);
        Self {
            node_id,
            steps: RwLock::new(state.steps),
            completed: OrSet::with_clock_and_state(clock_manager.clone(), state.completed),
            clock_manager,
        }
    }
}

#[async_trait]
impl GarbageCollectable for Workflow {
    fn needs_gc(&self) -> bool {
        self.completed.needs_gc()
    }

    fn garbage_size(&self) -> usize {
        self.completed.garbage_size()
    }

    async fn collect(&mut self, watermark: &VectorClock) -> Result<usize> {
        // Completion is add-only, so there are normally no tombstones;
        // forwarding keeps the pass uniform across types.
        self.completed.collect(watermark).await
    }
}

impl Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let view = self.view();
        write!(
            f,
            "Workflow[{}]: {} steps, {} complete",
            self.node_id,
            view.steps.len(),
            view.completed.len()
        )
    }
}
