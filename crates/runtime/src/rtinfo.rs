use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle phase of a DAG node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Created but not yet concretely evaluated.
    Ready,
    /// Evaluation finished; for a data node, its value is resident on the
    /// device until reclaimed.
    Completed,
}

/// Lock-free mirror of a node's lifecycle state. Written only while the
/// node's lock is held; readable from anywhere, which lets waiters on
/// `finish_mutex` check for completion without touching node locks.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

const READY: u8 = 0;
const COMPLETED: u8 = 1;

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(READY))
    }

    pub fn get(&self) -> NodeState {
        match self.0.load(Ordering::Acquire) {
            READY => NodeState::Ready,
            COMPLETED => NodeState::Completed,
            s => unreachable!("corrupt node state tag {s}"),
        }
    }

    pub(crate) fn set(&self, state: NodeState) {
        let tag = match state {
            NodeState::Ready => READY,
            NodeState::Completed => COMPLETED,
        };
        self.0.store(tag, Ordering::Release);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-node scheduling counters, guarded by the node's lock. Kept next to
/// the edge sets so that a node has runtime info exactly as long as it is
/// in the DAG.
#[derive(Debug, Default)]
pub struct RuntimeInfo {
    /// Successor edges whose downstream completion has not yet retired
    /// them. A data node with no remaining edges and no external handles
    /// is reclaimable.
    pub reference_count: u64,
    /// Predecessors still in `Ready` state. The node becomes dispatchable
    /// when this reaches zero.
    pub num_triggers_needed: u64,
}
