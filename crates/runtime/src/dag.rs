use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, RwLock,
    },
};

use lazuli_core::{
    data::PhysicalData,
    id::NodeId,
    op::PhysicalOp,
};
use rustc_hash::FxHashMap;

use crate::{
    lock::LockedGraph,
    rtinfo::{NodeState, RuntimeInfo, StateCell},
};

/// A data node's payload: placement plus the external reference count
/// mutated by frontend handles.
#[derive(Debug)]
pub struct DataPayload {
    pub data: PhysicalData,
    /// Outstanding frontend handles pinning this node. Incremented
    /// lock-free on handle clone (a live handle implies the count is
    /// already positive); decremented only under the node's lock so the
    /// drop-to-zero check is atomic with reclamation.
    pub extern_rc: AtomicU64,
}

/// An op node's payload. The ordered input/output lists feed task
/// materialization; the unordered edge sets in `NodeBody` drive
/// scheduling.
#[derive(Debug)]
pub struct OpPayload {
    pub op: PhysicalOp,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
}

/// Node payload, immutable once the node is inserted.
#[derive(Debug)]
pub enum NodePayload {
    Data(DataPayload),
    Op(OpPayload),
}

/// Mutable part of a node: edge sets and scheduling counters. Accessed
/// only through a held `MultiNodeLock`.
#[derive(Debug, Default)]
pub struct NodeBody {
    pub preds: BTreeSet<NodeId>,
    pub succs: BTreeSet<NodeId>,
    pub rt: RuntimeInfo,
}

#[derive(Debug)]
pub struct NodeSlot {
    id: NodeId,
    payload: NodePayload,
    state: StateCell,
    body: Mutex<NodeBody>,
}

impl NodeSlot {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn state(&self) -> NodeState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: NodeState) {
        self.state.set(state);
    }

    pub fn is_op(&self) -> bool {
        matches!(self.payload, NodePayload::Op(_))
    }

    pub fn data(&self) -> &DataPayload {
        match &self.payload {
            NodePayload::Data(d) => d,
            NodePayload::Op(_) => panic!("node {} is an op node, not a data node", self.id),
        }
    }

    pub fn op(&self) -> &OpPayload {
        match &self.payload {
            NodePayload::Op(o) => o,
            NodePayload::Data(_) => panic!("node {} is a data node, not an op node", self.id),
        }
    }

    pub(crate) fn lock_body(&self) -> MutexGuard<'_, NodeBody> {
        self.body.lock().expect("node lock poisoned")
    }
}

/// The physical DAG: owner of every live node. Nodes are referred to by id
/// everywhere else; `Arc`s handed out (frontend handles, held lock covers)
/// extend the memory lifetime of a slot but never its logical one.
pub struct PhysicalDag {
    slots: RwLock<FxHashMap<NodeId, Arc<NodeSlot>>>,
    next_id: AtomicU64,
}

impl PhysicalDag {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(FxHashMap::default()),
            next_id: AtomicU64::new(0),
        }
    }

    fn alloc_id(&self) -> NodeId {
        NodeId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn insert(&self, slot: Arc<NodeSlot>) -> Arc<NodeSlot> {
        self.slots
            .write()
            .expect("dag map poisoned")
            .insert(slot.id, slot.clone());
        slot
    }

    /// Allocates a fresh data node with empty edge sets and zeroed
    /// counters. The external reference count starts at 1 for the handle
    /// that submission is about to hand out, so the node is pinned from
    /// birth.
    pub fn new_data_node(&self, data: PhysicalData) -> Arc<NodeSlot> {
        let id = self.alloc_id();
        self.insert(Arc::new(NodeSlot {
            id,
            payload: NodePayload::Data(DataPayload {
                data,
                extern_rc: AtomicU64::new(1),
            }),
            state: StateCell::new(),
            body: Mutex::new(NodeBody::default()),
        }))
    }

    /// Allocates an op node wired to its arguments. The op's own edge sets
    /// are complete on return; the input-side successor edges and all
    /// counter updates are the caller's to apply, under a `MultiNodeLock`
    /// covering `inputs`.
    pub fn new_op_node(
        &self,
        inputs: &[NodeId],
        outputs: &[NodeId],
        op: PhysicalOp,
    ) -> Arc<NodeSlot> {
        let id = self.alloc_id();
        self.insert(Arc::new(NodeSlot {
            id,
            payload: NodePayload::Op(OpPayload {
                op,
                inputs: inputs.to_vec(),
                outputs: outputs.to_vec(),
            }),
            state: StateCell::new(),
            body: Mutex::new(NodeBody {
                preds: inputs.iter().copied().collect(),
                succs: outputs.iter().copied().collect(),
                rt: RuntimeInfo::default(),
            }),
        }))
    }

    pub fn get_node(&self, id: NodeId) -> Arc<NodeSlot> {
        self.lookup(id)
            .unwrap_or_else(|| panic!("node {id} not found in DAG"))
    }

    pub fn lookup(&self, id: NodeId) -> Option<Arc<NodeSlot>> {
        self.slots.read().expect("dag map poisoned").get(&id).cloned()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.slots.read().expect("dag map poisoned").contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.slots.read().expect("dag map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes the node and detaches it from the edge sets of every
    /// neighbor the held lock covers. Neighbors outside the cover are
    /// either already removed themselves or will never traverse the stale
    /// edge again; traversals always filter through map liveness. Returns
    /// the detached slot so the caller can drop it outside all locks.
    pub fn remove_node(&self, view: &LockedGraph<'_>, id: NodeId) -> Arc<NodeSlot> {
        let slot = self
            .slots
            .write()
            .expect("dag map poisoned")
            .remove(&id)
            .unwrap_or_else(|| panic!("removal of unknown node {id}"));
        let (preds, succs) = {
            let body = view.body(id);
            (body.preds.clone(), body.succs.clone())
        };
        for p in preds {
            if view.covers(p) {
                view.body_mut(p).succs.remove(&id);
            }
        }
        for s in succs {
            if view.covers(s) {
                view.body_mut(s).preds.remove(&id);
            }
        }
        slot
    }
}

impl Default for PhysicalDag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lazuli_core::{
        data::PhysicalData,
        id::{DeviceId, NodeId, ValueId},
        op::{ComputeFn, PhysicalOp},
        tensor::{ElemType, Tensor},
    };

    use super::*;
    use crate::lock::{Cover, MultiNodeLock};

    struct Nop;

    impl ComputeFn for Nop {
        fn name(&self) -> &str {
            "nop"
        }

        fn execute(&self, _inputs: &[Tensor], _outputs: &mut [Tensor]) {}
    }

    fn data(dag: &PhysicalDag, value: u64) -> Arc<NodeSlot> {
        dag.new_data_node(PhysicalData {
            shape: vec![2].into(),
            elem_ty: ElemType::F32,
            device_id: DeviceId(0),
            value_id: ValueId(value),
        })
    }

    #[test]
    fn ids_are_monotonic() {
        let dag = PhysicalDag::new();
        let a = data(&dag, 0);
        let b = data(&dag, 1);
        assert!(a.id() < b.id());
        assert_eq!(dag.len(), 2);
    }

    #[test]
    #[should_panic(expected = "not found in DAG")]
    fn get_unknown_node() {
        let dag = PhysicalDag::new();
        dag.get_node(NodeId(42));
    }

    #[test]
    #[should_panic(expected = "is a data node")]
    fn wrong_variant_access() {
        let dag = PhysicalDag::new();
        let d = data(&dag, 0);
        let _ = d.op();
    }

    #[test]
    fn op_node_is_wired_on_creation() {
        let dag = PhysicalDag::new();
        let a = data(&dag, 0);
        let b = data(&dag, 1);
        let op = dag.new_op_node(
            &[a.id()],
            &[b.id()],
            PhysicalOp {
                compute_fn: Arc::new(Nop),
                device_id: DeviceId(0),
            },
        );
        let body = op.lock_body();
        assert!(body.preds.contains(&a.id()));
        assert!(body.succs.contains(&b.id()));
        assert_eq!(op.op().inputs, vec![a.id()]);
    }

    #[test]
    fn removal_detaches_covered_neighbors() {
        let dag = PhysicalDag::new();
        let a = data(&dag, 0);
        let b = data(&dag, 1);
        let op = dag.new_op_node(
            &[a.id()],
            &[b.id()],
            PhysicalOp {
                compute_fn: Arc::new(Nop),
                device_id: DeviceId(0),
            },
        );
        a.lock_body().succs.insert(op.id());
        b.lock_body().preds.insert(op.id());

        let removed = MultiNodeLock::with(&dag, Cover::Neighborhood(op.id()), |view| {
            dag.remove_node(view, op.id())
        });
        assert_eq!(removed.id(), op.id());
        assert!(!dag.contains(op.id()));
        assert!(a.lock_body().succs.is_empty());
        assert!(b.lock_body().preds.is_empty());
        assert_eq!(dag.len(), 2);
    }
}
