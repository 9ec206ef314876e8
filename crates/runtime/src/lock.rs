use std::{
    cell::{Ref, RefCell, RefMut},
    collections::BTreeSet,
    sync::{Arc, MutexGuard},
};

use lazuli_core::id::NodeId;

use crate::{
    dag::{NodeBody, NodeSlot, PhysicalDag},
    rtinfo::NodeState,
};

/// Which nodes a `MultiNodeLock` must cover.
pub enum Cover<'a> {
    /// The node plus all of its current predecessors and successors.
    Neighborhood(NodeId),
    /// Each node plus its successors. Used on submission, where the input
    /// data nodes' successor sets are about to gain the new op.
    WithSuccessors(&'a [NodeId]),
}

/// Deadlock-free composite lock over the per-node locks of a cover set.
///
/// Acquisition is optimistic: snapshot the cover, lock every member in
/// ascending id order, then re-validate that every still-live required
/// neighbor is actually covered. A concurrent submission can grow a
/// successor set between snapshot and acquisition; on such a mismatch all
/// locks are released and acquisition restarts. Per-node locks are never
/// taken outside this path, and holders never nest covers, so ascending id
/// order rules out deadlock.
pub struct MultiNodeLock;

impl MultiNodeLock {
    pub fn with<R>(
        dag: &PhysicalDag,
        cover: Cover<'_>,
        f: impl FnOnce(&LockedGraph<'_>) -> R,
    ) -> R {
        let mut f = Some(f);
        loop {
            let want = Self::collect(dag, &cover);
            let handles: Vec<Arc<NodeSlot>> =
                want.iter().filter_map(|&id| dag.lookup(id)).collect();
            let guards: Vec<MutexGuard<'_, NodeBody>> =
                handles.iter().map(|slot| slot.lock_body()).collect();
            let view = LockedGraph::new(&handles, guards);
            if !Self::validate(dag, &cover, &view) {
                continue;
            }
            return (f.take().expect("lock closure already consumed"))(&view);
        }
    }

    /// Snapshot of the required cover. Seeds must be live; a dead seed is a
    /// stale handle or a scheduler invariant violation, both fatal.
    fn collect(dag: &PhysicalDag, cover: &Cover<'_>) -> BTreeSet<NodeId> {
        let mut want = BTreeSet::new();
        match cover {
            Cover::Neighborhood(id) => {
                want.insert(*id);
                let slot = dag.get_node(*id);
                let body = slot.lock_body();
                want.extend(body.preds.iter().copied());
                want.extend(body.succs.iter().copied());
            }
            Cover::WithSuccessors(ids) => {
                for &id in ids.iter() {
                    want.insert(id);
                    let slot = dag.get_node(id);
                    let body = slot.lock_body();
                    want.extend(body.succs.iter().copied());
                }
            }
        }
        want
    }

    /// Recomputes the required set from the locked bodies and checks that
    /// every live member is covered. Ids of removed nodes may linger in
    /// edge sets and are ignored; ids are never reused, so a dead id can
    /// not come back live.
    fn validate(dag: &PhysicalDag, cover: &Cover<'_>, view: &LockedGraph<'_>) -> bool {
        let mut required: Vec<NodeId> = Vec::new();
        match cover {
            Cover::Neighborhood(id) => {
                assert!(
                    dag.contains(*id),
                    "node {id} vanished during lock acquisition"
                );
                let body = view.body(*id);
                required.extend(body.preds.iter().copied());
                required.extend(body.succs.iter().copied());
            }
            Cover::WithSuccessors(ids) => {
                for &id in ids.iter() {
                    assert!(
                        dag.contains(id),
                        "node {id} vanished during lock acquisition"
                    );
                    required.extend(view.body(id).succs.iter().copied());
                }
            }
        }
        required
            .into_iter()
            .all(|id| !dag.contains(id) || view.covers(id))
    }
}

struct LockedNode<'a> {
    slot: &'a Arc<NodeSlot>,
    body: RefCell<MutexGuard<'a, NodeBody>>,
}

/// View over the bodies of all covered nodes while the lock is held. Body
/// accessors hand out dynamically checked borrows so the holder can read
/// one node while mutating another.
pub struct LockedGraph<'a> {
    // Ascending id order; released back-to-front on drop.
    nodes: Vec<LockedNode<'a>>,
}

impl<'a> LockedGraph<'a> {
    fn new(handles: &'a [Arc<NodeSlot>], guards: Vec<MutexGuard<'a, NodeBody>>) -> Self {
        Self {
            nodes: handles
                .iter()
                .zip(guards)
                .map(|(slot, guard)| LockedNode {
                    slot,
                    body: RefCell::new(guard),
                })
                .collect(),
        }
    }

    fn find(&self, id: NodeId) -> Option<&LockedNode<'a>> {
        self.nodes
            .binary_search_by_key(&id, |n| n.slot.id())
            .ok()
            .map(|i| &self.nodes[i])
    }

    fn node(&self, id: NodeId) -> &LockedNode<'a> {
        self.find(id)
            .unwrap_or_else(|| panic!("node {id} is not covered by this lock"))
    }

    pub fn covers(&self, id: NodeId) -> bool {
        self.find(id).is_some()
    }

    pub fn slot(&self, id: NodeId) -> &Arc<NodeSlot> {
        self.node(id).slot
    }

    pub fn body(&self, id: NodeId) -> Ref<'_, NodeBody> {
        Ref::map(self.node(id).body.borrow(), |guard| &**guard)
    }

    pub fn body_mut(&self, id: NodeId) -> RefMut<'_, NodeBody> {
        RefMut::map(self.node(id).body.borrow_mut(), |guard| &mut **guard)
    }

    pub fn state(&self, id: NodeId) -> NodeState {
        self.node(id).slot.state()
    }

    pub fn set_state(&self, id: NodeId, state: NodeState) {
        self.node(id).slot.set_state(state);
    }
}

impl Drop for LockedGraph<'_> {
    fn drop(&mut self) {
        // Reverse-acquisition release order.
        while self.nodes.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use lazuli_core::{
        data::PhysicalData,
        id::{DeviceId, ValueId},
        op::{ComputeFn, PhysicalOp},
        tensor::{ElemType, Tensor},
    };

    use super::*;
    use crate::dag::PhysicalDag;

    struct Nop;

    impl ComputeFn for Nop {
        fn name(&self) -> &str {
            "nop"
        }

        fn execute(&self, _inputs: &[Tensor], _outputs: &mut [Tensor]) {}
    }

    fn data(dag: &PhysicalDag, value: u64) -> Arc<crate::dag::NodeSlot> {
        dag.new_data_node(PhysicalData {
            shape: vec![1].into(),
            elem_ty: ElemType::F32,
            device_id: DeviceId(0),
            value_id: ValueId(value),
        })
    }

    /// a -> op -> b, with the input-side successor edge wired.
    fn small_graph(dag: &PhysicalDag) -> (NodeId, NodeId, NodeId) {
        let a = data(dag, 0);
        let b = data(dag, 1);
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
        (a.id(), op.id(), b.id())
    }

    #[test]
    fn neighborhood_covers_both_directions() {
        let dag = PhysicalDag::new();
        let (a, op, b) = small_graph(&dag);
        MultiNodeLock::with(&dag, Cover::Neighborhood(op), |view| {
            assert!(view.covers(a));
            assert!(view.covers(op));
            assert!(view.covers(b));
        });
    }

    #[test]
    fn with_successors_excludes_predecessors() {
        let dag = PhysicalDag::new();
        let (a, op, b) = small_graph(&dag);
        MultiNodeLock::with(&dag, Cover::WithSuccessors(&[b]), |view| {
            assert!(view.covers(b));
            assert!(!view.covers(a));
            let _ = op;
        });
    }

    #[test]
    #[should_panic(expected = "not covered by this lock")]
    fn access_outside_cover() {
        let dag = PhysicalDag::new();
        let (a, _, b) = small_graph(&dag);
        MultiNodeLock::with(&dag, Cover::WithSuccessors(&[a]), |view| {
            let _ = view.body(b);
        });
    }

    #[test]
    fn concurrent_counter_updates_are_serialized() {
        let dag = Arc::new(PhysicalDag::new());
        let (a, _, _) = small_graph(&dag);
        const BUMPS: u64 = 1000;
        let mut joins = Vec::new();
        for _ in 0..4 {
            let dag = dag.clone();
            joins.push(thread::spawn(move || {
                for _ in 0..BUMPS {
                    MultiNodeLock::with(&dag, Cover::Neighborhood(a), |view| {
                        view.body_mut(a).rt.reference_count += 1;
                    });
                }
            }));
        }
        for j in joins {
            j.join().unwrap();
        }
        MultiNodeLock::with(&dag, Cover::Neighborhood(a), |view| {
            assert_eq!(view.body(a).rt.reference_count, 4 * BUMPS);
        });
    }
}
