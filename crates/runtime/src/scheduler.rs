use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
};

use lazuli_core::{
    data::PhysicalData,
    id::{DeviceId, NodeId, ValueId},
    op::{ComputeFn, PhysicalOp},
    shape::Shape,
    tensor::{ElemType, Tensor},
};
use log::{debug, trace};

use crate::{
    chunk::DagChunk,
    dag::{NodeBody, NodeSlot, PhysicalDag},
    device::{DeviceListener, DeviceManager, Task, TaskData},
    lock::{Cover, LockedGraph, MultiNodeLock},
    queue::{DispatchQueue, Event, EventKind, Popped},
    rtinfo::NodeState,
};

/// Placement context threaded through submission instead of hidden
/// thread-local state: every `create` names the device its op and result
/// values land on.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCtx {
    pub device_id: DeviceId,
}

impl DeviceCtx {
    pub fn new(device_id: DeviceId) -> Self {
        Self { device_id }
    }
}

/// Dynamic dataflow scheduler over the physical DAG. Submission grows the
/// graph, a single dispatcher thread moves ready ops onto devices and
/// applies completions, and intermediate values are reclaimed the moment
/// they become unreachable.
pub struct DagScheduler {
    inner: Arc<SchedulerInner>,
    dispatcher: Option<JoinHandle<()>>,
}

pub(crate) struct SchedulerInner {
    dag: PhysicalDag,
    dm: Arc<dyn DeviceManager>,
    queue: DispatchQueue,
    num_nodes_yet_to_finish: AtomicU64,
    /// Node a targeted `wait` is parked on, if any. Leaf lock: taken with
    /// node locks held by the dispatcher, never the other way around.
    finish: Mutex<Option<NodeId>>,
    finish_cond: Condvar,
    next_value_id: AtomicU64,
    shut_down: AtomicBool,
}

/// Completion sink handed to the device manager. Only enqueues; never
/// blocks in device worker context.
struct SchedulerListener(Arc<SchedulerInner>);

impl DeviceListener for SchedulerListener {
    fn on_operation_complete(&self, task: Task) {
        trace!("device reported completion of task {}", task.id);
        self.0.queue.push(Event::to_complete(task.id));
    }
}

impl DagScheduler {
    pub fn new(dm: Arc<dyn DeviceManager>) -> Self {
        let inner = Arc::new(SchedulerInner {
            dag: PhysicalDag::new(),
            dm: dm.clone(),
            queue: DispatchQueue::new(),
            num_nodes_yet_to_finish: AtomicU64::new(0),
            finish: Mutex::new(None),
            finish_cond: Condvar::new(),
            next_value_id: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        });
        dm.register_listener(Arc::new(SchedulerListener(inner.clone())));
        let worker = inner.clone();
        let dispatcher = thread::Builder::new()
            .name("lazuli-dispatcher".into())
            .spawn(move || worker.dispatcher_routine())
            .expect("failed to spawn dispatcher thread");
        Self {
            inner,
            dispatcher: Some(dispatcher),
        }
    }

    /// Submits one operation producing one data node per result shape.
    /// Runs entirely under a single multi-node lock over the params, whose
    /// successor sets gain the new op; the op is enqueued right away when
    /// it needs no triggers.
    pub fn create(
        &self,
        ctx: &DeviceCtx,
        params: &[&DagChunk],
        result_shapes: &[Shape],
        compute_fn: Arc<dyn ComputeFn>,
    ) -> Vec<DagChunk> {
        assert!(
            !result_shapes.is_empty(),
            "an operation must produce at least one result"
        );
        let inner = &self.inner;
        let param_ids: Vec<NodeId> = params.iter().map(|c| c.node_id()).collect();
        MultiNodeLock::with(&inner.dag, Cover::WithSuccessors(&param_ids), |view| {
            let result_slots: Vec<Arc<NodeSlot>> = result_shapes
                .iter()
                .map(|shape| {
                    inner.dag.new_data_node(PhysicalData {
                        shape: shape.clone(),
                        elem_ty: ElemType::F32,
                        device_id: ctx.device_id,
                        value_id: inner.fresh_value_id(),
                    })
                })
                .collect();
            let result_ids: Vec<NodeId> = result_slots.iter().map(|s| s.id()).collect();
            let op_slot = inner.dag.new_op_node(
                &param_ids,
                &result_ids,
                PhysicalOp {
                    compute_fn,
                    device_id: ctx.device_id,
                },
            );
            debug!(
                "create op node {} ({} params, {} results) on {}",
                op_slot.id(),
                param_ids.len(),
                result_ids.len(),
                ctx.device_id
            );

            // Counter updates, one per unique edge (a param passed twice
            // is still one edge). The params are covered by the lock; the
            // op and result slots are unreachable from other threads until
            // the first event is enqueued, so locking them directly here
            // cannot contend.
            let mut op_body = op_slot.lock_body();
            let unique_params: Vec<NodeId> = op_body.preds.iter().copied().collect();
            for p in unique_params {
                view.body_mut(p).succs.insert(op_slot.id());
                view.body_mut(p).rt.reference_count += 1;
                if view.state(p) != NodeState::Completed {
                    op_body.rt.num_triggers_needed += 1;
                }
            }
            for slot in &result_slots {
                op_body.rt.reference_count += 1;
                slot.lock_body().rt.num_triggers_needed += 1;
            }
            inner.process_if_ready(&op_slot, &op_body);
            drop(op_body);

            result_slots
                .into_iter()
                .map(|slot| DagChunk::adopt(inner.clone(), slot))
                .collect()
        })
    }

    /// Blocks until the handle's node completes. Unrelated completions
    /// wake the condition variable but not the caller.
    pub fn wait(&self, chunk: &DagChunk) {
        let node_id = chunk.node_id();
        let mut target = self.inner.finish.lock().expect("finish lock poisoned");
        *target = Some(node_id);
        while chunk.state() != NodeState::Completed {
            target = self
                .inner
                .finish_cond
                .wait(target)
                .expect("finish lock poisoned");
        }
        *target = None;
    }

    /// Blocks until no submitted work is in flight.
    pub fn wait_for_all(&self) {
        let mut target = self.inner.finish.lock().expect("finish lock poisoned");
        // The targeted and the global wait share the condition variable
        // but not a predicate; running both at once is undefined.
        assert!(
            target.is_none(),
            "wait_for_all while a targeted wait is in progress"
        );
        while self.inner.num_nodes_yet_to_finish.load(Ordering::SeqCst) != 0 {
            target = self
                .inner
                .finish_cond
                .wait(target)
                .expect("finish lock poisoned");
        }
    }

    /// Copies a completed node's value into a host tensor. The frontend is
    /// expected to have waited first.
    pub fn get_value(&self, chunk: &DagChunk) -> Tensor {
        assert_eq!(
            chunk.state(),
            NodeState::Completed,
            "get_value on node {} before completion",
            chunk.node_id()
        );
        let data = &chunk.slot().data().data;
        let ptr = self.inner.dm.get_ptr(data.device_id, data.value_id);
        let bytes = ptr.0[..data.byte_len()].to_vec();
        Tensor::from_raw(data.shape.clone(), data.elem_ty, bytes)
    }

    /// Nodes currently in the DAG. After `wait_for_all`, exactly the data
    /// nodes pinned by live handles remain.
    pub fn num_live_nodes(&self) -> usize {
        self.inner.dag.len()
    }
}

impl Drop for DagScheduler {
    fn drop(&mut self) {
        self.wait_for_all();
        self.inner.queue.signal_kill();
        if let Some(handle) = self.dispatcher.take() {
            handle.join().expect("dispatcher thread panicked");
        }
        self.inner.shut_down.store(true, Ordering::SeqCst);
    }
}

impl SchedulerInner {
    fn fresh_value_id(&self) -> ValueId {
        ValueId(self.next_value_id.fetch_add(1, Ordering::SeqCst))
    }

    fn process_if_ready(&self, op: &NodeSlot, body: &NodeBody) {
        assert_eq!(
            op.state(),
            NodeState::Ready,
            "invalid state for node {}",
            op.id()
        );
        if body.rt.num_triggers_needed == 0 {
            // Counted before the enqueue so a racing wait_for_all observes
            // the in-flight work.
            self.num_nodes_yet_to_finish.fetch_add(1, Ordering::SeqCst);
            self.queue.push(Event::to_run(op.id()));
            debug!("node {} runnable right after submission", op.id());
        }
    }

    /// The dispatcher actor. Exits only on the kill marker, which shutdown
    /// sends after draining all in-flight work.
    fn dispatcher_routine(&self) {
        while let Popped::Event(event) = self.queue.pop() {
            let node_id = event.node_id;
            let slot = self.dag.get_node(node_id);
            let mut to_delete: Vec<Arc<NodeSlot>> = Vec::new();
            MultiNodeLock::with(&self.dag, Cover::Neighborhood(node_id), |view| {
                if event.kind == EventKind::ToRun && slot.is_op() {
                    self.dispatch_op(&slot, view);
                } else {
                    // Completions proper, plus ToRun for data nodes: a data
                    // node whose triggers reached zero has been concretely
                    // evaluated by its producer and completes here.
                    self.complete_node(&slot, view, &mut to_delete);
                }
            });
            // Retired node records are dropped with no locks held.
            drop(to_delete);
        }
        trace!("dispatcher exiting");
    }

    /// Materializes a task from an op whose triggers all fired and hands
    /// it to the device. State is untouched; the device's completion
    /// report arrives as a separate event.
    fn dispatch_op(&self, slot: &Arc<NodeSlot>, view: &LockedGraph<'_>) {
        let op = slot.op();
        debug_assert!(op
            .inputs
            .iter()
            .all(|&p| view.state(p) == NodeState::Completed));
        let inputs: Vec<TaskData> = op
            .inputs
            .iter()
            .map(|&d| TaskData {
                data: view.slot(d).data().data.clone(),
                node_id: d,
            })
            .collect();
        let outputs: Vec<TaskData> = op
            .outputs
            .iter()
            .map(|&d| TaskData {
                data: view.slot(d).data().data.clone(),
                node_id: d,
            })
            .collect();
        let device_id = op.op.device_id;
        debug!("dispatching node {} to device {}", slot.id(), device_id);
        self.dm.push_task(
            device_id,
            Task {
                id: slot.id(),
                inputs,
                outputs,
                op: op.op.clone(),
            },
        );
    }

    /// Applies a completion: retires predecessor edges, reclaims whatever
    /// became unreachable, triggers successors, and signals waiters.
    /// Reclaimed slots are pushed to `to_delete` for destruction outside
    /// the lock.
    fn complete_node(
        &self,
        slot: &Arc<NodeSlot>,
        view: &LockedGraph<'_>,
        to_delete: &mut Vec<Arc<NodeSlot>>,
    ) {
        let id = slot.id();
        assert_eq!(slot.state(), NodeState::Ready, "node {id} completed twice");
        view.set_state(id, NodeState::Completed);
        debug!("finish node {id}");

        if slot.is_op() {
            assert_ne!(
                view.body(id).rt.reference_count,
                0,
                "op node {id} generated but not needed"
            );
            let preds: Vec<NodeId> = view.body(id).preds.iter().copied().collect();
            for p in preds {
                let remaining = {
                    let mut pred = view.body_mut(p);
                    assert_eq!(
                        pred.rt.num_triggers_needed, 0,
                        "trigger count out of sync for completed data node {p}"
                    );
                    pred.rt.reference_count -= 1;
                    pred.rt.reference_count
                };
                // The last retiring edge makes the input unreachable
                // unless a frontend handle still pins it.
                if remaining == 0 && view.slot(p).data().extern_rc.load(Ordering::SeqCst) == 0 {
                    self.free_data_node_res(view.slot(p));
                    debug!("remove node {p} during dispatch");
                    to_delete.push(self.dag.remove_node(view, p));
                }
            }
        } else {
            if view.body(id).rt.reference_count == 0
                && slot.data().extern_rc.load(Ordering::SeqCst) == 0
            {
                // Generated but never consumed nor held.
                self.free_data_node_res(slot);
                debug!("remove node {id} during dispatch");
                to_delete.push(self.dag.remove_node(view, id));
            }
            let preds: Vec<NodeId> = view.body(id).preds.iter().copied().collect();
            assert_eq!(
                preds.len(),
                1,
                "data node {id} must have exactly one producer"
            );
            let p = preds[0];
            let remaining = {
                let mut producer = view.body_mut(p);
                assert_eq!(
                    producer.rt.num_triggers_needed, 0,
                    "trigger count out of sync for completed op node {p}"
                );
                producer.rt.reference_count -= 1;
                producer.rt.reference_count
            };
            // Op nodes are never externally referenced.
            if remaining == 0 {
                debug!("remove node {p} during dispatch");
                to_delete.push(self.dag.remove_node(view, p));
            }
        }

        let succs: Vec<NodeId> = view.body(id).succs.iter().copied().collect();
        for s in succs {
            let now_ready = {
                let mut succ = view.body_mut(s);
                succ.rt.num_triggers_needed -= 1;
                succ.rt.num_triggers_needed == 0
            };
            if now_ready && view.state(s) == NodeState::Ready {
                debug!("trigger node {s}");
                self.num_nodes_yet_to_finish.fetch_add(1, Ordering::SeqCst);
                self.queue.push(Event::to_run(s));
            }
        }

        let prev = self.num_nodes_yet_to_finish.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "in-flight counter underflow at node {id}");
        {
            let target = self.finish.lock().expect("finish lock poisoned");
            if self.num_nodes_yet_to_finish.load(Ordering::SeqCst) == 0 || *target == Some(id) {
                self.finish_cond.notify_all();
            }
        }
    }

    /// Releases one external reference. The decrement happens under the
    /// node's lock so the drop-to-zero check is atomic with respect to the
    /// dispatcher's own reclamation check.
    pub(crate) fn release_extern(&self, slot: &Arc<NodeSlot>) {
        let id = slot.id();
        assert!(
            !self.shut_down.load(Ordering::SeqCst),
            "extern rc update for node {id} after scheduler shutdown"
        );
        let mut to_delete = None;
        MultiNodeLock::with(&self.dag, Cover::Neighborhood(id), |view| {
            let prev = slot.data().extern_rc.fetch_sub(1, Ordering::SeqCst);
            assert!(prev > 0, "extern rc underflow for node {id}");
            let remaining = prev - 1;
            trace!("extern rc of node {id} dropped to {remaining}");
            match slot.state() {
                NodeState::Completed => {
                    // Concretely evaluated already; with no scheduler-side
                    // references left either, storage can be reclaimed now.
                    if remaining == 0 && view.body(id).rt.reference_count == 0 {
                        self.free_data_node_res(slot);
                        debug!("remove node {id} on extern rc release");
                        to_delete = Some(self.dag.remove_node(view, id));
                    }
                }
                // A pending producer still owns the slot; reclamation is
                // re-checked at completion time.
                NodeState::Ready => {}
            }
        });
        drop(to_delete);
    }

    /// Eagerly returns a data node's device storage. The tight resource is
    /// the device memory, not the node record.
    fn free_data_node_res(&self, slot: &NodeSlot) {
        let data = &slot.data().data;
        debug!("free value {} of node {}", data.value_id, slot.id());
        self.dm.free_data(data.value_id);
    }
}
