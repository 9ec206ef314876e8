use std::{
    fmt,
    sync::{atomic::Ordering, Arc},
};

use lazuli_core::{
    id::{DeviceId, NodeId, ValueId},
    shape::Shape,
    tensor::ElemType,
};

use crate::{dag::NodeSlot, rtinfo::NodeState, scheduler::SchedulerInner};

/// Frontend handle to a data node. As long as at least one handle is
/// alive the node's external reference count is positive and its value
/// cannot be reclaimed. Handles also keep the scheduler itself alive, so
/// a drop can always route its reference-count update back into it.
pub struct DagChunk {
    sched: Arc<SchedulerInner>,
    slot: Arc<NodeSlot>,
}

impl DagChunk {
    /// Wraps a freshly created data node whose external count already
    /// includes this handle.
    pub(crate) fn adopt(sched: Arc<SchedulerInner>, slot: Arc<NodeSlot>) -> Self {
        Self { sched, slot }
    }

    pub fn node_id(&self) -> NodeId {
        self.slot.id()
    }

    pub fn shape(&self) -> &Shape {
        &self.slot.data().data.shape
    }

    pub fn elem_ty(&self) -> ElemType {
        self.slot.data().data.elem_ty
    }

    pub fn device_id(&self) -> DeviceId {
        self.slot.data().data.device_id
    }

    pub fn value_id(&self) -> ValueId {
        self.slot.data().data.value_id
    }

    pub fn is_complete(&self) -> bool {
        self.state() == NodeState::Completed
    }

    pub(crate) fn state(&self) -> NodeState {
        self.slot.state()
    }

    pub(crate) fn slot(&self) -> &Arc<NodeSlot> {
        &self.slot
    }
}

impl Clone for DagChunk {
    fn clone(&self) -> Self {
        // Going up never reclaims, and a live handle means the count is
        // already positive, so no callback into the scheduler is needed.
        self.slot.data().extern_rc.fetch_add(1, Ordering::SeqCst);
        Self {
            sched: self.sched.clone(),
            slot: self.slot.clone(),
        }
    }
}

impl Drop for DagChunk {
    fn drop(&mut self) {
        self.sched.release_extern(&self.slot);
    }
}

impl fmt::Debug for DagChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DagChunk({}, {:?}, {})",
            self.node_id(),
            self.shape(),
            self.value_id()
        )
    }
}
