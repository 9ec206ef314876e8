use std::sync::Arc;

use lazuli_core::{
    data::PhysicalData,
    id::{DeviceId, NodeId, ValueId},
    op::PhysicalOp,
};

/// Snapshot of a data node as seen by a device inside a `Task`.
#[derive(Debug, Clone)]
pub struct TaskData {
    pub data: PhysicalData,
    pub node_id: NodeId,
}

/// A dispatched operation. `id` is the op node's id; the device reports it
/// back verbatim on completion.
#[derive(Debug)]
pub struct Task {
    pub id: NodeId,
    pub inputs: Vec<TaskData>,
    pub outputs: Vec<TaskData>,
    pub op: PhysicalOp,
}

/// Handle to device-resident bytes, valid for as long as it is held.
#[derive(Clone)]
pub struct DevicePtr(pub Arc<Vec<u8>>);

/// Completion sink the scheduler registers with the device manager.
/// Implementations must never block; the scheduler's implementation only
/// enqueues a dispatcher event.
pub trait DeviceListener: Send + Sync {
    fn on_operation_complete(&self, task: Task);
}

/// The pool of compute devices as the scheduler sees it. Placement policy
/// lives with the frontend; the scheduler only pushes tasks to the device
/// chosen at submission and releases storage it proved unreachable.
pub trait DeviceManager: Send + Sync {
    fn register_listener(&self, listener: Arc<dyn DeviceListener>);

    fn push_task(&self, device_id: DeviceId, task: Task);

    fn get_ptr(&self, device_id: DeviceId, value_id: ValueId) -> DevicePtr;

    fn free_data(&self, value_id: ValueId);
}
