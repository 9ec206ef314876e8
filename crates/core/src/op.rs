use std::{fmt, sync::Arc};

use crate::{id::DeviceId, tensor::Tensor};

/// Opaque computation attached to an op node. Only device workers invoke
/// it; the scheduler moves it around without inspecting it.
pub trait ComputeFn: Send + Sync {
    fn name(&self) -> &str;

    /// Compute `outputs` from `inputs`. Output tensors arrive zeroed with
    /// their final shape and element type.
    fn execute(&self, inputs: &[Tensor], outputs: &mut [Tensor]);
}

/// Computation plus the device it was placed on at submission.
#[derive(Clone)]
pub struct PhysicalOp {
    pub compute_fn: Arc<dyn ComputeFn>,
    pub device_id: DeviceId,
}

impl fmt::Debug for PhysicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalOp({} on {})", self.compute_fn.name(), self.device_id)
    }
}
