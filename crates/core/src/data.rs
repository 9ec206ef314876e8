use crate::{
    id::{DeviceId, ValueId},
    shape::Shape,
    tensor::ElemType,
};

/// Placement and storage identity of a data node's array value. Immutable
/// once the node is created.
#[derive(Debug, Clone)]
pub struct PhysicalData {
    pub shape: Shape,
    pub elem_ty: ElemType,
    pub device_id: DeviceId,
    pub value_id: ValueId,
}

impl PhysicalData {
    pub fn byte_len(&self) -> usize {
        self.shape.total_elems() * self.elem_ty.size_in_bytes()
    }
}
