use std::{fmt, mem::ManuallyDrop};

use crate::shape::Shape;

/// Element type of an array value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemType {
    F32,
    I32,
}

impl ElemType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            ElemType::F32 | ElemType::I32 => 4,
        }
    }
}

pub trait ElemTypeExt: Copy {
    fn elem_ty() -> ElemType;
}

impl ElemTypeExt for f32 {
    fn elem_ty() -> ElemType {
        ElemType::F32
    }
}

impl ElemTypeExt for i32 {
    fn elem_ty() -> ElemType {
        ElemType::I32
    }
}

/// Host-resident array value. Device-side storage is referred to by
/// `ValueId` only; a `Tensor` is what compute functions read and write and
/// what `get_value` hands back to the frontend.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    dims: Shape,
    elem_ty: ElemType,
    data: Vec<u8>,
}

impl Tensor {
    pub fn new<T: ElemTypeExt>(dims: Shape, data: Vec<T>) -> Self {
        assert_eq!(
            dims.total_elems(),
            data.len(),
            "tensor data length does not match shape {dims:?}"
        );
        let data = ManuallyDrop::new(data);
        Self {
            elem_ty: T::elem_ty(),
            data: unsafe {
                Vec::from_raw_parts(
                    data.as_ptr() as *mut u8,
                    data.len() * std::mem::size_of::<T>(),
                    data.capacity() * std::mem::size_of::<T>(),
                )
            },
            dims,
        }
    }

    pub fn from_raw(dims: Shape, elem_ty: ElemType, data: Vec<u8>) -> Self {
        assert_eq!(
            dims.total_elems() * elem_ty.size_in_bytes(),
            data.len(),
            "raw tensor data length does not match shape {dims:?}"
        );
        Self {
            dims,
            elem_ty,
            data,
        }
    }

    pub fn zeros_of_type(elem_ty: ElemType, dims: Shape) -> Self {
        let len = dims.total_elems() * elem_ty.size_in_bytes();
        Self::from_raw(dims, elem_ty, vec![0u8; len])
    }

    pub fn dims(&self) -> &Shape {
        &self.dims
    }

    pub fn elem_ty(&self) -> ElemType {
        self.elem_ty
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn data<T: ElemTypeExt>(&self) -> &[T] {
        assert_eq!(self.elem_ty, T::elem_ty(), "element type mismatch");
        debug_assert_eq!(self.data.as_ptr() as usize % std::mem::align_of::<T>(), 0);
        unsafe {
            std::slice::from_raw_parts(self.data.as_ptr() as *const T, self.dims.total_elems())
        }
    }

    pub fn data_mut<T: ElemTypeExt>(&mut self) -> &mut [T] {
        assert_eq!(self.elem_ty, T::elem_ty(), "element type mismatch");
        debug_assert_eq!(self.data.as_ptr() as usize % std::mem::align_of::<T>(), 0);
        unsafe {
            std::slice::from_raw_parts_mut(
                self.data.as_mut_ptr() as *mut T,
                self.dims.total_elems(),
            )
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    pub fn into_raw_vec(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor({:?}, {:?}, {} bytes)",
            self.elem_ty,
            self.dims,
            self.data.len()
        )
    }
}
