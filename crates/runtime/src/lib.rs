//! Execution core of the lazuli deferred-evaluation runtime: the physical
//! DAG, its reference-counted reclamation of intermediate values, and the
//! dispatcher that moves ready operations onto devices.

pub mod chunk;
pub mod dag;
pub mod device;
pub mod lock;
pub mod queue;
pub mod rtinfo;
pub mod scheduler;

pub use chunk::DagChunk;
pub use device::{DeviceListener, DeviceManager, DevicePtr, Task, TaskData};
pub use scheduler::{DagScheduler, DeviceCtx};
