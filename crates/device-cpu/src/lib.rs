//! Host-memory device backend: a worker pool executing compute functions
//! over buffers keyed by value id. This is the reference `DeviceManager`
//! implementation the runtime's end-to-end tests and examples run on.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use lazuli_core::{
    id::{DeviceId, ValueId},
    tensor::Tensor,
};
use lazuli_runtime::device::{DeviceListener, DeviceManager, DevicePtr, Task};
use log::trace;
use rustc_hash::FxHashMap;
use thiserror::Error;
use threadpool::ThreadPool;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("a device needs at least one worker thread")]
    NoWorkers,
}

/// Configures and builds a `CpuDeviceManager`.
pub struct CpuDeviceBuilder {
    workers: usize,
}

impl CpuDeviceBuilder {
    pub fn new() -> Self {
        Self { workers: 1 }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn build(self) -> Result<Arc<CpuDeviceManager>, DeviceError> {
        if self.workers == 0 {
            return Err(DeviceError::NoWorkers);
        }
        Ok(Arc::new(CpuDeviceManager {
            inner: Arc::new(CpuInner {
                storage: Mutex::new(FxHashMap::default()),
                listener: Mutex::new(None),
                allocated: AtomicU64::new(0),
                freed: AtomicU64::new(0),
            }),
            pool: Mutex::new(ThreadPool::with_name(
                "lazuli-cpu-worker".into(),
                self.workers,
            )),
        }))
    }
}

impl Default for CpuDeviceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// All devices of this manager share one host address space and one worker
/// pool; the device id only tags tasks and storage for accounting.
pub struct CpuDeviceManager {
    inner: Arc<CpuInner>,
    pool: Mutex<ThreadPool>,
}

struct CpuInner {
    storage: Mutex<FxHashMap<ValueId, Arc<Vec<u8>>>>,
    listener: Mutex<Option<Arc<dyn DeviceListener>>>,
    allocated: AtomicU64,
    freed: AtomicU64,
}

impl CpuDeviceManager {
    /// Buffers currently resident.
    pub fn live_buffers(&self) -> usize {
        self.inner.storage.lock().expect("storage poisoned").len()
    }

    /// Output buffers allocated since construction.
    pub fn allocated(&self) -> u64 {
        self.inner.allocated.load(Ordering::SeqCst)
    }

    /// `free_data` calls since construction.
    pub fn freed(&self) -> u64 {
        self.inner.freed.load(Ordering::SeqCst)
    }
}

impl DeviceManager for CpuDeviceManager {
    fn register_listener(&self, listener: Arc<dyn DeviceListener>) {
        let mut slot = self.inner.listener.lock().expect("listener slot poisoned");
        assert!(slot.is_none(), "completion listener already registered");
        *slot = Some(listener);
    }

    fn push_task(&self, device_id: DeviceId, task: Task) {
        trace!("device {device_id} accepted task {}", task.id);
        let inner = self.inner.clone();
        self.pool
            .lock()
            .expect("worker pool poisoned")
            .execute(move || inner.run_task(task));
    }

    fn get_ptr(&self, _device_id: DeviceId, value_id: ValueId) -> DevicePtr {
        let storage = self.inner.storage.lock().expect("storage poisoned");
        DevicePtr(
            storage
                .get(&value_id)
                .unwrap_or_else(|| panic!("no storage for value {value_id}"))
                .clone(),
        )
    }

    fn free_data(&self, value_id: ValueId) {
        let removed = self
            .inner
            .storage
            .lock()
            .expect("storage poisoned")
            .remove(&value_id);
        assert!(removed.is_some(), "double free of value {value_id}");
        self.inner.freed.fetch_add(1, Ordering::SeqCst);
        trace!("freed value {value_id}");
    }
}

impl CpuInner {
    fn run_task(&self, task: Task) {
        trace!("running {} (node {})", task.op.compute_fn.name(), task.id);
        let inputs: Vec<Tensor> = task
            .inputs
            .iter()
            .map(|td| {
                let bytes = self
                    .storage
                    .lock()
                    .expect("storage poisoned")
                    .get(&td.data.value_id)
                    .unwrap_or_else(|| {
                        panic!(
                            "input value {} of task {} not resident",
                            td.data.value_id, task.id
                        )
                    })
                    .clone();
                Tensor::from_raw(td.data.shape.clone(), td.data.elem_ty, bytes.as_ref().clone())
            })
            .collect();
        let mut outputs: Vec<Tensor> = task
            .outputs
            .iter()
            .map(|td| Tensor::zeros_of_type(td.data.elem_ty, td.data.shape.clone()))
            .collect();

        task.op.compute_fn.execute(&inputs, &mut outputs);

        {
            let mut storage = self.storage.lock().expect("storage poisoned");
            for (td, tensor) in task.outputs.iter().zip(outputs) {
                storage.insert(td.data.value_id, Arc::new(tensor.into_raw_vec()));
                self.allocated.fetch_add(1, Ordering::SeqCst);
            }
        }

        let listener = self
            .listener
            .lock()
            .expect("listener slot poisoned")
            .clone()
            .expect("no completion listener registered");
        listener.on_operation_complete(task);
    }
}
