use std::sync::Arc;

use lazuli_core::{id::DeviceId, op::ComputeFn, tensor::Tensor};
use lazuli_device_cpu::CpuDeviceBuilder;
use lazuli_runtime::{DagScheduler, DeviceCtx};

struct Iota;

impl ComputeFn for Iota {
    fn name(&self) -> &str {
        "iota"
    }

    fn execute(&self, _inputs: &[Tensor], outputs: &mut [Tensor]) {
        for (i, v) in outputs[0].data_mut::<f32>().iter_mut().enumerate() {
            *v = i as f32;
        }
    }
}

struct Add;

impl ComputeFn for Add {
    fn name(&self) -> &str {
        "add"
    }

    fn execute(&self, inputs: &[Tensor], outputs: &mut [Tensor]) {
        let (lhs, rhs) = (inputs[0].data::<f32>(), inputs[1].data::<f32>());
        for (o, (a, b)) in outputs[0]
            .data_mut::<f32>()
            .iter_mut()
            .zip(lhs.iter().zip(rhs))
        {
            *o = a + b;
        }
    }
}

fn main() {
    env_logger::init();

    let dm = CpuDeviceBuilder::new()
        .with_workers(2)
        .build()
        .expect("cpu device");
    let sched = DagScheduler::new(dm.clone());
    let ctx = DeviceCtx::new(DeviceId(0));

    let xs = sched.create(&ctx, &[], &[vec![8].into()], Arc::new(Iota));
    let ys = sched.create(&ctx, &[], &[vec![8].into()], Arc::new(Iota));
    let sums = sched.create(&ctx, &[&xs[0], &ys[0]], &[vec![8].into()], Arc::new(Add));
    drop(xs);
    drop(ys);

    sched.wait(&sums[0]);
    let value = sched.get_value(&sums[0]);
    println!("doubled iota: {:?}", value.data::<f32>());
}
