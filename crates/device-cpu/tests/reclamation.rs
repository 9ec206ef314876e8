mod common;

use std::sync::Arc;

use common::{init_logs, Fill, Scale};
use lazuli_core::{id::DeviceId, shape::Shape};
use lazuli_device_cpu::{CpuDeviceBuilder, CpuDeviceManager};
use lazuli_runtime::{DagScheduler, DeviceCtx};

fn setup() -> (Arc<CpuDeviceManager>, DagScheduler, DeviceCtx) {
    init_logs();
    let dm = CpuDeviceBuilder::new().with_workers(2).build().unwrap();
    let sched = DagScheduler::new(dm.clone());
    (dm, sched, DeviceCtx::new(DeviceId(0)))
}

fn shape(n: usize) -> Shape {
    vec![n].into()
}

#[test]
fn held_handle_outlives_consumer_completion() {
    let (dm, sched, ctx) = setup();

    let a = sched.create(&ctx, &[], &[shape(4)], Arc::new(Fill(1.0)));
    let b = sched.create(&ctx, &[&a[0]], &[shape(4)], Arc::new(Scale(2.0)));
    sched.wait_for_all();

    // Both values pinned by handles; nothing reclaimed yet.
    assert_eq!(sched.num_live_nodes(), 2);
    assert_eq!(dm.live_buffers(), 2);
    assert_eq!(dm.freed(), 0);

    // Dropping the handle after the consumer finished reclaims a at once.
    drop(a);
    assert_eq!(dm.freed(), 1);
    assert_eq!(sched.num_live_nodes(), 1);
    assert_eq!(sched.get_value(&b[0]).data::<f32>(), &[2.0; 4]);

    drop(b);
    assert_eq!(dm.live_buffers(), 0);
}

#[test]
fn cloned_handle_keeps_the_value_alive() {
    let (dm, sched, ctx) = setup();

    let out = sched.create(&ctx, &[], &[shape(4)], Arc::new(Fill(7.0)));
    let alias = out[0].clone();
    sched.wait_for_all();

    drop(out);
    assert_eq!(dm.freed(), 0);
    assert_eq!(sched.get_value(&alias).data::<f32>(), &[7.0; 4]);

    drop(alias);
    assert_eq!(dm.freed(), 1);
    assert_eq!(sched.num_live_nodes(), 0);
}

#[test]
fn intermediates_are_freed_eagerly() {
    let (dm, sched, ctx) = setup();

    let mut tail = sched.create(&ctx, &[], &[shape(16)], Arc::new(Fill(1.0)));
    for _ in 0..4 {
        tail = sched.create(&ctx, &[&tail[0]], &[shape(16)], Arc::new(Scale(2.0)));
    }
    sched.wait_for_all();

    // Only the tail survives out of five produced values.
    assert_eq!(dm.allocated(), 5);
    assert_eq!(dm.freed(), 4);
    assert_eq!(dm.live_buffers(), 1);
    assert_eq!(sched.num_live_nodes(), 1);
    assert_eq!(sched.get_value(&tail[0]).data::<f32>(), &[16.0; 16]);

    drop(tail);
    assert_eq!(dm.freed(), 5);
    assert_eq!(dm.live_buffers(), 0);
}

#[test]
fn unheld_results_vanish_without_consumers() {
    let (dm, sched, ctx) = setup();

    let out = sched.create(&ctx, &[], &[shape(4)], Arc::new(Fill(0.0)));
    drop(out);
    sched.wait_for_all();

    // Generated but never consumed nor held: reclaimed at completion.
    assert_eq!(sched.num_live_nodes(), 0);
    assert_eq!(dm.live_buffers(), 0);
    assert_eq!(dm.freed(), 1);
}
