#![allow(dead_code)]

use std::{thread, time::Duration};

use lazuli_core::{
    op::ComputeFn,
    tensor::Tensor,
};

/// Fills every output with a constant.
pub struct Fill(pub f32);

impl ComputeFn for Fill {
    fn name(&self) -> &str {
        "fill"
    }

    fn execute(&self, _inputs: &[Tensor], outputs: &mut [Tensor]) {
        for out in outputs.iter_mut() {
            out.data_mut::<f32>().fill(self.0);
        }
    }
}

/// Fills output `i` with the `i`-th constant.
pub struct FillMany(pub Vec<f32>);

impl ComputeFn for FillMany {
    fn name(&self) -> &str {
        "fill_many"
    }

    fn execute(&self, _inputs: &[Tensor], outputs: &mut [Tensor]) {
        assert_eq!(outputs.len(), self.0.len());
        for (out, &v) in outputs.iter_mut().zip(self.0.iter()) {
            out.data_mut::<f32>().fill(v);
        }
    }
}

/// Elementwise sum of two equally shaped inputs.
pub struct Add;

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

/// Multiplies its single input by a constant.
pub struct Scale(pub f32);

impl ComputeFn for Scale {
    fn name(&self) -> &str {
        "scale"
    }

    fn execute(&self, inputs: &[Tensor], outputs: &mut [Tensor]) {
        for (o, a) in outputs[0]
            .data_mut::<f32>()
            .iter_mut()
            .zip(inputs[0].data::<f32>())
        {
            *o = a * self.0;
        }
    }
}

/// Fills every output with the sum over all input elements plus one, so it
/// works for any arity including zero.
pub struct SumAll;

impl ComputeFn for SumAll {
    fn name(&self) -> &str {
        "sum_all"
    }

    fn execute(&self, inputs: &[Tensor], outputs: &mut [Tensor]) {
        let total: f32 = inputs
            .iter()
            .map(|t| t.data::<f32>().iter().sum::<f32>())
            .sum();
        for out in outputs.iter_mut() {
            out.data_mut::<f32>().fill(total + 1.0);
        }
    }
}

/// `Fill` with an artificial delay, for pinning down "not yet complete"
/// observations.
pub struct SlowFill(pub f32, pub Duration);

impl ComputeFn for SlowFill {
    fn name(&self) -> &str {
        "slow_fill"
    }

    fn execute(&self, _inputs: &[Tensor], outputs: &mut [Tensor]) {
        thread::sleep(self.1);
        for out in outputs.iter_mut() {
            out.data_mut::<f32>().fill(self.0);
        }
    }
}

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}
