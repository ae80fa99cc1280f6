//! FTRL-Proximal optimizer
//!
//! Per-coordinate learning rates with optional L1/L2 penalties:
//!
//! ```text
//! accum_new = accum + g^2
//! sigma     = (accum_new^-p - accum^-p) / lr
//! linear    = linear + g - sigma * param
//! quadratic = accum_new^-p / lr + 2 * l2
//! param     = |linear| > l1 ? (sign(linear) * l1 - linear) / quadratic : 0
//! ```
//!
//! where `p` is the (negative) learning-rate power.

use burn::optim::SimpleOptimizer;
use burn::record::Record;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use burn::LearningRate;

#[derive(Debug, Clone, Copy)]
pub struct Ftrl {
    pub learning_rate_power: f32,
    pub initial_accumulator: f32,
    pub l1: f32,
    pub l2: f32,
}

impl Default for Ftrl {
    fn default() -> Self {
        Ftrl {
            learning_rate_power: -0.5,
            initial_accumulator: 0.1,
            l1: 0.0,
            l2: 0.0,
        }
    }
}

#[derive(Record, Clone)]
pub struct FtrlState<B: Backend, const D: usize> {
    pub accumulator: Tensor<B, D>,
    pub linear: Tensor<B, D>,
}

impl<B: Backend> SimpleOptimizer<B> for Ftrl {
    type State<const D: usize> = FtrlState<B, D>;

    fn step<const D: usize>(
        &self,
        lr: LearningRate,
        tensor: Tensor<B, D>,
        grad: Tensor<B, D>,
        state: Option<Self::State<D>>,
    ) -> (Tensor<B, D>, Option<Self::State<D>>) {
        let lr = lr as f32;
        let (accumulator, linear) = match state {
            Some(state) => (state.accumulator, state.linear),
            None => (
                grad.ones_like().mul_scalar(self.initial_accumulator),
                grad.zeros_like(),
            ),
        };

        let power = -self.learning_rate_power;
        let accumulator_new = accumulator.clone() + grad.clone().powf_scalar(2.0);
        let scaled_new = accumulator_new.clone().powf_scalar(power);
        let sigma = (scaled_new.clone() - accumulator.powf_scalar(power)).div_scalar(lr);
        let linear = linear + grad - sigma * tensor;

        let quadratic = scaled_new.div_scalar(lr).add_scalar(2.0 * self.l2);
        let active = linear.clone().abs().greater_elem(self.l1);
        let tensor = (linear.clone().sign().mul_scalar(self.l1) - linear.clone())
            .div(quadratic)
            .mask_fill(active.bool_not(), 0.0);

        (
            tensor,
            Some(FtrlState {
                accumulator: accumulator_new,
                linear,
            }),
        )
    }

    fn to_device<const D: usize>(state: Self::State<D>, device: &B::Device) -> Self::State<D> {
        FtrlState {
            accumulator: state.accumulator.to_device(device),
            linear: state.linear.to_device(device),
        }
    }
}
