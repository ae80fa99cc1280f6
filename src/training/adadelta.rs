//! Adadelta optimizer
//!
//! ```text
//! accum        = rho * accum + (1 - rho) * g^2
//! update       = sqrt(accum_update + eps) / sqrt(accum + eps) * g
//! accum_update = rho * accum_update + (1 - rho) * update^2
//! param        = param - lr * update
//! ```

use burn::optim::SimpleOptimizer;
use burn::record::Record;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use burn::LearningRate;

#[derive(Debug, Clone, Copy)]
pub struct Adadelta {
    rho: f32,
    epsilon: f32,
}

impl Adadelta {
    pub fn new(rho: f32, epsilon: f32) -> Self {
        Adadelta { rho, epsilon }
    }
}

impl Default for Adadelta {
    fn default() -> Self {
        Adadelta::new(0.95, 1e-8)
    }
}

/// Running averages of squared gradients and squared updates
#[derive(Record, Clone)]
pub struct AdadeltaState<B: Backend, const D: usize> {
    pub accumulator: Tensor<B, D>,
    pub update_accumulator: Tensor<B, D>,
}

impl<B: Backend> SimpleOptimizer<B> for Adadelta {
    type State<const D: usize> = AdadeltaState<B, D>;

    fn step<const D: usize>(
        &self,
        lr: LearningRate,
        tensor: Tensor<B, D>,
        grad: Tensor<B, D>,
        state: Option<Self::State<D>>,
    ) -> (Tensor<B, D>, Option<Self::State<D>>) {
        let (accumulator, update_accumulator) = match state {
            Some(state) => (state.accumulator, state.update_accumulator),
            None => (grad.zeros_like(), grad.zeros_like()),
        };

        let accumulator = accumulator.mul_scalar(self.rho)
            + grad.clone().powf_scalar(2.0).mul_scalar(1.0 - self.rho);
        let update = update_accumulator
            .clone()
            .add_scalar(self.epsilon)
            .sqrt()
            .div(accumulator.clone().add_scalar(self.epsilon).sqrt())
            .mul(grad);
        let update_accumulator = update_accumulator.mul_scalar(self.rho)
            + update.clone().powf_scalar(2.0).mul_scalar(1.0 - self.rho);

        let tensor = tensor - update.mul_scalar(lr);
        (
            tensor,
            Some(AdadeltaState {
                accumulator,
                update_accumulator,
            }),
        )
    }

    fn to_device<const D: usize>(state: Self::State<D>, device: &B::Device) -> Self::State<D> {
        AdadeltaState {
            accumulator: state.accumulator.to_device(device),
            update_accumulator: state.update_accumulator.to_device(device),
        }
    }
}
