//! Hidden layer building block shared by the dense variants

use super::NetSpec;
use burn::module::Module;
use burn::nn::{BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Linear → BatchNorm? → ReLU → Dropout?
#[derive(Module, Debug)]
pub struct HiddenBlock<B: Backend> {
    linear: Linear<B>,
    norm: Option<BatchNorm<B, 1>>,
    dropout: Option<Dropout>,
}

impl<B: Backend> HiddenBlock<B> {
    pub fn new(
        device: &B::Device,
        in_dim: usize,
        out_dim: usize,
        batch_norm: Option<f64>,
        dropout: Option<f64>,
    ) -> Self {
        HiddenBlock {
            linear: LinearConfig::new(in_dim, out_dim).init(device),
            norm: batch_norm
                .map(|epsilon| BatchNormConfig::new(out_dim).with_epsilon(epsilon).init(device)),
            dropout: dropout.map(|prob| DropoutConfig::new(prob).init()),
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.linear.forward(x);
        let x = match &self.norm {
            Some(norm) => normalize(norm, x),
            None => x,
        };
        let x = relu(x);
        match &self.dropout {
            Some(dropout) => dropout.forward(x),
            None => x,
        }
    }
}

/// Batch-norm over the feature axis of a `[batch, features]` tensor
pub fn normalize<B: Backend>(norm: &BatchNorm<B, 1>, x: Tensor<B, 2>) -> Tensor<B, 2> {
    let [batch, features] = x.dims();
    norm.forward(x.reshape([batch, features, 1]))
        .reshape([batch, features])
}

/// The hidden stack described by `spec.hidden_units`, returned with its output width
pub fn hidden_stack<B: Backend>(
    spec: &NetSpec,
    device: &B::Device,
) -> (Vec<HiddenBlock<B>>, usize) {
    let mut blocks = Vec::with_capacity(spec.hidden_units.len());
    let mut width = spec.input_units;
    for &units in &spec.hidden_units {
        blocks.push(HiddenBlock::new(
            device,
            width,
            units,
            spec.batch_norm,
            spec.dropout,
        ));
        width = units;
    }
    (blocks, width)
}
