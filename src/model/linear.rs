//! Logistic/linear regression: one affine layer

use super::{NetSpec, TabularNet};
use crate::ModelKind;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

#[derive(Module, Debug)]
pub struct LinearModel<B: Backend> {
    layer: Linear<B>,
}

impl<B: Backend> TabularNet<B> for LinearModel<B> {
    const KIND: ModelKind = ModelKind::Linear;

    fn init(spec: &NetSpec, device: &B::Device) -> Self {
        LinearModel {
            layer: LinearConfig::new(spec.input_units, spec.output_units).init(device),
        }
    }

    fn infer(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        self.layer.forward(features)
    }
}
