//! Fully connected network: hidden blocks then a linear head

use super::block::{hidden_stack, HiddenBlock};
use super::{NetSpec, TabularNet};
use crate::ModelKind;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

#[derive(Module, Debug)]
pub struct DnnModel<B: Backend> {
    hidden: Vec<HiddenBlock<B>>,
    output: Linear<B>,
}

impl<B: Backend> DnnModel<B> {
    /// Hidden representation before the output layer
    pub fn features(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.hidden.iter().fold(x, |x, block| block.forward(x))
    }
}

impl<B: Backend> TabularNet<B> for DnnModel<B> {
    const KIND: ModelKind = ModelKind::Dnn;

    fn init(spec: &NetSpec, device: &B::Device) -> Self {
        let (hidden, width) = hidden_stack(spec, device);
        DnnModel {
            hidden,
            output: LinearConfig::new(width, spec.output_units).init(device),
        }
    }

    fn infer(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        self.output.forward(self.features(features))
    }
}
