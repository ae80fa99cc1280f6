//! 1d convolutional network over the feature vector
//!
//! Features are read as a single-channel sequence of length `input_units`.
//! Two same-padded convolutions keep the length, the result is flattened into
//! a linear head.

use super::{NetSpec, TabularNet};
use crate::ModelKind;
use burn::module::Module;
use burn::nn::conv::{Conv1d, Conv1dConfig};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig1d};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

const KERNEL_SIZE: usize = 3;
const FIRST_CHANNELS: usize = 8;
const SECOND_CHANNELS: usize = 16;

#[derive(Module, Debug)]
pub struct ConvolutionalModel<B: Backend> {
    conv1: Conv1d<B>,
    conv2: Conv1d<B>,
    dropout: Option<Dropout>,
    output: Linear<B>,
}

impl<B: Backend> TabularNet<B> for ConvolutionalModel<B> {
    const KIND: ModelKind = ModelKind::Convolutional;

    fn init(spec: &NetSpec, device: &B::Device) -> Self {
        ConvolutionalModel {
            conv1: Conv1dConfig::new(1, FIRST_CHANNELS, KERNEL_SIZE)
                .with_padding(PaddingConfig1d::Same)
                .init(device),
            conv2: Conv1dConfig::new(FIRST_CHANNELS, SECOND_CHANNELS, KERNEL_SIZE)
                .with_padding(PaddingConfig1d::Same)
                .init(device),
            dropout: spec.dropout.map(|prob| DropoutConfig::new(prob).init()),
            output: LinearConfig::new(SECOND_CHANNELS * spec.input_units, spec.output_units)
                .init(device),
        }
    }

    fn infer(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let [batch, length] = features.dims();
        let x = features.reshape([batch, 1, length]);
        let x = relu(self.conv1.forward(x));
        let x = relu(self.conv2.forward(x));
        let x = x.reshape([batch, SECOND_CHANNELS * length]);
        let x = match &self.dropout {
            Some(dropout) => dropout.forward(x),
            None => x,
        };
        self.output.forward(x)
    }
}
