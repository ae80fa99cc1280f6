//! Residual network with GELU activations
//!
//! Each block adds its input back onto its output, through a learned
//! projection when the widths differ.

use super::block::normalize;
use super::{NetSpec, TabularNet};
use crate::ModelKind;
use burn::module::Module;
use burn::nn::{BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig};
use burn::tensor::activation::gelu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    linear: Linear<B>,
    norm: Option<BatchNorm<B, 1>>,
    dropout: Option<Dropout>,
    skip: Option<Linear<B>>,
}

impl<B: Backend> ResidualBlock<B> {
    fn new(device: &B::Device, in_dim: usize, out_dim: usize, spec: &NetSpec) -> Self {
        let skip = (in_dim != out_dim)
            .then(|| LinearConfig::new(in_dim, out_dim).with_bias(false).init(device));
        ResidualBlock {
            linear: LinearConfig::new(in_dim, out_dim).init(device),
            norm: spec
                .batch_norm
                .map(|epsilon| BatchNormConfig::new(out_dim).with_epsilon(epsilon).init(device)),
            dropout: spec.dropout.map(|prob| DropoutConfig::new(prob).init()),
            skip,
        }
    }

    fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let h = self.linear.forward(x.clone());
        let h = match &self.norm {
            Some(norm) => normalize(norm, h),
            None => h,
        };
        let h = gelu(h);
        let h = match &self.dropout {
            Some(dropout) => dropout.forward(h),
            None => h,
        };
        let residual = match &self.skip {
            Some(skip) => skip.forward(x),
            None => x,
        };
        h + residual
    }
}

#[derive(Module, Debug)]
pub struct CustomModel<B: Backend> {
    blocks: Vec<ResidualBlock<B>>,
    output: Linear<B>,
}

impl<B: Backend> TabularNet<B> for CustomModel<B> {
    const KIND: ModelKind = ModelKind::Custom;

    fn init(spec: &NetSpec, device: &B::Device) -> Self {
        let mut blocks = Vec::with_capacity(spec.hidden_units.len());
        let mut width = spec.input_units;
        for &units in &spec.hidden_units {
            blocks.push(ResidualBlock::new(device, width, units, spec));
            width = units;
        }

        CustomModel {
            blocks,
            output: LinearConfig::new(width, spec.output_units).init(device),
        }
    }

    fn infer(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.blocks.iter().fold(features, |x, block| block.forward(x));
        self.output.forward(x)
    }
}
