//! Model architectures
//!
//! Every variant maps a `[batch, input_units]` feature tensor to
//! `[batch, output_units]` logits:
//! - dnn: stack of hidden blocks followed by a linear head
//! - linear: a single affine layer
//! - wide_and_deep: sum of a linear and a dnn path
//! - custom: residual GELU blocks
//! - convolutional: 1d convolutions over the feature vector
//!
//! The training/inference switch is the backend: an autodiff model runs in
//! training mode, its `valid()` counterpart in inference mode with the same
//! parameters.

pub mod block;
pub mod cnn;
pub mod custom;
pub mod dnn;
pub mod linear;
pub mod wide_deep;

pub use cnn::ConvolutionalModel;
pub use custom::CustomModel;
pub use dnn::DnnModel;
pub use linear::LinearModel;
pub use wide_deep::WideAndDeepModel;

use crate::{ModelKind, RunConfig};
use burn::module::{AutodiffModule, Module};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Architecture description, enough to rebuild a model before loading weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetSpec {
    pub kind: ModelKind,
    pub input_units: usize,
    pub output_units: usize,
    pub hidden_units: Vec<usize>,
    /// Batch-norm epsilon when normalisation is enabled
    pub batch_norm: Option<f64>,
    /// Drop probability when dropout is enabled
    pub dropout: Option<f64>,
}

impl NetSpec {
    pub fn from_config(config: &RunConfig) -> Self {
        let model = &config.model;
        let dropout = if model.enable_dropout && model.dropout_keep_prob < 1.0 {
            Some(1.0 - model.dropout_keep_prob)
        } else {
            None
        };

        NetSpec {
            kind: model.kind,
            input_units: config.data.feature_size,
            output_units: config.data.label_size,
            hidden_units: model.dnn_struct.clone(),
            batch_norm: model.enable_bn.then_some(model.bn_epsilon),
            dropout,
        }
    }
}

/// A model variant that can be built from a [`NetSpec`] and scored
pub trait TabularNet<B: Backend>: Module<B> + Sized {
    const KIND: ModelKind;

    fn init(spec: &NetSpec, device: &B::Device) -> Self;

    /// Logits for a `[batch, input_units]` feature tensor
    fn infer(&self, features: Tensor<B, 2>) -> Tensor<B, 2>;
}

/// A trainable model whose inference-mode twin is also a [`TabularNet`]
pub trait TrainableNet<B: AutodiffBackend>:
    TabularNet<B> + AutodiffModule<B, InnerModule: TabularNet<B::InnerBackend>>
{
}

impl<B, M> TrainableNet<B> for M
where
    B: AutodiffBackend,
    M: TabularNet<B> + AutodiffModule<B>,
    M::InnerModule: TabularNet<B::InnerBackend>,
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;
    type TrainBackend = Autodiff<TestBackend>;

    fn spec(kind: ModelKind) -> NetSpec {
        NetSpec {
            kind,
            input_units: 9,
            output_units: 2,
            hidden_units: vec![16, 8],
            batch_norm: Some(0.001),
            dropout: Some(0.5),
        }
    }

    fn assert_logit_shape<M: TabularNet<TestBackend>>() {
        let device = Default::default();
        let model = M::init(&spec(M::KIND), &device);
        let features = Tensor::random([5, 9], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(model.infer(features).dims(), [5, 2]);
    }

    #[test]
    fn test_every_variant_produces_logits() {
        assert_logit_shape::<DnnModel<TestBackend>>();
        assert_logit_shape::<LinearModel<TestBackend>>();
        assert_logit_shape::<WideAndDeepModel<TestBackend>>();
        assert_logit_shape::<CustomModel<TestBackend>>();
        assert_logit_shape::<ConvolutionalModel<TestBackend>>();
    }

    #[test]
    fn test_valid_model_is_deterministic() {
        let device = Default::default();
        let model = DnnModel::<TrainBackend>::init(&spec(ModelKind::Dnn), &device);
        let inference = model.valid();

        let features: Tensor<TestBackend, 2> =
            Tensor::random([4, 9], Distribution::Normal(0.0, 1.0), &device);
        let a = inference.infer(features.clone()).into_data().to_vec::<f32>().unwrap();
        let b = inference.infer(features).into_data().to_vec::<f32>().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_spec_from_config() {
        let mut config = RunConfig::default();
        config.model.enable_dropout = true;
        config.model.dropout_keep_prob = 0.8;
        let spec = NetSpec::from_config(&config);

        assert_eq!(spec.input_units, 9);
        assert_eq!(spec.output_units, 2);
        assert_eq!(spec.hidden_units, vec![128, 32, 8]);
        assert_eq!(spec.batch_norm, None);
        assert!((spec.dropout.unwrap() - 0.2).abs() < 1e-9);
    }
}
