//! Wide and deep: the logits of a linear path and a dnn path are summed

use super::dnn::DnnModel;
use super::linear::LinearModel;
use super::{NetSpec, TabularNet};
use crate::ModelKind;
use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

#[derive(Module, Debug)]
pub struct WideAndDeepModel<B: Backend> {
    wide: LinearModel<B>,
    deep: DnnModel<B>,
}

impl<B: Backend> TabularNet<B> for WideAndDeepModel<B> {
    const KIND: ModelKind = ModelKind::WideAndDeep;

    fn init(spec: &NetSpec, device: &B::Device) -> Self {
        WideAndDeepModel {
            wide: LinearModel::init(spec, device),
            deep: DnnModel::init(spec, device),
        }
    }

    fn infer(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let wide = self.wide.infer(features.clone());
        let deep = self.deep.infer(features);
        wide + deep
    }
}
