//! Trainable parameters, optimizer state and the global step

use crate::data::dataset::TabularBatch;
use crate::model::{NetSpec, TrainableNet};
use crate::training::metrics::scenario_loss;
use crate::training::optimizer::{create_optimizer, ParameterOptimizer};
use crate::{OptimizerKind, Result, Scenario};
use burn::optim::GradientsParams;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use std::path::Path;

pub const MODEL_FILE: &str = "model.mpk";
pub const OPTIMIZER_FILE: &str = "optimizer.mpk";

pub type ParamRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// The single live copy of the model being trained.
///
/// Evaluation goes through [`ModelState::inference_model`], which shares these
/// parameters.
pub struct ModelState<B: AutodiffBackend, M: TrainableNet<B>> {
    pub model: M,
    optimizer: Box<dyn ParameterOptimizer<M, B>>,
    /// Number of optimizer steps applied so far
    pub global_step: u64,
}

impl<B: AutodiffBackend, M: TrainableNet<B> + 'static> ModelState<B, M> {
    pub fn new(model: M, optimizer: Box<dyn ParameterOptimizer<M, B>>) -> Self {
        ModelState {
            model,
            optimizer,
            global_step: 0,
        }
    }

    /// Freshly initialised parameters and optimizer
    pub fn init(net: &NetSpec, optimizer: OptimizerKind, device: &B::Device) -> Self {
        Self::new(M::init(net, device), create_optimizer(optimizer))
    }

    /// Apply one optimizer step on `batch`, returning the loss before the update
    pub fn step(&mut self, lr: f64, batch: &TabularBatch<B>, scenario: Scenario) -> f64 {
        let logits = self.model.infer(batch.features.clone());
        let loss = scenario_loss(scenario, logits, batch);
        let loss_value: f64 = loss.clone().into_scalar().elem();

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.model);
        self.model = self.optimizer.step(lr, self.model.clone(), grads);
        self.global_step += 1;

        loss_value
    }

    /// Inference-mode view of the current parameters
    pub fn inference_model(&self) -> M::InnerModule {
        self.model.valid()
    }

    /// Write parameters and optimizer state into `dir`
    pub fn save(&self, dir: &Path) -> Result<()> {
        let recorder = ParamRecorder::new();
        self.model
            .clone()
            .save_file(dir.join(MODEL_FILE), &recorder)?;
        self.optimizer.save(&dir.join(OPTIMIZER_FILE))?;
        Ok(())
    }

    /// Replace parameters and optimizer state with the ones saved in `dir`
    pub fn load(self, dir: &Path, global_step: u64, device: &B::Device) -> Result<Self> {
        let recorder = ParamRecorder::new();
        let model = self
            .model
            .load_file(dir.join(MODEL_FILE), &recorder, device)?;
        let optimizer = self.optimizer.load(&dir.join(OPTIMIZER_FILE), device)?;
        Ok(ModelState {
            model,
            optimizer,
            global_step,
        })
    }
}
