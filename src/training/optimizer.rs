//! Optimizer selection and learning-rate schedule
//!
//! Each configured optimizer is boxed behind [`ParameterOptimizer`], which
//! also knows how to persist and restore its own state.

use crate::training::adadelta::Adadelta;
use crate::training::ftrl::Ftrl;
use crate::{OptimizerConfig, OptimizerKind, Result};
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{
    AdaGradConfig, AdamConfig, GradientsParams, Optimizer, RmsPropConfig, SgdConfig,
};
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use std::path::Path;

/// Steps between two staircase decays of the learning rate
pub const DECAY_STEPS: u64 = 100_000;

type StateRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Object-safe view of a burn optimizer over model `M`
pub trait ParameterOptimizer<M, B>: Send
where
    M: AutodiffModule<B>,
    B: AutodiffBackend,
{
    fn step(&mut self, lr: f64, model: M, grads: GradientsParams) -> M;

    /// Write the optimizer state (moments, accumulators) to `path`
    fn save(&self, path: &Path) -> Result<()>;

    fn load(
        self: Box<Self>,
        path: &Path,
        device: &B::Device,
    ) -> Result<Box<dyn ParameterOptimizer<M, B>>>;
}

impl<M, B, O> ParameterOptimizer<M, B> for O
where
    M: AutodiffModule<B> + 'static,
    B: AutodiffBackend,
    O: Optimizer<M, B> + 'static,
{
    fn step(&mut self, lr: f64, model: M, grads: GradientsParams) -> M {
        Optimizer::step(self, lr, model, grads)
    }

    fn save(&self, path: &Path) -> Result<()> {
        let recorder = StateRecorder::new();
        <StateRecorder as Recorder<B>>::record(&recorder, self.to_record(), path.to_path_buf())?;
        Ok(())
    }

    fn load(
        self: Box<Self>,
        path: &Path,
        device: &B::Device,
    ) -> Result<Box<dyn ParameterOptimizer<M, B>>> {
        let recorder = StateRecorder::new();
        let record = <StateRecorder as Recorder<B>>::load(&recorder, path.to_path_buf(), device)?;
        Ok(Box::new((*self).load_record(record)))
    }
}

fn boxed<M, B, O>(optimizer: O) -> Box<dyn ParameterOptimizer<M, B>>
where
    M: AutodiffModule<B> + 'static,
    B: AutodiffBackend,
    O: Optimizer<M, B> + 'static,
{
    Box::new(optimizer)
}

/// Build the optimizer named by `kind`
pub fn create_optimizer<M, B>(kind: OptimizerKind) -> Box<dyn ParameterOptimizer<M, B>>
where
    M: AutodiffModule<B> + 'static,
    B: AutodiffBackend,
{
    log::debug!("Creating {} optimizer", kind);
    match kind {
        OptimizerKind::Sgd => boxed(SgdConfig::new().init::<B, M>()),
        OptimizerKind::Adadelta => {
            boxed(OptimizerAdaptor::<Adadelta, M, B>::from(Adadelta::default()))
        }
        OptimizerKind::Adagrad => boxed(AdaGradConfig::new().init::<B, M>()),
        OptimizerKind::Adam => boxed(AdamConfig::new().with_epsilon(1e-8).init::<B, M>()),
        OptimizerKind::Ftrl => boxed(OptimizerAdaptor::<Ftrl, M, B>::from(Ftrl::default())),
        OptimizerKind::Rmsprop => boxed(
            RmsPropConfig::new()
                .with_alpha(0.9)
                .with_epsilon(1e-10)
                .init::<B, M>(),
        ),
    }
}

/// Base learning rate, optionally decayed by `rate^floor(step / DECAY_STEPS)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearningRateSchedule {
    base: f64,
    decay_rate: Option<f64>,
}

impl LearningRateSchedule {
    pub fn constant(base: f64) -> Self {
        LearningRateSchedule {
            base,
            decay_rate: None,
        }
    }

    pub fn staircase(base: f64, decay_rate: f64) -> Self {
        LearningRateSchedule {
            base,
            decay_rate: Some(decay_rate),
        }
    }

    pub fn from_config(config: &OptimizerConfig) -> Self {
        if config.enable_lr_decay {
            Self::staircase(config.learning_rate, config.lr_decay_rate)
        } else {
            Self::constant(config.learning_rate)
        }
    }

    pub fn at(&self, step: u64) -> f64 {
        match self.decay_rate {
            Some(rate) => self.base * rate.powi((step / DECAY_STEPS) as i32),
            None => self.base,
        }
    }
}
