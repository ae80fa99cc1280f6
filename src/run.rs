//! Entry point tying configuration to a concrete model and mode

use crate::model::{
    ConvolutionalModel, CustomModel, DnnModel, LinearModel, NetSpec, TabularNet, TrainableNet,
    WideAndDeepModel,
};
use crate::predict::export::ModelExporter;
use crate::predict::inference::{InferenceResult, InferenceRunner};
use crate::training::checkpoint::{CheckpointInfo, CheckpointManager, RestoreTarget};
use crate::training::metrics::CsvMetricsSink;
use crate::training::trainer::{train, TrainReport};
use crate::{HarnessError, Mode, ModelKind, Result, RunConfig};
use burn::tensor::backend::{AutodiffBackend, Backend};
use std::path::PathBuf;

/// What a run produced, per mode
#[derive(Debug)]
pub enum RunOutcome {
    Trained(TrainReport),
    Exported(PathBuf),
    Inferred(InferenceResult),
}

/// Validate `config`, then execute its mode with the configured model kind
pub fn run<B: AutodiffBackend>(config: &RunConfig, device: &B::Device) -> Result<RunOutcome> {
    config.validate()?;
    log::info!("Running {} with flags:\n{}", config.mode, config.to_toml()?);

    match config.model.kind {
        ModelKind::Dnn => run_with::<B, DnnModel<B>>(config, device),
        ModelKind::Linear => run_with::<B, LinearModel<B>>(config, device),
        ModelKind::WideAndDeep => run_with::<B, WideAndDeepModel<B>>(config, device),
        ModelKind::Custom => run_with::<B, CustomModel<B>>(config, device),
        ModelKind::Convolutional => run_with::<B, ConvolutionalModel<B>>(config, device),
    }
}

fn run_with<B, M>(config: &RunConfig, device: &B::Device) -> Result<RunOutcome>
where
    B: AutodiffBackend,
    M: TrainableNet<B> + 'static,
{
    match config.mode {
        Mode::Train => {
            let mut sink = CsvMetricsSink::new(&config.paths.output_path)?;
            let report = train::<B, M>(config, device, &mut sink)?;
            Ok(RunOutcome::Trained(report))
        }
        Mode::Export => {
            let path = export_latest::<B::InnerBackend, M::InnerModule>(config, device)?;
            Ok(RunOutcome::Exported(path))
        }
        Mode::Infer => {
            let result = InferenceRunner::new(config)
                .run::<B::InnerBackend, M::InnerModule>(&RestoreTarget::Latest, device)?;
            Ok(RunOutcome::Inferred(result))
        }
    }
}

/// Export the newest checkpoint as `model_version`. An existing version is
/// an error here, unlike the export at the end of training.
pub fn export_latest<B: Backend, M: TabularNet<B>>(
    config: &RunConfig,
    device: &B::Device,
) -> Result<PathBuf> {
    let net = NetSpec::from_config(config);
    let checkpoints = CheckpointManager::new(&config.paths.checkpoint_path);
    let (model, info) = checkpoints
        .restore_model::<B, M>(&RestoreTarget::Latest, &net, device)?
        .ok_or_else(|| HarnessError::CheckpointMissing(checkpoints.dir().display().to_string()))?;

    log::info!("Exporting checkpoint at step {}", info.step);
    ModelExporter::new(&config.paths.model_path).export::<B, M>(
        config.paths.model_version,
        &model,
        &net,
    )
}

/// Checkpoints and export target known to a configuration
#[derive(Debug, Clone)]
pub struct Inventory {
    pub checkpoints: Vec<CheckpointInfo>,
    pub export_target: PathBuf,
    pub export_exists: bool,
}

pub fn inventory(config: &RunConfig) -> Result<Inventory> {
    let checkpoints = CheckpointManager::new(&config.paths.checkpoint_path).list()?;
    let export_target = ModelExporter::new(&config.paths.model_path)
        .version_dir(config.paths.model_version);
    let export_exists = export_target.exists();

    Ok(Inventory {
        checkpoints,
        export_target,
        export_exists,
    })
}
