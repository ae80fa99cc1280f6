//! The training loop
//!
//! ```text
//! Init ─► Resuming? ─► Stepping ⇄ Validating
//!                         │
//!                         ▼
//!                     Exporting ─► Terminated
//! ```
//!
//! Validation and checkpointing happen exactly when the global step is a
//! multiple of `steps_to_validate`. Exhausting the training stream ends the
//! loop; benchmark runs skip validation, checkpoints and export.

use crate::data::dataset::{DatasetPipeline, DatasetStream, TabularBatch, TabularBatcher};
use crate::data::Record;
use crate::model::{NetSpec, TrainableNet};
use crate::predict::export::ModelExporter;
use crate::training::checkpoint::{CheckpointManager, RestoreTarget};
use crate::training::metrics::{evaluate, MetricSample, MetricsSink, SplitMetrics};
use crate::training::optimizer::LearningRateSchedule;
use crate::training::state::ModelState;
use crate::{HarnessError, Result, RunConfig};
use burn::data::dataloader::batcher::Batcher;
use burn::tensor::backend::AutodiffBackend;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Resuming,
    Stepping,
    Validating,
    Exporting,
    Terminated,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::Resuming => "resuming",
            Phase::Stepping => "stepping",
            Phase::Validating => "validating",
            Phase::Exporting => "exporting",
            Phase::Terminated => "terminated",
        };
        write!(f, "{}", name)
    }
}

/// What a finished training run produced
#[derive(Debug, Clone, Default)]
pub struct TrainReport {
    /// Global step at termination, including restored steps
    pub global_step: u64,
    /// Steps executed by this run
    pub steps: u64,
    /// Step the run resumed from, if any
    pub resumed_from: Option<u64>,
    pub samples: Vec<MetricSample>,
    pub checkpoints: Vec<PathBuf>,
    pub export: Option<PathBuf>,
    pub elapsed: Duration,
}

pub struct Trainer<'a, B: AutodiffBackend, M: TrainableNet<B>> {
    config: &'a RunConfig,
    device: B::Device,
    net: NetSpec,
    state: ModelState<B, M>,
    checkpoints: CheckpointManager,
    schedule: LearningRateSchedule,
    batcher: TabularBatcher,
    sink: &'a mut dyn MetricsSink,
    train_stream: Option<DatasetStream>,
    validation_stream: Option<DatasetStream>,
    /// Records of the most recent step, scored again at validation time
    last_records: Vec<Record>,
    last_learning_rate: f64,
    /// First validation batch, pulled at init to prove the source is not empty
    pending_validation: Option<Vec<Record>>,
    last_event: Instant,
    report: TrainReport,
}

impl<'a, B, M> Trainer<'a, B, M>
where
    B: AutodiffBackend,
    M: TrainableNet<B> + 'static,
{
    pub fn new(config: &'a RunConfig, device: B::Device, sink: &'a mut dyn MetricsSink) -> Self {
        let net = NetSpec::from_config(config);
        let state = ModelState::init(&net, config.optimizer.kind, &device);

        Trainer {
            config,
            device,
            net,
            state,
            checkpoints: CheckpointManager::new(&config.paths.checkpoint_path),
            schedule: LearningRateSchedule::from_config(&config.optimizer),
            batcher: TabularBatcher::new(config.data.feature_size),
            sink,
            train_stream: None,
            validation_stream: None,
            last_records: Vec::new(),
            last_learning_rate: config.optimizer.learning_rate,
            pending_validation: None,
            last_event: Instant::now(),
            report: TrainReport::default(),
        }
    }

    /// Drive the loop from `Init` to `Terminated`
    pub fn run(mut self) -> Result<TrainReport> {
        let started = Instant::now();
        let mut phase = Phase::Init;

        while phase != Phase::Terminated {
            log::trace!("Phase: {}", phase);
            phase = match phase {
                Phase::Init => self.init()?,
                Phase::Resuming => {
                    self = self.resume()?;
                    Phase::Stepping
                }
                Phase::Stepping => self.step()?,
                Phase::Validating => self.validate()?,
                Phase::Exporting => self.export()?,
                Phase::Terminated => Phase::Terminated,
            };
        }

        self.report.global_step = self.state.global_step;
        self.report.elapsed = started.elapsed();
        log::info!(
            "Training finished at step {} ({} steps in {:.2}s)",
            self.report.global_step,
            self.report.steps,
            self.report.elapsed.as_secs_f64()
        );
        Ok(self.report)
    }

    fn init(&mut self) -> Result<Phase> {
        let config = self.config;
        let train = DatasetPipeline::from_config(
            config,
            config.training.train_batch_size,
            config.epochs(),
        );
        self.train_stream = Some(train.build(&config.data.train_file)?);

        if !config.enable_benchmark {
            // Validation repeats so it never runs dry before training does
            let validation =
                DatasetPipeline::from_config(config, config.training.validation_batch_size, None);
            let mut stream = validation.build(&config.data.validation_file)?;
            let first = stream
                .next_batch()?
                .ok_or_else(|| HarnessError::StreamInitialization {
                    path: config.data.validation_file.clone(),
                    message: "validation data is empty".to_string(),
                })?;
            self.pending_validation = Some(first);
            self.validation_stream = Some(stream);
        }

        log::info!(
            "Training {} model with {} (lr {}), batch size {}, epochs {}",
            self.net.kind,
            config.optimizer.kind,
            config.optimizer.learning_rate,
            config.training.train_batch_size,
            config
                .epochs()
                .map_or_else(|| "unbounded".to_string(), |n| n.to_string())
        );

        Ok(if config.resume_from_checkpoint {
            Phase::Resuming
        } else {
            Phase::Stepping
        })
    }

    fn resume(mut self) -> Result<Self> {
        let (state, info) = self.checkpoints.restore(
            &RestoreTarget::Latest,
            self.state,
            &self.net,
            self.config.optimizer.kind,
            &self.device,
        )?;
        self.state = state;

        match info {
            Some(info) => {
                log::info!("Continue training from step {}", info.step);
                self.report.resumed_from = Some(info.step);
            }
            None => log::info!(
                "No checkpoint in {}, training from scratch",
                self.checkpoints.dir().display()
            ),
        }
        self.last_event = Instant::now();
        Ok(self)
    }

    fn step(&mut self) -> Result<Phase> {
        let stream = self
            .train_stream
            .as_mut()
            .ok_or_else(|| HarnessError::Configuration("training stream not built".into()))?;

        let Some(records) = stream.next_batch()? else {
            log::info!("Training data exhausted at step {}", self.state.global_step);
            return Ok(if self.config.enable_benchmark {
                Phase::Terminated
            } else {
                Phase::Exporting
            });
        };

        let batch: TabularBatch<B> = self.batcher.batch(records.clone(), &self.device);
        let lr = self.schedule.at(self.state.global_step);
        let loss = self.state.step(lr, &batch, self.config.scenario);
        self.last_records = records;
        self.last_learning_rate = lr;
        self.report.steps += 1;

        let step = self.state.global_step;
        if self.config.enable_benchmark {
            log::debug!("Step: {}, loss: {:.6}", step, loss);
            return Ok(Phase::Stepping);
        }

        if step % self.config.training.steps_to_validate == 0 {
            Ok(Phase::Validating)
        } else {
            Ok(Phase::Stepping)
        }
    }

    fn validate(&mut self) -> Result<Phase> {
        let scenario = self.config.scenario;
        let label_size = self.config.data.label_size;
        let model = self.state.inference_model();

        let train_batch: TabularBatch<B::InnerBackend> =
            self.batcher.batch(self.last_records.clone(), &self.device);
        let train = evaluate(&model, &train_batch, scenario, label_size)?;

        let validation = match self.validation_stream.as_mut() {
            Some(stream) => {
                let records = match self.pending_validation.take() {
                    Some(records) => Some(records),
                    None => stream.next_batch()?,
                };
                match records {
                    Some(records) => {
                        let batch: TabularBatch<B::InnerBackend> =
                            self.batcher.batch(records, &self.device);
                        evaluate(&model, &batch, scenario, label_size)?
                    }
                    None => {
                        return Err(HarnessError::StreamInitialization {
                            path: self.config.data.validation_file.clone(),
                            message: "validation data is empty".to_string(),
                        })
                    }
                }
            }
            None => SplitMetrics::default(),
        };

        let sample = MetricSample {
            step: self.state.global_step,
            learning_rate: self.last_learning_rate,
            train,
            validation,
        };
        log::info!(
            "[{:.2}s] {}",
            self.last_event.elapsed().as_secs_f64(),
            sample
        );
        self.last_event = Instant::now();
        self.sink.record(&sample)?;
        self.report.samples.push(sample);

        let path = self
            .checkpoints
            .save(&self.state, &self.net, self.config.optimizer.kind)?;
        self.report.checkpoints.push(path);

        Ok(Phase::Stepping)
    }

    fn export(&mut self) -> Result<Phase> {
        let exporter = ModelExporter::new(&self.config.paths.model_path);
        let model = self.state.inference_model();

        match exporter.export::<B::InnerBackend, _>(
            self.config.paths.model_version,
            &model,
            &self.net,
        ) {
            Ok(path) => self.report.export = Some(path),
            Err(HarnessError::ExportConflict(path)) => {
                log::error!("The model exists in path: {}, skipping export", path)
            }
            Err(e) => return Err(e),
        }

        Ok(Phase::Terminated)
    }
}

/// Train the model `M` as configured
pub fn train<B, M>(
    config: &RunConfig,
    device: &B::Device,
    sink: &mut dyn MetricsSink,
) -> Result<TrainReport>
where
    B: AutodiffBackend,
    M: TrainableNet<B> + 'static,
{
    Trainer::<B, M>::new(config, device.clone(), sink).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DnnModel, LinearModel};
    use crate::{FileFormat, OptimizerKind, Scenario};
    use burn::backend::{Autodiff, NdArray};
    use tempfile::TempDir;

    type TrainBackend = Autodiff<NdArray<f32>>;

    fn write_data(dir: &TempDir, name: &str, rows: usize) -> String {
        let content: String = (0..rows)
            .map(|i| {
                let label = i % 2;
                let x = if label == 1 { 1.0 } else { -1.0 };
                format!("{},{},{},{}\n", x, x * 0.5, (i % 3) as f32, label)
            })
            .collect();
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path.display().to_string()
    }

    fn config(dir: &TempDir, rows: usize) -> RunConfig {
        let mut config = RunConfig::default();
        config.data.feature_size = 3;
        config.data.train_file_format = FileFormat::DelimitedText;
        config.data.train_file = write_data(dir, "train.csv", rows);
        config.data.validation_file = write_data(dir, "valid.csv", 6);
        config.data.shuffle_seed = Some(1);
        config.model.dnn_struct = vec![8, 4];
        config.optimizer.kind = OptimizerKind::Adam;
        config.training.epoch_number = 1;
        config.training.train_batch_size = 4;
        config.training.validation_batch_size = 4;
        config.training.steps_to_validate = 2;
        config.paths.checkpoint_path = dir.path().join("checkpoint");
        config.paths.output_path = dir.path().join("output");
        config.paths.model_path = dir.path().join("model");
        config
    }

    #[test]
    fn test_validation_cadence() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, 20);
        let device = Default::default();
        let mut samples = Vec::new();

        let report = train::<TrainBackend, DnnModel<TrainBackend>>(&config, &device, &mut samples)
            .unwrap();

        assert_eq!(report.steps, 5);
        assert_eq!(report.global_step, 5);
        let steps: Vec<u64> = samples.iter().map(|s| s.step).collect();
        assert_eq!(steps, vec![2, 4]);
        assert_eq!(report.checkpoints.len(), 2);
        assert!(report.export.is_some());
    }

    #[test]
    fn test_resume_continues_global_step() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, 8);
        let device = Default::default();

        let first = train::<TrainBackend, DnnModel<TrainBackend>>(&config, &device, &mut Vec::new())
            .unwrap();
        assert_eq!(first.global_step, 2);

        let second = train::<TrainBackend, DnnModel<TrainBackend>>(&config, &device, &mut Vec::new())
            .unwrap();
        assert_eq!(second.resumed_from, Some(2));
        assert_eq!(second.global_step, 4);
        // Same version again: the second export is skipped, not fatal
        assert!(second.export.is_none());
    }

    #[test]
    fn test_benchmark_skips_validation_and_export() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, 12);
        config.enable_benchmark = true;
        config.data.validation_file = dir.path().join("absent.csv").display().to_string();
        let device = Default::default();
        let mut samples = Vec::new();

        let report = train::<TrainBackend, DnnModel<TrainBackend>>(&config, &device, &mut samples)
            .unwrap();

        assert_eq!(report.steps, 3);
        assert!(samples.is_empty());
        assert!(report.checkpoints.is_empty());
        assert!(report.export.is_none());
        assert!(!config.paths.model_path.exists());
    }

    #[test]
    fn test_regression_reports_loss_only() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, 8);
        config.scenario = Scenario::Regression;
        config.data.label_size = 1;
        config.model.kind = crate::ModelKind::Linear;
        let device = Default::default();
        let mut samples = Vec::new();

        train::<TrainBackend, LinearModel<TrainBackend>>(&config, &device, &mut samples).unwrap();

        assert!(!samples.is_empty());
        for sample in samples {
            assert!(sample.train.accuracy.is_none());
            assert!(sample.validation.auc.is_none());
        }
    }

    #[test]
    fn test_missing_training_data_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, 8);
        config.data.train_file = dir.path().join("nothing-*.csv").display().to_string();
        let device = Default::default();

        let result =
            train::<TrainBackend, DnnModel<TrainBackend>>(&config, &device, &mut Vec::new());
        assert!(matches!(
            result,
            Err(HarnessError::StreamInitialization { .. })
        ));
    }

    #[test]
    fn test_out_of_range_label_is_decode_error() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, 8);
        let train_file = dir.path().join("labels.csv");
        std::fs::write(&train_file, "1,2,3,0\n3,4,5,5\n").unwrap();
        config.data.train_file = train_file.display().to_string();
        let device = Default::default();

        let err = train::<TrainBackend, DnnModel<TrainBackend>>(&config, &device, &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, HarnessError::Decode { index: 1, .. }));
        assert_eq!(err.exit_code(), 4);
        assert!(!config.paths.checkpoint_path.exists());
    }

    #[test]
    fn test_empty_validation_data_fails_before_any_step() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, 8);
        let validation = dir.path().join("empty.csv");
        std::fs::write(&validation, "").unwrap();
        config.data.validation_file = validation.display().to_string();
        // A step would fail with a decode error on this data
        let train_file = dir.path().join("labels.csv");
        std::fs::write(&train_file, "1,2,3,9\n").unwrap();
        config.data.train_file = train_file.display().to_string();
        let device = Default::default();
        let mut samples = Vec::new();

        let err = train::<TrainBackend, DnnModel<TrainBackend>>(&config, &device, &mut samples)
            .unwrap_err();
        assert!(matches!(err, HarnessError::StreamInitialization { .. }));
        assert!(samples.is_empty());
        assert!(!config.paths.checkpoint_path.exists());
    }

    #[test]
    fn test_no_resume_restarts_at_step_zero() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, 8);
        let device = Default::default();

        let first = train::<TrainBackend, DnnModel<TrainBackend>>(&config, &device, &mut Vec::new())
            .unwrap();
        assert_eq!(first.global_step, 2);

        config.resume_from_checkpoint = false;
        let second = train::<TrainBackend, DnnModel<TrainBackend>>(&config, &device, &mut Vec::new())
            .unwrap();
        assert_eq!(second.resumed_from, None);
        assert_eq!(second.steps, 2);
        assert_eq!(second.global_step, 2);
    }

    #[test]
    fn test_staircase_decay_applies_to_steps() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, 8);
        config.optimizer.learning_rate = 0.01;
        config.optimizer.enable_lr_decay = true;
        config.optimizer.lr_decay_rate = 0.5;
        config.training.steps_to_validate = 1;
        let device = Default::default();

        // Start one step before the first decay boundary
        let net = NetSpec::from_config(&config);
        let mut state = ModelState::<TrainBackend, DnnModel<TrainBackend>>::init(
            &net,
            config.optimizer.kind,
            &device,
        );
        state.global_step = 99_999;
        CheckpointManager::new(&config.paths.checkpoint_path)
            .save(&state, &net, config.optimizer.kind)
            .unwrap();

        let mut samples = Vec::new();
        let report = train::<TrainBackend, DnnModel<TrainBackend>>(&config, &device, &mut samples)
            .unwrap();

        assert_eq!(report.resumed_from, Some(99_999));
        let rates: Vec<(u64, f64)> = samples.iter().map(|s| (s.step, s.learning_rate)).collect();
        assert_eq!(rates.len(), 2);
        assert_eq!(rates[0].0, 100_000);
        assert!((rates[0].1 - 0.01).abs() < 1e-12);
        assert_eq!(rates[1].0, 100_001);
        assert!((rates[1].1 - 0.005).abs() < 1e-12);
    }
}
