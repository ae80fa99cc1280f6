//! Batch scoring of a data file with a checkpointed model

use crate::data::dataset::{load_table, TabularBatch, TabularBatcher};
use crate::data::decoder_for_config;
use crate::model::{NetSpec, TabularNet};
use crate::training::checkpoint::{CheckpointInfo, CheckpointManager, RestoreTarget};
use crate::training::metrics::{
    auc, regression_loss, softmax_and_accuracy, tensor_rows, Probabilities,
};
use crate::{HarnessError, Result, RunConfig, Scenario};
use burn::data::dataloader::batcher::Batcher;
use burn::tensor::backend::Backend;
use burn::tensor::ElementConversion;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Scores of one inference run
#[derive(Debug, Clone)]
pub struct InferenceResult {
    /// Class probabilities, or raw outputs for regression
    pub probabilities: Probabilities,
    pub accuracy: Option<f64>,
    pub auc: Option<f64>,
    /// Mean squared error, regression only
    pub loss: Option<f64>,
    pub checkpoint: CheckpointInfo,
    pub result_file: PathBuf,
}

pub struct InferenceRunner<'a> {
    config: &'a RunConfig,
    checkpoints: CheckpointManager,
}

impl<'a> InferenceRunner<'a> {
    pub fn new(config: &'a RunConfig) -> Self {
        InferenceRunner {
            config,
            checkpoints: CheckpointManager::new(&config.paths.checkpoint_path),
        }
    }

    /// Restore `target`, score the inference data file once and write the
    /// probability matrix. Parameters are never modified.
    pub fn run<B: Backend, M: TabularNet<B>>(
        &self,
        target: &RestoreTarget,
        device: &B::Device,
    ) -> Result<InferenceResult> {
        let config = self.config;
        let net = NetSpec::from_config(config);
        let (model, checkpoint) = self
            .checkpoints
            .restore_model::<B, M>(target, &net, device)?
            .ok_or_else(|| {
                HarnessError::CheckpointMissing(self.checkpoints.dir().display().to_string())
            })?;

        let decoder = decoder_for_config(config, config.data.inference_file_format);
        let records = load_table(decoder.as_ref(), &config.data.inference_data_file)?;
        if records.is_empty() {
            return Err(HarnessError::StreamInitialization {
                path: config.data.inference_data_file.clone(),
                message: "no records to score".to_string(),
            });
        }

        let started = Instant::now();
        let batcher = TabularBatcher::new(config.data.feature_size);
        let batch: TabularBatch<B> = batcher.batch(records, device);
        let outputs = model.infer(batch.features.clone());

        let (probabilities, accuracy, auc_value, loss) = match config.scenario {
            Scenario::Classification => {
                let (probabilities, accuracy) = softmax_and_accuracy(outputs, &batch.labels)?;
                let auc_value = auc(&probabilities, &batch.labels, config.data.label_size);
                (probabilities, Some(accuracy), auc_value, None)
            }
            Scenario::Regression => {
                let loss: f64 = regression_loss(outputs.clone(), batch.value_targets.clone())
                    .into_scalar()
                    .elem();
                let (values, rows, cols) = tensor_rows(outputs)?;
                (Probabilities::new(values, rows, cols), None, None, Some(loss))
            }
        };
        let elapsed = started.elapsed().as_secs_f64();

        match config.scenario {
            Scenario::Classification => log::info!(
                "[{:.3}s] Inference accuracy: {}, auc: {}",
                elapsed,
                accuracy.map_or_else(|| "n/a".to_string(), |a| format!("{:.4}", a)),
                auc_value.map_or_else(|| "n/a".to_string(), |a| format!("{:.4}", a))
            ),
            Scenario::Regression => log::info!(
                "[{:.3}s] Inference loss: {:.6}",
                elapsed,
                loss.unwrap_or_default()
            ),
        }

        let result_file = PathBuf::from(&config.data.inference_result_file);
        write_matrix(&probabilities, &result_file)?;
        log::info!("Save result to file: {}", result_file.display());

        Ok(InferenceResult {
            probabilities,
            accuracy,
            auc: auc_value,
            loss,
            checkpoint,
            result_file,
        })
    }
}

/// One comma-delimited row per record
fn write_matrix(matrix: &Probabilities, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    for row in matrix.iter_rows() {
        writer.write_record(row.iter().map(|value| format!("{:e}", value)))?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DnnModel;
    use crate::training::state::ModelState;
    use crate::{FileFormat, OptimizerKind};
    use burn::backend::{Autodiff, NdArray};
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;
    type TrainBackend = Autodiff<TestBackend>;

    fn config(dir: &TempDir) -> RunConfig {
        let data = dir.path().join("test.csv");
        std::fs::write(&data, "1,2,1\n-1,0,0\n0.5,0.5,1\n").unwrap();

        let mut config = RunConfig::default();
        config.data.feature_size = 2;
        config.data.inference_file_format = FileFormat::DelimitedText;
        config.data.inference_data_file = data.display().to_string();
        config.data.inference_result_file =
            dir.path().join("out/result.txt").display().to_string();
        config.model.dnn_struct = vec![4];
        config.paths.checkpoint_path = dir.path().join("checkpoint");
        config
    }

    fn save_checkpoint(config: &RunConfig) {
        let device = Default::default();
        let net = NetSpec::from_config(config);
        let state = ModelState::<TrainBackend, DnnModel<TrainBackend>>::init(
            &net,
            OptimizerKind::Sgd,
            &device,
        );
        CheckpointManager::new(&config.paths.checkpoint_path)
            .save(&state, &net, OptimizerKind::Sgd)
            .unwrap();
    }

    #[test]
    fn test_missing_checkpoint_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let device = Default::default();

        let result = InferenceRunner::new(&config)
            .run::<TestBackend, DnnModel<TestBackend>>(&RestoreTarget::Latest, &device);
        let err = result.unwrap_err();
        assert!(matches!(err, HarnessError::CheckpointMissing(_)));
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn test_writes_one_probability_row_per_record() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        save_checkpoint(&config);
        let device = Default::default();

        let result = InferenceRunner::new(&config)
            .run::<TestBackend, DnnModel<TestBackend>>(&RestoreTarget::Latest, &device)
            .unwrap();

        assert_eq!(result.probabilities.rows(), 3);
        assert!(result.accuracy.is_some());
        assert!(result.auc.is_some());

        let content = std::fs::read_to_string(&result.result_file).unwrap();
        let rows: Vec<Vec<f32>> = content
            .lines()
            .map(|line| line.split(',').map(|v| v.parse().unwrap()).collect())
            .collect();
        assert_eq!(rows.len(), 3);
        for row in rows {
            assert_eq!(row.len(), 2);
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_regression_skips_accuracy_and_auc() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.scenario = Scenario::Regression;
        config.data.label_size = 1;
        save_checkpoint(&config);
        let device = Default::default();

        let result = InferenceRunner::new(&config)
            .run::<TestBackend, DnnModel<TestBackend>>(&RestoreTarget::Latest, &device)
            .unwrap();

        assert_eq!(result.accuracy, None);
        assert_eq!(result.auc, None);
        assert!(result.loss.is_some());
        assert_eq!(result.probabilities.cols(), 1);
    }
}
