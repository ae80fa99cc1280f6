//! Losses, evaluation metrics and the monitoring sink

use crate::data::dataset::TabularBatch;
use crate::model::TabularNet;
use crate::{HarnessError, Result, Scenario};
use burn::nn::loss::{CrossEntropyLossConfig, MseLoss, Reduction};
use burn::tensor::activation::softmax;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};
use serde::Serialize;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

/// Row-major class probability matrix
#[derive(Debug, Clone, PartialEq)]
pub struct Probabilities {
    values: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl Probabilities {
    pub fn new(values: Vec<f32>, rows: usize, cols: usize) -> Self {
        Probabilities { values, rows, cols }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row(&self, index: usize) -> &[f32] {
        &self.values[index * self.cols..(index + 1) * self.cols]
    }

    pub fn column(&self, index: usize) -> Vec<f32> {
        (0..self.rows)
            .map(|row| self.values[row * self.cols + index])
            .collect()
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        self.values.chunks(self.cols.max(1))
    }

    /// Index of the most probable class in every row
    pub fn argmax(&self) -> Vec<usize> {
        self.iter_rows()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, &p)| {
                        if p > best.1 {
                            (i, p)
                        } else {
                            best
                        }
                    })
                    .0
            })
            .collect()
    }
}

/// Copy a 2d tensor to the host
pub fn tensor_rows<B: Backend>(tensor: Tensor<B, 2>) -> Result<(Vec<f32>, usize, usize)> {
    let [rows, cols] = tensor.dims();
    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| HarnessError::Tensor(format!("{:?}", e)))?;
    Ok((values, rows, cols))
}

/// Row-wise softmax of the logits and the fraction of rows whose argmax equals the label
pub fn softmax_and_accuracy<B: Backend>(
    logits: Tensor<B, 2>,
    labels: &[f32],
) -> Result<(Probabilities, f64)> {
    let (values, rows, cols) = tensor_rows(softmax(logits, 1))?;
    let probabilities = Probabilities::new(values, rows, cols);
    let accuracy = accuracy(&probabilities.argmax(), labels);
    Ok((probabilities, accuracy))
}

fn accuracy(predictions: &[usize], labels: &[f32]) -> f64 {
    if predictions.is_empty() {
        return 0.0;
    }
    let correct = predictions
        .iter()
        .zip(labels)
        .filter(|(&p, &label)| label >= 0.0 && p == label.round() as usize)
        .count();
    correct as f64 / predictions.len() as f64
}

/// ROC-AUC of the positive-class column; binary problems only.
///
/// `None` for other label sizes or when the labels hold a single class.
pub fn auc(probabilities: &Probabilities, labels: &[f32], label_size: usize) -> Option<f64> {
    if label_size != 2 || probabilities.cols() != 2 {
        return None;
    }
    let positives: Vec<bool> = labels.iter().map(|&label| label >= 0.5).collect();
    roc_auc(&probabilities.column(1), &positives)
}

/// Area under the ROC curve by the trapezoidal rule, with tied scores
/// contributing one diagonal segment
pub fn roc_auc(scores: &[f32], positives: &[bool]) -> Option<f64> {
    let total_pos = positives.iter().filter(|&&p| p).count();
    let total_neg = positives.len() - total_pos;
    if total_pos == 0 || total_neg == 0 || scores.len() != positives.len() {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut area = 0.0;
    let (mut tp, mut fp) = (0usize, 0usize);
    let (mut prev_tpr, mut prev_fpr) = (0.0, 0.0);
    let mut i = 0;
    while i < order.len() {
        let score = scores[order[i]];
        while i < order.len() && scores[order[i]] == score {
            if positives[order[i]] {
                tp += 1;
            } else {
                fp += 1;
            }
            i += 1;
        }
        let tpr = tp as f64 / total_pos as f64;
        let fpr = fp as f64 / total_neg as f64;
        area += (fpr - prev_fpr) * (tpr + prev_tpr) / 2.0;
        prev_tpr = tpr;
        prev_fpr = fpr;
    }

    Some(area)
}

/// Mean sparse cross-entropy of the logits against class indices
pub fn classification_loss<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    CrossEntropyLossConfig::new()
        .init(&logits.device())
        .forward(logits, targets)
}

/// Mean squared error with the label broadcast over every output column
pub fn regression_loss<B: Backend>(outputs: Tensor<B, 2>, values: Tensor<B, 2>) -> Tensor<B, 1> {
    let [_, cols] = outputs.dims();
    MseLoss::new().forward(outputs, values.repeat_dim(1, cols), Reduction::Mean)
}

/// The loss for `scenario` on one batch
pub fn scenario_loss<B: Backend>(
    scenario: Scenario,
    logits: Tensor<B, 2>,
    batch: &TabularBatch<B>,
) -> Tensor<B, 1> {
    match scenario {
        Scenario::Classification => classification_loss(logits, batch.class_targets.clone()),
        Scenario::Regression => regression_loss(logits, batch.value_targets.clone()),
    }
}

/// Metrics of one data split at one step
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SplitMetrics {
    pub loss: f64,
    /// Classification only
    pub accuracy: Option<f64>,
    /// Binary classification only
    pub auc: Option<f64>,
}

impl fmt::Display for SplitMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loss: {:.6}", self.loss)?;
        if let Some(accuracy) = self.accuracy {
            write!(f, ", acc: {:.4}", accuracy)?;
        }
        if let Some(auc) = self.auc {
            write!(f, ", auc: {:.4}", auc)?;
        }
        Ok(())
    }
}

/// Score `model` on one batch; no parameter changes
pub fn evaluate<B: Backend, M: TabularNet<B>>(
    model: &M,
    batch: &TabularBatch<B>,
    scenario: Scenario,
    label_size: usize,
) -> Result<SplitMetrics> {
    use burn::tensor::ElementConversion;

    let logits = model.infer(batch.features.clone());
    let loss: f64 = scenario_loss(scenario, logits.clone(), batch)
        .into_scalar()
        .elem();

    match scenario {
        Scenario::Classification => {
            let (probabilities, accuracy) = softmax_and_accuracy(logits, &batch.labels)?;
            Ok(SplitMetrics {
                loss,
                accuracy: Some(accuracy),
                auc: auc(&probabilities, &batch.labels, label_size),
            })
        }
        Scenario::Regression => Ok(SplitMetrics {
            loss,
            accuracy: None,
            auc: None,
        }),
    }
}

/// Everything reported at one validation event
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSample {
    pub step: u64,
    /// Learning rate applied by the step that produced this sample
    pub learning_rate: f64,
    pub train: SplitMetrics,
    pub validation: SplitMetrics,
}

impl fmt::Display for MetricSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Step: {}, loss: {:.6}", self.step, self.train.loss)?;
        if let Some(accuracy) = self.train.accuracy {
            write!(f, ", train_acc: {:.4}", accuracy)?;
        }
        if let Some(auc) = self.train.auc {
            write!(f, ", train_auc: {:.4}", auc)?;
        }
        write!(f, ", valid_loss: {:.6}", self.validation.loss)?;
        if let Some(accuracy) = self.validation.accuracy {
            write!(f, ", valid_acc: {:.4}", accuracy)?;
        }
        if let Some(auc) = self.validation.auc {
            write!(f, ", valid_auc: {:.4}", auc)?;
        }
        Ok(())
    }
}

/// Receives every [`MetricSample`] a run produces
pub trait MetricsSink {
    fn record(&mut self, sample: &MetricSample) -> Result<()>;
}

impl MetricsSink for Vec<MetricSample> {
    fn record(&mut self, sample: &MetricSample) -> Result<()> {
        self.push(*sample);
        Ok(())
    }
}

#[derive(Serialize)]
struct MetricsRow {
    step: u64,
    timestamp: String,
    train_loss: f64,
    train_accuracy: Option<f64>,
    train_auc: Option<f64>,
    validation_loss: f64,
    validation_accuracy: Option<f64>,
    validation_auc: Option<f64>,
    learning_rate: f64,
}

/// Appends samples to `<dir>/metrics.csv`, writing the header once
pub struct CsvMetricsSink {
    path: PathBuf,
}

impl CsvMetricsSink {
    pub const FILE_NAME: &'static str = "metrics.csv";

    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(CsvMetricsSink {
            path: dir.as_ref().join(Self::FILE_NAME),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for CsvMetricsSink {
    fn record(&mut self, sample: &MetricSample) -> Result<()> {
        let is_new = !self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(file);

        writer.serialize(MetricsRow {
            step: sample.step,
            timestamp: chrono::Utc::now().to_rfc3339(),
            train_loss: sample.train.loss,
            train_accuracy: sample.train.accuracy,
            train_auc: sample.train.auc,
            validation_loss: sample.validation.loss,
            validation_accuracy: sample.validation.accuracy,
            validation_auc: sample.validation.auc,
            learning_rate: sample.learning_rate,
        })?;
        writer.flush()?;
        Ok(())
    }
}
