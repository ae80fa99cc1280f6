//! Model training
//!
//! Optimizers, loss and metrics, checkpoints and the training loop.

pub mod adadelta;
pub mod checkpoint;
pub mod ftrl;
pub mod metrics;
pub mod optimizer;
pub mod state;
pub mod trainer;

pub use checkpoint::{CheckpointInfo, CheckpointManager, RestoreTarget};
pub use metrics::{CsvMetricsSink, MetricSample, MetricsSink, Probabilities, SplitMetrics};
pub use optimizer::{create_optimizer, LearningRateSchedule, ParameterOptimizer};
pub use state::ModelState;
pub use trainer::{train, Phase, TrainReport, Trainer};
