//! Versioned serving artifacts
//!
//! ```text
//! model_path/<version>/
//!   variables.mpk    parameters
//!   signature.json   {keys, features} -> {keys, prediction, softmax}
//!   net.json         architecture needed to rebuild the model
//! ```
//!
//! A version directory is never overwritten.

use crate::model::{NetSpec, TabularNet};
use crate::training::metrics::{tensor_rows, Probabilities};
use crate::training::state::ParamRecorder;
use crate::{HarnessError, Result};
use burn::tensor::activation::softmax;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

pub const VARIABLES_FILE: &str = "variables.mpk";
pub const SIGNATURE_FILE: &str = "signature.json";
pub const NET_FILE: &str = "net.json";

pub const PREDICT_METHOD: &str = "predict";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub dtype: String,
    /// `-1` marks the batch dimension
    pub shape: Vec<i64>,
}

impl TensorInfo {
    fn new(dtype: &str, shape: &[i64]) -> Self {
        TensorInfo {
            dtype: dtype.to_string(),
            shape: shape.to_vec(),
        }
    }
}

/// Named inputs and outputs of the exported model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServingSignature {
    pub method: String,
    pub inputs: BTreeMap<String, TensorInfo>,
    pub outputs: BTreeMap<String, TensorInfo>,
}

impl ServingSignature {
    pub fn for_net(net: &NetSpec) -> Self {
        let features = net.input_units as i64;
        let labels = net.output_units as i64;

        let inputs = BTreeMap::from([
            ("keys".to_string(), TensorInfo::new("int32", &[-1, 1])),
            ("features".to_string(), TensorInfo::new("float32", &[-1, features])),
        ]);
        let outputs = BTreeMap::from([
            ("keys".to_string(), TensorInfo::new("int32", &[-1, 1])),
            ("prediction".to_string(), TensorInfo::new("int64", &[-1])),
            ("softmax".to_string(), TensorInfo::new("float32", &[-1, labels])),
        ]);

        ServingSignature {
            method: PREDICT_METHOD.to_string(),
            inputs,
            outputs,
        }
    }

    fn feature_width(&self) -> Option<usize> {
        let info = self.inputs.get("features")?;
        info.shape.get(1).map(|&width| width as usize)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExportedNet {
    net: NetSpec,
    exported_at: DateTime<Utc>,
}

/// Writes serving artifacts under a root directory
pub struct ModelExporter {
    root: PathBuf,
}

impl ModelExporter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ModelExporter { root: root.into() }
    }

    pub fn version_dir(&self, version: u64) -> PathBuf {
        self.root.join(version.to_string())
    }

    /// Export `model` as `version`; fails with `ExportConflict` if that
    /// version already exists
    pub fn export<B: Backend, M: TabularNet<B>>(
        &self,
        version: u64,
        model: &M,
        net: &NetSpec,
    ) -> Result<PathBuf> {
        let target = self.version_dir(version);
        if target.exists() {
            return Err(HarnessError::ExportConflict(target.display().to_string()));
        }

        fs::create_dir_all(&self.root)?;
        let staging = self.root.join(format!(".{}.partial", version));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        model
            .clone()
            .save_file(staging.join(VARIABLES_FILE), &ParamRecorder::new())?;
        fs::write(
            staging.join(SIGNATURE_FILE),
            serde_json::to_string_pretty(&ServingSignature::for_net(net))?,
        )?;
        let exported = ExportedNet {
            net: net.clone(),
            exported_at: Utc::now(),
        };
        fs::write(staging.join(NET_FILE), serde_json::to_string_pretty(&exported)?)?;

        fs::rename(&staging, &target)?;
        log::info!("Export the model to {}", target.display());
        Ok(target)
    }
}

/// Response of [`ServableModel::predict`]
#[derive(Debug, Clone)]
pub struct ServingOutput {
    pub keys: Vec<i32>,
    pub prediction: Vec<i64>,
    pub softmax: Probabilities,
}

/// An exported model loaded back for serving
pub struct ServableModel<B: Backend, M: TabularNet<B>> {
    model: M,
    net: NetSpec,
    device: B::Device,
    _backend: PhantomData<B>,
}

impl<B: Backend, M: TabularNet<B>> ServableModel<B, M> {
    pub fn load(dir: impl AsRef<Path>, device: &B::Device) -> Result<Self> {
        let dir = dir.as_ref();
        let exported: ExportedNet =
            serde_json::from_str(&fs::read_to_string(dir.join(NET_FILE))?)?;
        let signature: ServingSignature =
            serde_json::from_str(&fs::read_to_string(dir.join(SIGNATURE_FILE))?)?;
        let net = exported.net;

        if net.kind != M::KIND {
            return Err(HarnessError::Configuration(format!(
                "{} holds a {} model, not {}",
                dir.display(),
                net.kind,
                M::KIND
            )));
        }
        if signature.method != PREDICT_METHOD || signature.feature_width() != Some(net.input_units)
        {
            return Err(HarnessError::Configuration(format!(
                "{} has a signature that does not match its network",
                dir.display()
            )));
        }

        let model = M::init(&net, device).load_file(
            dir.join(VARIABLES_FILE),
            &ParamRecorder::new(),
            device,
        )?;

        Ok(ServableModel {
            model,
            net,
            device: device.clone(),
            _backend: PhantomData,
        })
    }

    pub fn predict(&self, keys: &[i32], features: &[Vec<f32>]) -> Result<ServingOutput> {
        let width = self.net.input_units;
        if keys.len() != features.len() {
            return Err(HarnessError::Tensor(format!(
                "{} keys for {} feature rows",
                keys.len(),
                features.len()
            )));
        }
        if let Some(row) = features.iter().find(|row| row.len() != width) {
            return Err(HarnessError::Tensor(format!(
                "feature row has {} values, expected {}",
                row.len(),
                width
            )));
        }

        let flat: Vec<f32> = features.iter().flatten().copied().collect();
        let input =
            Tensor::<B, 1>::from_floats(flat.as_slice(), &self.device).reshape([features.len(), width]);
        let (values, rows, cols) = tensor_rows(softmax(self.model.infer(input), 1))?;
        let softmax = Probabilities::new(values, rows, cols);
        let prediction = softmax.argmax().into_iter().map(|class| class as i64).collect();

        Ok(ServingOutput {
            keys: keys.to_vec(),
            prediction,
            softmax,
        })
    }
}
