//! Step-tagged checkpoints under a checkpoint directory
//!
//! Layout:
//!
//! ```text
//! checkpoint_path/
//!   checkpoint.ckpt-10/
//!     model.mpk
//!     optimizer.mpk
//!     manifest.json
//!   checkpoint.ckpt-20/
//!     ...
//! ```
//!
//! A checkpoint is written into a hidden staging directory and renamed into
//! place once complete, so a directory with a manifest is always whole.

use crate::model::{NetSpec, TabularNet, TrainableNet};
use crate::training::state::{ModelState, ParamRecorder, MODEL_FILE};
use crate::{HarnessError, OptimizerKind, Result};
use burn::tensor::backend::{AutodiffBackend, Backend};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const PREFIX: &str = "checkpoint.ckpt-";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Metadata stored next to the parameters of every checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub step: u64,
    pub net: NetSpec,
    pub optimizer: OptimizerKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointInfo {
    pub step: u64,
    pub path: PathBuf,
}

/// Which checkpoint to restore
#[derive(Debug, Clone, PartialEq)]
pub enum RestoreTarget {
    /// Highest step under the checkpoint directory
    Latest,
    /// A specific checkpoint directory
    Path(PathBuf),
}

pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CheckpointManager { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, step: u64) -> PathBuf {
        self.dir.join(format!("{}{}", PREFIX, step))
    }

    /// Persist `state` as the checkpoint of its current step
    pub fn save<B, M>(
        &self,
        state: &ModelState<B, M>,
        net: &NetSpec,
        optimizer: OptimizerKind,
    ) -> Result<PathBuf>
    where
        B: AutodiffBackend,
        M: TrainableNet<B> + 'static,
    {
        let step = state.global_step;
        let target = self.path_for(step);
        if target.join(MANIFEST_FILE).exists() {
            log::warn!("Checkpoint for step {} already exists, keeping it", step);
            return Ok(target);
        }

        fs::create_dir_all(&self.dir)?;
        let staging = self.dir.join(format!(".{}{}.partial", PREFIX, step));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        state.save(&staging)?;
        let manifest = CheckpointManifest {
            step,
            net: net.clone(),
            optimizer,
            created_at: Utc::now(),
        };
        fs::write(
            staging.join(MANIFEST_FILE),
            serde_json::to_string_pretty(&manifest)?,
        )?;

        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(&staging, &target)?;
        log::info!("Saved checkpoint {}", target.display());
        Ok(target)
    }

    /// All complete checkpoints, ordered by step
    pub fn list(&self) -> Result<Vec<CheckpointInfo>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut checkpoints = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let step = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_prefix(PREFIX))
                .and_then(|step| step.parse::<u64>().ok());
            if let Some(step) = step {
                if path.join(MANIFEST_FILE).is_file() {
                    checkpoints.push(CheckpointInfo { step, path });
                }
            }
        }
        checkpoints.sort_by_key(|c| c.step);
        Ok(checkpoints)
    }

    pub fn latest(&self) -> Result<Option<CheckpointInfo>> {
        Ok(self.list()?.pop())
    }

    /// Resolve a target to a complete checkpoint, if there is one
    pub fn resolve(&self, target: &RestoreTarget) -> Result<Option<CheckpointInfo>> {
        match target {
            RestoreTarget::Latest => self.latest(),
            RestoreTarget::Path(path) => {
                if !path.join(MANIFEST_FILE).is_file() {
                    return Ok(None);
                }
                let manifest = read_manifest(path)?;
                Ok(Some(CheckpointInfo {
                    step: manifest.step,
                    path: path.clone(),
                }))
            }
        }
    }

    /// Load a checkpoint into `state`, which must use the same network and
    /// optimizer kind as the checkpoint.
    ///
    /// When nothing is resolvable the state is handed back untouched together
    /// with `None`.
    pub fn restore<B, M>(
        &self,
        target: &RestoreTarget,
        state: ModelState<B, M>,
        net: &NetSpec,
        optimizer: OptimizerKind,
        device: &B::Device,
    ) -> Result<(ModelState<B, M>, Option<CheckpointInfo>)>
    where
        B: AutodiffBackend,
        M: TrainableNet<B> + 'static,
    {
        let Some(info) = self.resolve(target)? else {
            return Ok((state, None));
        };
        let manifest = read_manifest(&info.path)?;
        check_architecture(&manifest, net, &info.path)?;
        if manifest.optimizer != optimizer {
            return Err(HarnessError::Checkpoint(format!(
                "{} holds {} optimizer state, configuration asks for {}",
                info.path.display(),
                manifest.optimizer,
                optimizer
            )));
        }

        let state = state.load(&info.path, manifest.step, device)?;
        log::info!("Restored checkpoint {} (step {})", info.path.display(), info.step);
        Ok((state, Some(info)))
    }

    /// Load only the parameters of a checkpoint into a fresh inference model
    pub fn restore_model<B, M>(
        &self,
        target: &RestoreTarget,
        net: &NetSpec,
        device: &B::Device,
    ) -> Result<Option<(M, CheckpointInfo)>>
    where
        B: Backend,
        M: TabularNet<B>,
    {
        let Some(info) = self.resolve(target)? else {
            return Ok(None);
        };
        let manifest = read_manifest(&info.path)?;
        check_architecture(&manifest, net, &info.path)?;

        let model = M::init(net, device).load_file(
            info.path.join(MODEL_FILE),
            &ParamRecorder::new(),
            device,
        )?;
        log::info!("Loaded parameters from {}", info.path.display());
        Ok(Some((model, info)))
    }
}

pub fn read_manifest(checkpoint: &Path) -> Result<CheckpointManifest> {
    let content = fs::read_to_string(checkpoint.join(MANIFEST_FILE))?;
    Ok(serde_json::from_str(&content)?)
}

fn check_architecture(manifest: &CheckpointManifest, net: &NetSpec, path: &Path) -> Result<()> {
    if &manifest.net != net {
        return Err(HarnessError::Checkpoint(format!(
            "{} was saved for {:?}, configuration asks for {:?}",
            path.display(),
            manifest.net,
            net
        )));
    }
    Ok(())
}
