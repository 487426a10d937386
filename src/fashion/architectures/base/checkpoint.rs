//! Rolling checkpoints, best weights and component artifacts.
//!
//! Directory layout:
//!
//! ```text
//! ckpt-<step>.json        training state, written last
//! ckpt-<step>-model.mpk   model record
//! ckpt-<step>-optim.mpk   optimizer record
//! best_weights.mpk        weights with the best validation score
//! preprocessor.mpk        preprocessor of the best weights
//! encoder.mpk             sequence encoder of the best weights
//! ```

use burn::{
    module::{AutodiffModule, Module},
    optim::Optimizer,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::backend::{AutodiffBackend, Backend},
};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::encoder::OutfitModel;
use super::train::TrainingState;
use crate::fashion::error::{EncoderError, Result};

pub const BEST_WEIGHTS: &str = "best_weights";

type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Model, optimizer and progress recovered from the latest checkpoint.
pub struct Restored<M, O> {
    pub model: M,
    pub optimizer: O,
    pub state: Option<TrainingState>,
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    max_to_keep: usize,
    recorder: CheckpointRecorder,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, max_to_keep: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_to_keep: max_to_keep.max(1),
            recorder: CheckpointRecorder::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self, step: usize) -> PathBuf {
        self.dir.join(format!("ckpt-{}.json", step))
    }

    fn model_stem(&self, step: usize) -> PathBuf {
        self.dir.join(format!("ckpt-{}-model", step))
    }

    fn optim_stem(&self, step: usize) -> PathBuf {
        self.dir.join(format!("ckpt-{}-optim", step))
    }

    pub fn best_weights_path(&self) -> PathBuf {
        self.dir.join(format!("{}.mpk", BEST_WEIGHTS))
    }

    /// Steps of the complete checkpoints on disk, oldest first.
    pub fn checkpoints(&self) -> Result<Vec<usize>> {
        let mut steps = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let step = name
                .to_str()
                .and_then(|n| n.strip_prefix("ckpt-"))
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<usize>().ok());
            if let Some(step) = step {
                steps.push(step);
            }
        }
        steps.sort_unstable();
        Ok(steps)
    }

    pub fn latest(&self) -> Result<Option<usize>> {
        Ok(self.checkpoints()?.last().copied())
    }

    /// Write a new rolling checkpoint and prune the oldest beyond `max_to_keep`.
    pub fn save<B, M, O>(&self, model: &M, optimizer: &O, state: &TrainingState) -> Result<usize>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let step = self.latest()?.map_or(1, |s| s + 1);

        model.clone().save_file(self.model_stem(step), &self.recorder)?;
        Recorder::<B>::record(&self.recorder, optimizer.to_record(), self.optim_stem(step))?;
        fs::write(self.state_path(step), serde_json::to_vec_pretty(state)?)?;

        log::info!(
            "saved checkpoint {} for epoch {} in {}",
            step,
            state.epoch,
            self.dir.display()
        );
        self.prune()?;
        Ok(step)
    }

    fn prune(&self) -> Result<()> {
        let steps = self.checkpoints()?;
        let excess = steps.len().saturating_sub(self.max_to_keep);
        for &step in &steps[..excess] {
            for path in [
                self.state_path(step),
                self.model_stem(step).with_extension("mpk"),
                self.optim_stem(step).with_extension("mpk"),
            ] {
                remove_if_present(&path)?;
            }
            log::debug!("pruned checkpoint {}", step);
        }
        Ok(())
    }

    /// Load the latest checkpoint into `model` and `optimizer`.
    ///
    /// An absent or unreadable checkpoint is not an error: the inputs are
    /// returned unchanged with no state.
    pub fn restore<B, M, O>(&self, model: M, optimizer: O, device: &B::Device) -> Restored<M, O>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        match self.try_restore::<B, M, O>(model.clone(), device) {
            Ok(Some((step, model, record, state))) => {
                log::info!(
                    "restored checkpoint {} (epoch {}, {} batches)",
                    step,
                    state.epoch,
                    state.batch_count
                );
                Restored {
                    model,
                    optimizer: optimizer.load_record(record),
                    state: Some(state),
                }
            }
            Ok(None) => {
                log::info!("no checkpoint in {}, initializing from scratch", self.dir.display());
                Restored {
                    model,
                    optimizer,
                    state: None,
                }
            }
            Err(err) => {
                log::warn!("could not restore checkpoint, initializing from scratch: {}", err);
                Restored {
                    model,
                    optimizer,
                    state: None,
                }
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn try_restore<B, M, O>(
        &self,
        model: M,
        device: &B::Device,
    ) -> Result<Option<(usize, M, O::Record, TrainingState)>>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let Some(step) = self.latest()? else {
            return Ok(None);
        };
        let state: TrainingState = serde_json::from_slice(&fs::read(self.state_path(step))?)?;
        let model = model.load_file(self.model_stem(step), &self.recorder, device)?;
        let record = Recorder::<B>::load(&self.recorder, self.optim_stem(step), device)?;
        Ok(Some((step, model, record, state)))
    }

    /// Persist the best weights together with the component artifacts.
    pub fn save_best<B, M>(&self, model: &M) -> Result<()>
    where
        B: Backend,
        M: Module<B> + OutfitModel<B>,
    {
        model
            .clone()
            .save_file(self.dir.join(BEST_WEIGHTS), &self.recorder)?;
        model.save_components(&self.dir)?;
        log::info!("saved best weights to {}", self.best_weights_path().display());
        Ok(())
    }

    /// Load the best weights into `model`; their absence is fatal.
    pub fn load_best<B, M>(&self, model: M, device: &B::Device) -> Result<M>
    where
        B: Backend,
        M: Module<B>,
    {
        let path = self.best_weights_path();
        if !path.exists() {
            return Err(EncoderError::MissingBestWeights(path));
        }
        Ok(model.load_file(self.dir.join(BEST_WEIGHTS), &self.recorder, device)?)
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}
