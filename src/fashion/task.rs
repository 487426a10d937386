//! Run orchestration: datasets, model construction, training and the debug trace.

use burn::{
    module::AutodiffModule,
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use super::architectures::base::checkpoint::CheckpointManager;
use super::architectures::base::encoder::{FashionEncoder, FashionEncoderConfig, OutfitModel};
use super::architectures::base::loss_utils::{gather_mask_positions, Objective, ObjectiveFn};
use super::architectures::base::telemetry::{CsvSink, FanoutSink, LogSink};
use super::architectures::base::train::{EncoderTrainer, EpochObserver, TrainingData, TrainingReport};
use super::architectures::base::validation::fitb_step;
use super::data::category::CategoryLookup;
use super::data::pipeline::{FitbDataset, OutfitDataset};
use super::error::{EncoderError, Result};
use super::settings::HyperParams;

/// Observer over the evaluation copy of the reference encoder.
pub type EncoderObserver<B> = EpochObserver<FashionEncoder<<B as AutodiffBackend>::InnerBackend>>;

/// What the debug trace observed on one FITB question and one training batch.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugTrace {
    pub fitb_correct: Option<bool>,
    pub train_loss: Option<f64>,
}

pub struct EncoderTask {
    params: HyperParams,
}

impl EncoderTask {
    pub fn new(params: HyperParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &HyperParams {
        &self.params
    }

    pub fn category_lookup(&self) -> Result<Option<CategoryLookup>> {
        match (&self.params.category_file, self.params.with_category_grouping) {
            (Some(path), true) => {
                let lookup = CategoryLookup::from_csv(path)?;
                match lookup.max_group() {
                    Some(max) if max as usize >= self.params.categories_count => {
                        Err(EncoderError::InvalidConfig(format!(
                            "{} has group id {} but categories_count is {}",
                            path.display(),
                            max,
                            self.params.categories_count
                        )))
                    }
                    _ => Ok(Some(lookup)),
                }
            }
            _ => Ok(None),
        }
    }

    /// Load every dataset named in the configuration.
    pub fn get_datasets(&self) -> Result<TrainingData> {
        let lookup = self.category_lookup()?;
        let lookup = lookup.as_ref();
        let params = &self.params;

        let fitb = |path: &Option<PathBuf>| -> Result<Option<FitbDataset>> {
            path.as_ref()
                .map(|p| FitbDataset::from_files(&[p.clone()], lookup, params.use_mask_category, params))
                .transpose()
        };

        Ok(TrainingData {
            train: OutfitDataset::from_files(&params.dataset_files, lookup, params)?,
            valid_fitb: fitb(&params.fitb_file)?,
            valid_outfits: (!params.valid_files.is_empty())
                .then(|| OutfitDataset::from_files(&params.valid_files, lookup, params))
                .transpose()?,
            test_fitb: fitb(&params.test_fitb_file)?,
        })
    }

    /// Checkpoint directory from the configuration, or a fresh one under `logs/`.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.params.checkpoint_dir.clone().unwrap_or_else(|| {
            let stamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            Path::new("logs").join(format!("run-{}", stamp)).join("ckpts")
        })
    }

    pub fn train<B: AutodiffBackend>(&self, device: B::Device) -> Result<TrainingReport> {
        self.train_with_observers::<B>(device, Vec::new())
    }

    pub fn train_with_observers<B: AutodiffBackend>(
        &self,
        device: B::Device,
        observers: Vec<EncoderObserver<B>>,
    ) -> Result<TrainingReport> {
        let data = self.get_datasets()?;
        let model = FashionEncoderConfig::from_params(&self.params).init::<B>(&device);
        let checkpoints = CheckpointManager::new(self.checkpoint_dir(), self.params.max_checkpoints)?;

        let mut sink = FanoutSink::new().with(LogSink);
        if let Some(log_dir) = &self.params.log_dir {
            sink = sink.with(CsvSink::create(log_dir)?);
        }

        let mut trainer = EncoderTrainer::new(self.params.clone(), model, checkpoints, device)?.with_sink(sink);
        for observer in observers {
            trainer = trainer.with_observer(observer);
        }
        trainer.fit(&data)
    }

    /// Run one FITB question and one training batch through a fresh or restored model, logging
    /// the intermediate tensors at debug level.
    pub fn debug<B: AutodiffBackend>(&self, device: B::Device) -> Result<DebugTrace> {
        let data = self.get_datasets()?;
        let objective = ObjectiveFn::from_params(&self.params)?;
        let mut model = FashionEncoderConfig::from_params(&self.params).init::<B>(&device);

        if let Some(dir) = &self.params.checkpoint_dir {
            let checkpoints = CheckpointManager::new(dir, self.params.max_checkpoints)?;
            match checkpoints.load_best::<B, _>(model.clone(), &device) {
                Ok(restored) => {
                    log::info!("debug trace uses the best weights in {}", dir.display());
                    model = restored;
                }
                Err(err) => log::info!("debug trace uses fresh weights: {}", err),
            }
        }

        log::debug!("-------------- FITB TRACE --------------");
        let evaluation = model.valid();
        let fitb_correct = match data.valid_fitb.as_ref().and_then(|d| d.samples().first()) {
            Some(sample) => {
                let batch = sample.to_batch::<B::InnerBackend>(self.params.feature_dim, &device);
                log::debug!("context categories: {:?}", sample.context.categories);
                log::debug!("candidate categories: {:?}", sample.target_categories);
                let correct = fitb_step(&evaluation, &objective, &batch)?;
                log::debug!("answer {} predicted correctly: {}", batch.answer, correct);
                Some(correct)
            }
            None => None,
        };

        log::debug!("-------------- TRAIN TRACE --------------");
        let plan = data
            .train
            .plan_epoch(1, self.params.batch_size, self.params.seed)?;
        let train_loss = match plan.batches.first() {
            Some(rows) => {
                let batch = data.train.assemble::<B>(rows, &device);
                log::debug!("mask positions: {:?}", batch.mask_positions);
                let output = model.forward(&batch);
                log::debug!("outputs: {:?}", output.outputs.dims());

                log::debug!("-------------- TRAIN METRICS TRACE --------------");
                let outputs = gather_mask_positions(output.outputs, &batch.mask_positions);
                let targets = gather_mask_positions(output.targets, &batch.mask_positions);
                let loss = objective
                    .loss(outputs, targets, &batch.mask_categories)
                    .into_scalar()
                    .elem::<f64>();
                log::debug!("loss: {:.5}", loss);
                Some(loss)
            }
            None => None,
        };

        Ok(DebugTrace {
            fitb_correct,
            train_loss,
        })
    }
}
