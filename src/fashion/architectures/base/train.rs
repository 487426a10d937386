//! Masked-item training loop.
//!
//! One run moves through initialization (restore or fresh start), training
//! epochs, periodic validation of a frozen copy with its checkpoint decision,
//! and finalization against the best weights. All progress lives in an
//! explicit [`TrainingState`] that is written next to every rolling checkpoint.

use burn::{
    module::AutodiffModule,
    optim::{adaptor::OptimizerAdaptor, Adam, AdamConfig, GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use serde::{Deserialize, Serialize};

use super::checkpoint::CheckpointManager;
use super::early_stopping::EarlyStoppingMonitor;
use super::encoder::OutfitModel;
use super::gradient_policy::{GradientPolicy, TargetGradient};
use super::loss_utils::{gather_mask_positions, AccuracyCounter, Objective, ObjectiveFn};
use super::telemetry::{self, LogSink, MetricsSink};
use super::validation::{fitb_accuracy, masking_validation};
use crate::fashion::data::pipeline::{FitbDataset, OutfitDataset, SequenceBatch};
use crate::fashion::error::{EncoderError, Result};
use crate::fashion::settings::{HyperParams, ValidationMode};

/// Progress of a run, owned by the trainer and persisted with each checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Last completed epoch, `0` before training
    pub epoch: usize,
    pub batch_count: usize,
    /// Best validation score so far, `None` before the first validation
    pub best_score: Option<f64>,
    pub early_stopping: EarlyStoppingMonitor,
    pub gradient_policy: GradientPolicy,
}

impl TrainingState {
    pub fn new(params: &HyperParams) -> Self {
        Self {
            epoch: 0,
            batch_count: 0,
            best_score: None,
            early_stopping: EarlyStoppingMonitor::new(
                params.early_stop_patience,
                params.early_stop_delta,
                params.early_stop_warmup,
            ),
            gradient_policy: GradientPolicy::from_setting(params.target_gradient_from),
        }
    }

    /// Re-apply the schedule settings of `params` to a restored state.
    ///
    /// Progress (epoch, best scores, patience counter, an attached target path)
    /// is kept; thresholds, patience, delta and warmup come from `params`.
    pub fn apply_settings(&mut self, params: &HyperParams) {
        let checks_taken = self.epoch / params.validation_frequency.max(1);
        self.early_stopping.reconfigure(
            params.early_stop_patience,
            params.early_stop_delta,
            params.early_stop_warmup,
            checks_taken,
        );
        self.gradient_policy.reconfigure(params.target_gradient_from);
    }

    /// Record a validation score; returns `true` when it is a new best.
    pub fn record_score(&mut self, score: f64) -> bool {
        let improved = self.best_score.map_or(true, |best| score > best);
        if improved {
            self.best_score = Some(score);
        }
        self.gradient_policy.observe(self.best_score.unwrap_or(0.0));
        improved
    }
}

/// Datasets consumed by one run.
#[derive(Debug, Clone)]
pub struct TrainingData {
    pub train: OutfitDataset,
    /// Validation questions for [`ValidationMode::Fitb`]
    pub valid_fitb: Option<FitbDataset>,
    /// Held-out outfits for [`ValidationMode::Masking`]
    pub valid_outfits: Option<OutfitDataset>,
    /// Test questions scored at finalization; falls back to `valid_fitb`
    pub test_fitb: Option<FitbDataset>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub epochs_run: usize,
    pub batch_count: usize,
    pub best_score: Option<f64>,
    pub test_accuracy: Option<f64>,
    pub stopped_early: bool,
}

/// Error type observers may fail with.
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Called after every validation with the evaluation copy, its score and the epoch.
pub type EpochObserver<M> = Box<dyn FnMut(&M, f64, usize) -> std::result::Result<(), ObserverError>>;

pub struct EncoderTrainer<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + OutfitModel<B>,
    M::InnerModule: OutfitModel<B::InnerBackend>,
{
    params: HyperParams,
    model: M,
    optimizer: OptimizerAdaptor<Adam, M, B>,
    objective: ObjectiveFn,
    state: TrainingState,
    checkpoints: CheckpointManager,
    sink: Box<dyn MetricsSink>,
    observers: Vec<EpochObserver<M::InnerModule>>,
    device: B::Device,
}

impl<B, M> EncoderTrainer<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + OutfitModel<B>,
    M::InnerModule: OutfitModel<B::InnerBackend>,
{
    /// Build the optimizer and restore the latest checkpoint, if any.
    pub fn new(
        params: HyperParams,
        model: M,
        checkpoints: CheckpointManager,
        device: B::Device,
    ) -> Result<Self> {
        params.validate()?;
        let objective = ObjectiveFn::from_params(&params)?;
        let optimizer = AdamConfig::new().init::<B, M>();

        let restored = checkpoints.restore::<B, M, _>(model, optimizer, &device);
        let mut state = match restored.state {
            Some(mut state) => {
                state.apply_settings(&params);
                state
            }
            None => TrainingState::new(&params),
        };
        state
            .gradient_policy
            .observe(state.best_score.unwrap_or(0.0));

        log::info!(
            "trainer ready: {:?} objective, targets {:?}, resuming after epoch {}",
            objective.kind(),
            state.gradient_policy.state(),
            state.epoch
        );

        Ok(Self {
            params,
            model: restored.model,
            optimizer: restored.optimizer,
            objective,
            state,
            checkpoints,
            sink: Box::new(LogSink),
            observers: Vec::new(),
            device,
        })
    }

    pub fn with_sink(mut self, sink: impl MetricsSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    pub fn with_observer(
        mut self,
        observer: impl FnMut(&M::InnerModule, f64, usize) -> std::result::Result<(), ObserverError> + 'static,
    ) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Run the remaining epochs, then finalize.
    pub fn fit(&mut self, data: &TrainingData) -> Result<TrainingReport> {
        self.check_validation_data(data)?;
        if data.train.batches_per_epoch(self.params.batch_size) == 0 {
            log::warn!(
                "{} training outfits do not fill one batch of {}",
                data.train.len(),
                self.params.batch_size
            );
        }

        let first_epoch = self.state.epoch + 1;
        let mut stopped_early = false;

        for epoch in first_epoch..=self.params.epoch_count {
            self.train_epoch(&data.train, epoch)?;
            self.state.epoch = epoch;

            if epoch % self.params.validation_frequency == 0 && self.validate(data, epoch)? {
                log::info!(
                    "stopped early at epoch {}: no improvement for {} epochs",
                    epoch,
                    self.params.early_stop_patience
                );
                stopped_early = true;
                break;
            }
        }

        self.finalize(data, stopped_early)
    }

    fn check_validation_data(&self, data: &TrainingData) -> Result<()> {
        let missing = match self.params.validation_mode {
            ValidationMode::Fitb => data.valid_fitb.is_none(),
            ValidationMode::Masking => data.valid_outfits.is_none(),
        };
        if missing {
            return Err(EncoderError::InvalidConfig(format!(
                "validation_mode {:?} has no validation data",
                self.params.validation_mode
            )));
        }
        Ok(())
    }

    fn train_epoch(&mut self, dataset: &OutfitDataset, epoch: usize) -> Result<()> {
        let plan = dataset.plan_epoch(epoch, self.params.batch_size, self.params.seed)?;
        let mut accuracy = AccuracyCounter::default();
        let mut loss_sum = 0.0;

        for (index, rows) in plan.batches.iter().enumerate() {
            let batch = dataset.assemble::<B>(rows, &self.device);
            let (loss, counter) = self.train_step(&batch)?;
            self.state.batch_count += 1;
            loss_sum += loss;
            accuracy.merge(counter);

            let step = self.state.batch_count;
            self.sink.scalar(telemetry::LOSS, step, loss_sum / (index + 1) as f64)?;
            self.sink.scalar(telemetry::BATCH_ACC, step, accuracy.value())?;
        }

        let epoch_loss = loss_sum / plan.len().max(1) as f64;
        self.sink.scalar(telemetry::EPOCH_LOSS, epoch, epoch_loss)?;
        self.sink.scalar(telemetry::EPOCH_ACC, epoch, accuracy.value())?;
        log::info!(
            "epoch {:03}: loss {:.3}, acc {:.3}",
            epoch,
            epoch_loss,
            accuracy.value()
        );
        Ok(())
    }

    /// One optimizer step; returns the batch loss and in-batch accuracy.
    pub fn train_step(&mut self, batch: &SequenceBatch<B>) -> Result<(f64, AccuracyCounter)> {
        let output = self.model.forward(batch);
        let outputs = gather_mask_positions(output.outputs, &batch.mask_positions);
        let targets = self
            .state
            .gradient_policy
            .apply(gather_mask_positions(output.targets, &batch.mask_positions));

        let counter = self.objective.batch_accuracy(
            outputs.clone().detach(),
            targets.clone().detach(),
            &batch.mask_categories,
        )?;

        let mut loss = self.objective.loss(outputs, targets, &batch.mask_categories);
        if let Some(penalty) = self.model.regularization() {
            loss = loss + penalty;
        }
        let loss_value = loss.clone().into_scalar().elem::<f64>();
        log::debug!(
            "batch {}: loss {:.5}, targets {:?}",
            self.state.batch_count + 1,
            loss_value,
            self.state.gradient_policy.state()
        );

        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        self.model = self
            .optimizer
            .step(self.params.learning_rate, self.model.clone(), grads);

        Ok((loss_value, counter))
    }

    /// Score the evaluation copy and act on it; returns `true` to stop early.
    fn validate(&mut self, data: &TrainingData, epoch: usize) -> Result<bool> {
        let snapshot = self.model.valid();
        let score = self.score(&snapshot, data)?;
        self.sink.scalar(telemetry::VALID_ACC, epoch, score)?;
        log::info!("epoch {:03}: validation acc {:.3}", epoch, score);

        let was_detached = self.state.gradient_policy.state() == TargetGradient::Detached;
        if self.state.record_score(score) {
            self.checkpoints
                .save_best::<B::InnerBackend, M::InnerModule>(&snapshot)?;
        }
        if was_detached && self.state.gradient_policy.state() == TargetGradient::Attached {
            log::info!("epoch {:03}: target gradient enabled", epoch);
        }

        let stop = self.params.early_stop
            && self
                .state
                .early_stopping
                .should_stop(score, self.params.validation_frequency);

        self.checkpoints
            .save::<B, M, _>(&self.model, &self.optimizer, &self.state)?;

        for observer in &mut self.observers {
            observer(&snapshot, score, epoch).map_err(|err| EncoderError::Observer {
                epoch,
                reason: err.to_string(),
            })?;
        }

        Ok(stop)
    }

    fn score(&self, snapshot: &M::InnerModule, data: &TrainingData) -> Result<f64> {
        match (self.params.validation_mode, &data.valid_fitb, &data.valid_outfits) {
            (ValidationMode::Fitb, Some(questions), _) => {
                fitb_accuracy::<B::InnerBackend, _>(snapshot, &self.objective, questions, &self.device)
            }
            (ValidationMode::Masking, _, Some(outfits)) => Ok(masking_validation::<B::InnerBackend, _>(
                snapshot,
                &self.objective,
                outfits,
                self.params.batch_size,
                self.params.seed,
                &self.device,
            )?
            .accuracy),
            (mode, _, _) => Err(EncoderError::InvalidConfig(format!(
                "validation_mode {:?} has no validation data",
                mode
            ))),
        }
    }

    fn finalize(&mut self, data: &TrainingData, stopped_early: bool) -> Result<TrainingReport> {
        let best = self
            .checkpoints
            .load_best::<B::InnerBackend, M::InnerModule>(self.model.valid(), &self.device)?;

        let test_accuracy = match data.test_fitb.as_ref().or(data.valid_fitb.as_ref()) {
            Some(questions) => {
                let accuracy =
                    fitb_accuracy::<B::InnerBackend, _>(&best, &self.objective, questions, &self.device)?;
                self.sink.scalar(telemetry::TEST_ACC, self.state.epoch, accuracy)?;
                log::info!("test FITB acc {:.3} with the best weights", accuracy);
                Some(accuracy)
            }
            None => {
                log::info!("no FITB questions for the final evaluation");
                None
            }
        };

        self.checkpoints
            .save::<B, M, _>(&self.model, &self.optimizer, &self.state)?;
        self.sink.flush()?;
        log::info!("trained on {} batches in total", self.state.batch_count);

        Ok(TrainingReport {
            epochs_run: self.state.epoch,
            batch_count: self.state.batch_count,
            best_score: self.state.best_score,
            test_accuracy,
            stopped_early,
        })
    }
}
