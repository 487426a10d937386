//! FITB and masking-style evaluation of a frozen model copy.

use burn::tensor::{backend::Backend, ElementConversion};

use super::encoder::OutfitModel;
use super::loss_utils::{gather_mask_positions, AccuracyCounter, Objective, ObjectiveFn};
use crate::fashion::data::pipeline::{FitbBatch, FitbDataset, OutfitDataset};
use crate::fashion::error::Result;

/// Score one FITB question: is the prediction at the mask token closest to the true answer?
pub fn fitb_step<B: Backend, M: OutfitModel<B>>(
    model: &M,
    objective: &ObjectiveFn,
    batch: &FitbBatch<B>,
) -> Result<bool> {
    let output = model.forward(&batch.context);
    let prediction = gather_mask_positions(output.outputs, &batch.context.mask_positions);

    let candidates = model.preprocess(&batch.candidates);
    let [_, count, hidden] = candidates.dims();
    let candidates = candidates.reshape([count, hidden]);

    objective.is_correct(prediction, candidates, batch.answer)
}

/// Fraction of FITB questions answered correctly; `0.0` for an empty set.
pub fn fitb_accuracy<B: Backend, M: OutfitModel<B>>(
    model: &M,
    objective: &ObjectiveFn,
    dataset: &FitbDataset,
    device: &B::Device,
) -> Result<f64> {
    let mut counter = AccuracyCounter::default();
    for batch in dataset.batches::<B>(device) {
        counter.record(fitb_step(model, objective, &batch)?);
    }
    log::debug!("FITB: {}/{} correct", counter.correct, counter.total);
    Ok(counter.value())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskingReport {
    /// Mean batch loss
    pub loss: f64,
    pub accuracy: f64,
}

/// Training objective over held-out outfits with fixed mask positions, without gradients.
pub fn masking_validation<B: Backend, M: OutfitModel<B>>(
    model: &M,
    objective: &ObjectiveFn,
    dataset: &OutfitDataset,
    batch_size: usize,
    seed: u64,
    device: &B::Device,
) -> Result<MaskingReport> {
    let plan = dataset.plan_evaluation(batch_size, seed)?;
    let mut counter = AccuracyCounter::default();
    let mut loss_sum = 0.0;

    for rows in &plan.batches {
        let batch = dataset.assemble::<B>(rows, device);
        let output = model.forward(&batch);
        let outputs = gather_mask_positions(output.outputs, &batch.mask_positions);
        let targets = gather_mask_positions(output.targets, &batch.mask_positions);

        counter.merge(objective.batch_accuracy(outputs.clone(), targets.clone(), &batch.mask_categories)?);
        loss_sum += objective
            .loss(outputs, targets, &batch.mask_categories)
            .into_scalar()
            .elem::<f64>();
    }

    Ok(MaskingReport {
        loss: loss_sum / plan.len().max(1) as f64,
        accuracy: counter.value(),
    })
}
