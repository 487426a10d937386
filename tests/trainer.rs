// tests/trainer.rs - Resumed schedule settings and target-gradient routing in train_step
use burn::optim::AdamConfig;
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use fashion_encoder::fashion::architectures::base::checkpoint::CheckpointManager;
use fashion_encoder::fashion::architectures::base::encoder::{FashionEncoder, FashionEncoderConfig, OutfitModel};
use fashion_encoder::fashion::architectures::base::gradient_policy::TargetGradient;
use fashion_encoder::fashion::architectures::base::train::{EncoderTrainer, TrainingState};
use fashion_encoder::fashion::data::pipeline::{pad_sequences, SequenceBatch};
use fashion_encoder::test_utils::tiny_params;
use fashion_encoder::HyperParams;
use std::path::Path;

type TrainBackend = Autodiff<NdArray<f32>>;
type Model = FashionEncoder<TrainBackend>;

const FEATURE_DIM: usize = 4;

fn model(params: &HyperParams) -> Model {
    FashionEncoderConfig::from_params(params).init::<TrainBackend>(&Default::default())
}

fn trainer(params: HyperParams, model: Model, dir: &Path) -> EncoderTrainer<TrainBackend, Model> {
    let checkpoints = CheckpointManager::new(dir, params.max_checkpoints).unwrap();
    EncoderTrainer::new(params, model, checkpoints, Default::default()).unwrap()
}

/// Single-item outfits: every input is the mask token, so the preprocessor
/// only sees gradient through the targets.
fn single_item_batch() -> SequenceBatch<TrainBackend> {
    let items = [
        vec![vec![0.3, -0.2, 0.5, 0.1]],
        vec![vec![-0.4, 0.6, 0.0, 0.2]],
        vec![vec![0.1, 0.1, -0.7, 0.4]],
    ];
    let categories = [[2i64], [3], [4]];
    let sequences: Vec<(&[Vec<f32>], &[i64])> = items
        .iter()
        .zip(&categories)
        .map(|(features, cats)| (features.as_slice(), &cats[..]))
        .collect();
    let (items, categories, pad_mask) = pad_sequences::<TrainBackend>(&sequences, FEATURE_DIM, &Default::default());

    SequenceBatch {
        items,
        categories,
        pad_mask,
        mask_positions: vec![0, 0, 0],
        mask_categories: vec![2, 3, 4],
    }
}

fn embeddings(model: &Model, batch: &SequenceBatch<TrainBackend>) -> Vec<f32> {
    model.preprocess(batch).into_data().convert::<f32>().to_vec::<f32>().unwrap()
}

fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

#[test]
fn test_train_step_routes_target_gradient_by_policy() {
    let dir = tempfile::tempdir().unwrap();
    let base = HyperParams {
        with_mask_category_embedding: false,
        ..tiny_params(FEATURE_DIM, dir.path())
    };
    let initial = model(&base);
    let batch = single_item_batch();
    let before = embeddings(&initial, &batch);

    let detached_params = HyperParams {
        target_gradient_from: -1.0,
        ..base.clone()
    };
    let mut detached = trainer(detached_params, initial.clone(), &dir.path().join("detached"));
    assert_eq!(detached.state().gradient_policy.state(), TargetGradient::Detached);

    let attached_params = HyperParams {
        target_gradient_from: 0.0,
        ..base
    };
    let mut attached = trainer(attached_params, initial, &dir.path().join("attached"));
    assert_eq!(attached.state().gradient_policy.state(), TargetGradient::Attached);

    let (detached_loss, _) = detached.train_step(&batch).unwrap();
    let (attached_loss, _) = attached.train_step(&batch).unwrap();
    assert!(detached_loss.is_finite() && attached_loss.is_finite());

    let detached_after = embeddings(detached.model(), &batch);
    let attached_after = embeddings(attached.model(), &batch);
    assert_eq!(detached_after, before, "detached targets must leave the preprocessor untouched");
    assert!(
        max_abs_diff(&attached_after, &before) > 1e-6,
        "attached targets must update the preprocessor"
    );
}

#[test]
fn test_resume_applies_new_schedule_settings() {
    let dir = tempfile::tempdir().unwrap();
    let first_run = HyperParams {
        target_gradient_from: 0.0,
        early_stop: true,
        early_stop_patience: 8,
        early_stop_warmup: 0,
        ..tiny_params(FEATURE_DIM, dir.path())
    };

    let mut state = TrainingState::new(&first_run);
    state.epoch = 2;
    state.batch_count = 10;
    state.record_score(0.5);
    state.early_stopping.should_stop(0.5, 2);
    assert_eq!(state.gradient_policy.state(), TargetGradient::Attached);

    let manager = CheckpointManager::new(dir.path(), 3).unwrap();
    let optimizer = AdamConfig::new().init::<TrainBackend, Model>();
    manager
        .save::<TrainBackend, Model, _>(&model(&first_run), &optimizer, &state)
        .unwrap();

    let resumed_run = HyperParams {
        target_gradient_from: -1.0,
        early_stop_patience: 2,
        ..first_run.clone()
    };
    let resumed = trainer(resumed_run.clone(), model(&resumed_run), dir.path());

    let restored = resumed.state();
    assert_eq!(restored.epoch, 2);
    assert_eq!(restored.batch_count, 10);
    assert_eq!(restored.best_score, Some(0.5));
    assert_eq!(restored.gradient_policy.state(), TargetGradient::Detached);

    let mut monitor = restored.early_stopping.clone();
    assert_eq!(monitor.best(), Some(0.5));
    assert!(monitor.should_stop(0.1, 2), "patience 2 from the resumed run applies");
}
