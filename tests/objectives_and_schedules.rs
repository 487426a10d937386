// tests/objectives_and_schedules.rs - Objective agreement, early stopping and target-gradient schedule
use burn_autodiff::Autodiff;
use burn::tensor::{ElementConversion, Tensor};
use burn_ndarray::NdArray;
use fashion_encoder::fashion::architectures::base::early_stopping::EarlyStoppingMonitor;
use fashion_encoder::fashion::architectures::base::gradient_policy::{GradientPolicy, TargetGradient};
use fashion_encoder::fashion::architectures::base::loss_utils::{
    AccuracyCounter, CrossEntropyObjective, DistanceObjective, Objective, ObjectiveFn,
};
use fashion_encoder::fashion::architectures::base::train::TrainingState;
use fashion_encoder::test_utils::tensor_from_f32_vec;
use fashion_encoder::{EncoderError, HyperParams, Preset};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

type TestBackend = NdArray<f32>;
type TrainBackend = Autodiff<NdArray<f32>>;

fn objectives() -> Vec<ObjectiveFn> {
    let mut all = Vec::new();
    for categorywise_only in [false, true] {
        all.push(ObjectiveFn::CrossEntropy(CrossEntropyObjective {
            categorywise_only,
            temperature: 0.1,
        }));
        all.push(ObjectiveFn::Distance(DistanceObjective {
            margin: 0.5,
            categorywise_only,
        }));
    }
    all
}

#[test]
fn test_both_modes_fully_accurate_when_prediction_equals_target() {
    let device = Default::default();
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let (rows, hidden) = (12, 6);
    let values: Vec<f32> = (0..rows * hidden).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    let categories: Vec<i64> = (0..rows).map(|i| 2 + (i % 3) as i64).collect();

    for objective in objectives() {
        let embeddings: Tensor<TestBackend, 2> = tensor_from_f32_vec(&values, [rows, hidden], &device);
        let counter = objective
            .batch_accuracy(embeddings.clone(), embeddings.clone(), &categories)
            .unwrap();
        assert_eq!(counter, AccuracyCounter { correct: rows, total: rows }, "{:?}", objective);

        for answer in 0..rows {
            let prediction = embeddings.clone().slice([answer..answer + 1, 0..hidden]);
            assert!(objective.is_correct(prediction, embeddings.clone(), answer).unwrap());
        }
    }
}

#[test]
fn test_modes_split_on_scaled_near_tie() {
    let device = Default::default();
    let prediction: Tensor<TestBackend, 2> = tensor_from_f32_vec(&[1.0, 0.0], [1, 2], &device);
    // Candidate 0 has the same direction at twice the length; candidate 1 is nearby but rotated.
    let candidates: Tensor<TestBackend, 2> = tensor_from_f32_vec(&[2.0, 0.0, 0.95, 0.1], [2, 2], &device);

    let cross = ObjectiveFn::CrossEntropy(CrossEntropyObjective {
        categorywise_only: false,
        temperature: 0.1,
    });
    let distance = ObjectiveFn::Distance(DistanceObjective {
        margin: 0.5,
        categorywise_only: false,
    });

    assert!(cross.is_correct(prediction.clone(), candidates.clone(), 0).unwrap());
    assert!(!cross.is_correct(prediction.clone(), candidates.clone(), 1).unwrap());
    assert!(distance.is_correct(prediction.clone(), candidates.clone(), 1).unwrap());
    assert!(!distance.is_correct(prediction, candidates, 0).unwrap());
}

#[test]
fn test_losses_backpropagate_on_autodiff_backend() {
    let device = Default::default();
    let outputs: Tensor<TrainBackend, 2> =
        tensor_from_f32_vec(&[0.2, 0.1, 0.9, -0.3, 0.4, 0.4], [3, 2], &device).require_grad();
    let targets: Tensor<TrainBackend, 2> = tensor_from_f32_vec(&[0.1, 0.3, 0.8, -0.1, 0.5, 0.2], [3, 2], &device);

    for objective in objectives() {
        let loss = objective.loss(outputs.clone(), targets.clone(), &[2, 2, 3]);
        let value = loss.clone().into_scalar().elem::<f32>();
        assert!(value.is_finite() && value >= 0.0, "{:?}: {}", objective, value);

        let grads = loss.backward();
        assert!(outputs.grad(&grads).is_some(), "{:?}", objective);
    }
}

#[test]
fn test_objective_selected_once_from_settings() {
    let cross = Preset::Base.params();
    assert!(matches!(ObjectiveFn::from_params(&cross).unwrap(), ObjectiveFn::CrossEntropy(_)));

    let distance = Preset::DistanceBase.params();
    match ObjectiveFn::from_params(&distance).unwrap() {
        ObjectiveFn::Distance(objective) => assert_eq!(objective.margin, 0.5),
        other => panic!("expected distance objective, got {:?}", other),
    }

    let unknown = HyperParams {
        loss: "contrastive".to_string(),
        ..Preset::Base.params()
    };
    assert!(matches!(
        ObjectiveFn::from_params(&unknown),
        Err(EncoderError::UnsupportedLoss(_))
    ));
}

#[test]
fn test_early_stopping_plateau_and_improvement() {
    let mut plateau = EarlyStoppingMonitor::new(2, 0.01, 0);
    let decisions: Vec<bool> = [0.5, 0.51, 0.51, 0.51]
        .into_iter()
        .map(|score| plateau.should_stop(score, 2))
        .collect();
    assert_eq!(decisions.iter().position(|&stop| stop), Some(2));

    let mut improving = EarlyStoppingMonitor::new(2, 0.01, 0);
    assert!([0.5, 0.6, 0.7].into_iter().all(|score| !improving.should_stop(score, 2)));
}

#[test]
fn test_target_gradient_never_redetaches() {
    let params = HyperParams {
        target_gradient_from: 0.5,
        with_category_grouping: false,
        ..HyperParams::default()
    };
    let mut state = TrainingState::new(&params);

    let mut states = Vec::new();
    for score in [0.2, 0.4, 0.6, 0.3, 0.1, 0.0] {
        state.record_score(score);
        states.push(state.gradient_policy.state());
    }

    let attached_from = states
        .iter()
        .position(|&s| s == TargetGradient::Attached)
        .unwrap();
    assert_eq!(attached_from, 2);
    assert!(states[attached_from..].iter().all(|&s| s == TargetGradient::Attached));
}

#[test]
fn test_detached_targets_receive_no_gradient() {
    let device = Default::default();
    let targets: Tensor<TrainBackend, 2> = tensor_from_f32_vec(&[1.0, 2.0, 3.0, 4.0], [2, 2], &device).require_grad();
    let outputs: Tensor<TrainBackend, 2> = tensor_from_f32_vec(&[0.5, 0.5, 0.5, 0.5], [2, 2], &device).require_grad();

    let mut policy = GradientPolicy::from_setting(0.9);
    let grads = (outputs.clone() * policy.apply(targets.clone())).sum().backward();
    assert!(targets.grad(&grads).is_none());
    assert!(outputs.grad(&grads).is_some());

    policy.observe(0.95);
    let grads = (outputs.clone() * policy.apply(targets.clone())).sum().backward();
    assert!(targets.grad(&grads).is_some());
}
