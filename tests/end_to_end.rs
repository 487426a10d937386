// tests/end_to_end.rs - Full training runs through EncoderTask on synthetic shards
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use fashion_encoder::fashion::architectures::base::checkpoint::CheckpointManager;
use fashion_encoder::fashion::architectures::base::encoder::FashionEncoderConfig;
use fashion_encoder::fashion::architectures::base::telemetry::{self, CsvSink, MemorySink};
use fashion_encoder::fashion::architectures::base::train::EncoderTrainer;
use fashion_encoder::fashion::data::record::write_records;
use fashion_encoder::fashion::settings::ValidationMode;
use fashion_encoder::fashion::task::{EncoderObserver, EncoderTask};
use fashion_encoder::test_utils::{synthetic_fitb, synthetic_outfits, tiny_params};
use fashion_encoder::{EncoderError, HyperParams};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

type TrainBackend = Autodiff<NdArray<f32>>;

const FEATURE_DIM: usize = 4;

/// Training shard, validation FITB file and a ready configuration under `root`.
fn fixture(root: &Path) -> HyperParams {
    let train = root.join("train.jsonl");
    let fitb = root.join("fitb.jsonl");
    write_records(&train, &synthetic_outfits(10, 3, 5, FEATURE_DIM, 8, 17)).unwrap();
    write_records(&fitb, &synthetic_fitb(6, 3, 4, FEATURE_DIM, 8, 18)).unwrap();

    HyperParams {
        dataset_files: vec![train],
        fitb_file: Some(fitb),
        ..tiny_params(FEATURE_DIM, &root.join("ckpts"))
    }
}

fn recording_observer(ckpt_dir: &Path, epochs: Rc<RefCell<Vec<usize>>>) -> EncoderObserver<TrainBackend> {
    let ckpt_dir = ckpt_dir.to_path_buf();
    Box::new(move |_model, score, epoch| {
        assert!((0.0..=1.0).contains(&score));
        let manager = CheckpointManager::new(&ckpt_dir, 3).unwrap();
        assert!(manager.best_weights_path().exists(), "best weights missing at epoch {}", epoch);
        assert!(manager.latest().unwrap().is_some(), "no rolling checkpoint at epoch {}", epoch);
        epochs.borrow_mut().push(epoch);
        Ok(())
    })
}

#[test]
fn test_training_run_validates_checkpoints_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let params = HyperParams {
        log_dir: Some(dir.path().join("logs")),
        ..fixture(dir.path())
    };
    let ckpt_dir = params.checkpoint_dir.clone().unwrap();
    let task = EncoderTask::new(params).unwrap();
    let device = Default::default();

    let epochs = Rc::new(RefCell::new(Vec::new()));
    let report = task
        .train_with_observers::<TrainBackend>(device, vec![recording_observer(&ckpt_dir, epochs.clone())])
        .unwrap();

    assert_eq!(*epochs.borrow(), vec![2, 4]);
    assert_eq!(report.epochs_run, 4);
    assert_eq!(report.batch_count, 20);
    assert!(!report.stopped_early);
    assert!(report.best_score.is_some());
    assert!(report.test_accuracy.is_some_and(|acc| (0.0..=1.0).contains(&acc)));

    let metrics = std::fs::read_to_string(dir.path().join("logs").join(CsvSink::FILE_NAME)).unwrap();
    assert!(metrics.lines().any(|line| line.starts_with("valid_acc,4,")));
    assert!(metrics.lines().any(|line| line.starts_with("test_acc,")));

    let resumed = task.train::<TrainBackend>(Default::default()).unwrap();
    assert_eq!(resumed.epochs_run, 4);
    assert_eq!(resumed.batch_count, 20);
    assert_eq!(resumed.best_score, report.best_score);
}

#[test]
fn test_observer_failure_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let task = EncoderTask::new(fixture(dir.path())).unwrap();

    let failing: EncoderObserver<TrainBackend> = Box::new(|_model, _score, _epoch| Err("disk full".into()));
    let result = task.train_with_observers::<TrainBackend>(Default::default(), vec![failing]);

    match result {
        Err(EncoderError::Observer { epoch, reason }) => {
            assert_eq!(epoch, 2);
            assert!(reason.contains("disk full"));
        }
        other => panic!("expected observer error, got {:?}", other.map(|r| r.epochs_run)),
    }
}

#[test]
fn test_early_stop_on_plateau() {
    let dir = tempfile::tempdir().unwrap();
    let params = HyperParams {
        epoch_count: 10,
        early_stop: true,
        early_stop_patience: 1,
        early_stop_delta: 1.0,
        early_stop_warmup: 0,
        ..fixture(dir.path())
    };

    let report = EncoderTask::new(params)
        .unwrap()
        .train::<TrainBackend>(Default::default())
        .unwrap();
    assert!(report.stopped_early);
    assert_eq!(report.epochs_run, 4);
    assert_eq!(report.batch_count, 20);
}

#[test]
fn test_distance_objective_with_masking_validation_and_grouping() {
    let dir = tempfile::tempdir().unwrap();
    let valid = dir.path().join("valid.jsonl");
    write_records(&valid, &synthetic_outfits(4, 3, 4, FEATURE_DIM, 8, 19)).unwrap();

    let categories = dir.path().join("categories.csv");
    std::fs::write(
        &categories,
        "id,name,group\n2,tee,tops\n3,shirt,tops\n4,jeans,bottoms\n5,skirt,bottoms\n6,boots,shoes\n7,hat,accessories\n",
    )
    .unwrap();

    let params = HyperParams {
        loss: "distance".to_string(),
        margin: 0.5,
        validation_mode: ValidationMode::Masking,
        valid_files: vec![valid],
        fitb_file: None,
        with_category_grouping: true,
        category_file: Some(categories),
        categorywise_train: true,
        ..fixture(dir.path())
    };

    let task = EncoderTask::new(params).unwrap();
    let lookup = task.category_lookup().unwrap().unwrap();
    assert_eq!(lookup.max_group(), Some(5));

    let report = task.train::<TrainBackend>(Default::default()).unwrap();
    assert_eq!(report.batch_count, 20);
    assert!(report.best_score.is_some_and(|acc| (0.0..=1.0).contains(&acc)));
    assert_eq!(report.test_accuracy, None);
}

#[test]
fn test_group_ids_must_fit_the_embedding_table() {
    let dir = tempfile::tempdir().unwrap();
    let categories = dir.path().join("categories.csv");
    std::fs::write(&categories, "2,tops\n3,bottoms\n4,shoes\n5,bags\n").unwrap();

    let params = HyperParams {
        with_category_grouping: true,
        category_file: Some(categories),
        categories_count: 5,
        ..fixture(dir.path())
    };
    let task = EncoderTask::new(params).unwrap();
    assert!(matches!(task.category_lookup(), Err(EncoderError::InvalidConfig(_))));
}

#[test]
fn test_missing_validation_data_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let params = HyperParams {
        validation_mode: ValidationMode::Masking,
        ..fixture(dir.path())
    };

    let result = EncoderTask::new(params)
        .unwrap()
        .train::<TrainBackend>(Default::default());
    assert!(matches!(result, Err(EncoderError::InvalidConfig(_))));
}

#[test]
fn test_debug_trace_after_training() {
    let dir = tempfile::tempdir().unwrap();
    let params = HyperParams {
        epoch_count: 2,
        ..fixture(dir.path())
    };
    let task = EncoderTask::new(params).unwrap();

    let fresh = task.debug::<TrainBackend>(Default::default()).unwrap();
    assert!(fresh.fitb_correct.is_some());
    assert!(fresh.train_loss.is_some_and(f64::is_finite));

    task.train::<TrainBackend>(Default::default()).unwrap();
    let trained = task.debug::<TrainBackend>(Default::default()).unwrap();
    assert!(trained.fitb_correct.is_some());
    assert!(trained.train_loss.is_some_and(|loss| loss.is_finite() && loss >= 0.0));
}

#[test]
fn test_trainer_emits_metric_series() {
    let dir = tempfile::tempdir().unwrap();
    let params = fixture(dir.path());
    let task = EncoderTask::new(params.clone()).unwrap();
    let data = task.get_datasets().unwrap();
    let device = Default::default();

    let model = FashionEncoderConfig::from_params(&params).init::<TrainBackend>(&device);
    let checkpoints = CheckpointManager::new(task.checkpoint_dir(), params.max_checkpoints).unwrap();
    let sink = MemorySink::new();
    let mut trainer = EncoderTrainer::<TrainBackend, _>::new(params, model, checkpoints, device)
        .unwrap()
        .with_sink(sink.clone());
    trainer.fit(&data).unwrap();

    let steps: Vec<usize> = sink.series(telemetry::LOSS).into_iter().map(|(step, _)| step).collect();
    assert_eq!(steps, (1..=20).collect::<Vec<_>>());
    assert_eq!(sink.series(telemetry::BATCH_ACC).len(), 20);
    assert_eq!(sink.series(telemetry::EPOCH_LOSS).len(), 4);
    assert_eq!(sink.series(telemetry::EPOCH_ACC).len(), 4);

    let validation: Vec<usize> = sink.series(telemetry::VALID_ACC).into_iter().map(|(epoch, _)| epoch).collect();
    assert_eq!(validation, vec![2, 4]);
    assert_eq!(sink.series(telemetry::TEST_ACC).len(), 1);
    assert_eq!(trainer.state().batch_count, 20);
}
