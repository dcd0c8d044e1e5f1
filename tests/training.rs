use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use simple_ocr::accelerated::AcceleratedExecutor;
use simple_ocr::backend::{Backend, CpuExecutor, Executor};
use simple_ocr::dataset::Dataset;
use simple_ocr::error::OcrError;
use simple_ocr::model::NeuralNetworkParameters;
use simple_ocr::ops::emulated::EmulatedDevice;
use simple_ocr::tensors::Matrix;
use simple_ocr::train::{EpochStats, TrainConfig, Trainer, TrainingOutcome, TrainingState};

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-4, "{actual:?} != {expected:?}");
    }
}

fn tiny_params() -> NeuralNetworkParameters {
    NeuralNetworkParameters::new(
        Matrix::from_vec(3, 2, vec![0.1, 0.2, -0.1, 0.3, 0.05, -0.2]).unwrap(),
        vec![0.0, 0.1],
        Matrix::from_vec(2, 2, vec![0.3, -0.3, 0.2, 0.4]).unwrap(),
        vec![0.05, -0.05],
    )
    .unwrap()
}

fn tiny_data() -> Dataset {
    Dataset::new(vec![vec![1.0, 0.0, 1.0], vec![0.0, 1.0, 1.0]], vec![0, 1]).unwrap()
}

fn tiny_config() -> TrainConfig {
    TrainConfig {
        batch_size: 2,
        learning_rate: 0.5,
        seed: Some(1),
        ..TrainConfig::default()
    }
}

fn check_tiny_step(trainer: &Trainer) {
    let p = trainer.params();
    assert_close(p.w1.data(), &[0.11571, 0.194747, -0.121368, 0.307056, 0.044342, -0.198197]);
    assert_close(&p.b1, &[-0.005658, 0.101803]);
    assert_close(p.w2.data(), &[0.287115, -0.287115, 0.176918, 0.423082]);
    assert_close(&p.b2, &[0.012782, -0.012782]);
}

#[test]
fn test_single_sgd_step_matches_hand_computation() {
    let mut trainer = Trainer::with_executor(tiny_params(), Box::new(CpuExecutor), tiny_config()).unwrap();
    let error = trainer.train_batch(&tiny_data(), &[0, 1]).unwrap();
    assert!((error - 1.391_321).abs() < 1e-4);
    check_tiny_step(&trainer);
}

#[test]
fn test_single_sgd_step_on_emulated_device() {
    let exec = AcceleratedExecutor::new(EmulatedDevice::new());
    let mut trainer = Trainer::with_executor(tiny_params(), Box::new(exec), tiny_config()).unwrap();
    trainer.train_batch(&tiny_data(), &[1, 0]).unwrap();
    check_tiny_step(&trainer);
}

#[test]
fn test_train_batch_scales_by_its_own_length() {
    // config batch size is 2; a lone sample still takes a full mean step
    let mut trainer = Trainer::with_executor(tiny_params(), Box::new(CpuExecutor), tiny_config()).unwrap();
    let data = tiny_data();
    let (x, label) = data.sample(1).unwrap();
    let grads = CpuExecutor.backward(x, &tiny_params(), label, 1).unwrap();
    let mut expected = Trainer::with_executor(tiny_params(), Box::new(CpuExecutor), tiny_config()).unwrap();
    expected.apply_gradients(&grads).unwrap();

    let error = trainer.train_batch(&data, &[1]).unwrap();
    assert!((error - grads.cross_entropy_error).abs() < 1e-6);
    assert_close(trainer.params().w1.data(), expected.params().w1.data());
    assert_close(&trainer.params().b2, &expected.params().b2);
    assert_eq!(trainer.state(), TrainingState::Idle);
}

#[test]
fn test_failed_or_empty_batch_leaves_trainer_idle() {
    let mut trainer = Trainer::with_executor(tiny_params(), Box::new(CpuExecutor), tiny_config()).unwrap();
    assert!(matches!(
        trainer.train_batch(&tiny_data(), &[]),
        Err(OcrError::DivideByZero(_))
    ));
    assert!(matches!(
        trainer.train_batch(&tiny_data(), &[0, 7]),
        Err(OcrError::IndexOutOfRange { index: 7, len: 2 })
    ));
    assert_eq!(trainer.state(), TrainingState::Idle);
    assert_eq!(trainer.params(), &tiny_params());
}

#[test]
fn test_epoch_reports_mean_loss() {
    let mut trainer = Trainer::with_executor(tiny_params(), Box::new(CpuExecutor), tiny_config()).unwrap();
    let stats = trainer.train_epoch(&tiny_data()).unwrap();
    assert_eq!(stats.epoch, 1);
    assert_eq!(stats.batches, 1);
    assert!(stats.completed);
    assert_eq!(stats.loss_delta, None);
    assert!((stats.average_loss - 1.391_321 / 2.0).abs() < 1e-4);
    assert_eq!(trainer.previous_loss(), Some(stats.average_loss));
    assert_eq!(trainer.state(), TrainingState::Idle);
}

fn separable(n: usize, seed: u64) -> Dataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut inputs: Vec<Vec<f32>> = Vec::with_capacity(n);
    let mut labels = Vec::with_capacity(n);
    for i in 0..n {
        let label = i % 2;
        let hot: [f32; 4] = if label == 0 { [1.0, 1.0, 0.0, 0.0] } else { [0.0, 0.0, 1.0, 1.0] };
        inputs.push(hot.iter().map(|&v| v + rng.random_range(-0.1f32..0.1)).collect());
        labels.push(label);
    }
    Dataset::new(inputs, labels).unwrap()
}

#[test]
fn test_loss_decreases_on_separable_data() {
    let (tx, rx) = mpsc::channel();
    let config = TrainConfig {
        hidden_dim: 8,
        label_dim: 2,
        batch_size: 4,
        learning_rate: 0.5,
        max_epochs: 30,
        loss_termination_threshold: 0.0,
        seed: Some(42),
        ..TrainConfig::default()
    }
    .with_progress(tx);
    let data = separable(40, 3);

    let mut trainer = Trainer::new(4, config).unwrap();
    let report = trainer.train(&data).unwrap();
    assert_eq!(report.outcome, TrainingOutcome::Completed);
    assert_eq!(report.epochs_run, 30);

    let stats: Vec<EpochStats> = rx.try_iter().collect();
    assert_eq!(stats.len(), 30);
    assert!(stats.iter().all(|s| s.batches == 10 && s.total_epochs == 30));
    let first = stats[0].average_loss;
    let last = stats[29].average_loss;
    assert!(last < first, "loss went from {first} to {last}");
    assert_eq!(report.final_loss, Some(last));

    assert!(trainer.evaluate(&data).unwrap() >= 0.9);
    assert!(trainer.evaluate(&separable(20, 99)).unwrap() >= 0.9);
}

#[test]
fn test_same_seed_gives_same_parameters() {
    let config = TrainConfig {
        hidden_dim: 3,
        label_dim: 2,
        batch_size: 4,
        max_epochs: 2,
        seed: Some(8),
        ..TrainConfig::default()
    };
    let data = separable(12, 4);
    let mut a = Trainer::new(4, config.clone()).unwrap();
    let mut b = Trainer::new(4, config).unwrap();
    a.train(&data).unwrap();
    b.train(&data).unwrap();
    assert_eq!(a.params(), b.params());
}

#[test]
fn test_converged_loss_stops_early() {
    let config = TrainConfig {
        hidden_dim: 4,
        label_dim: 2,
        batch_size: 2,
        max_epochs: 5,
        loss_termination_threshold: 10.0,
        seed: Some(2),
        ..TrainConfig::default()
    };
    let mut trainer = Trainer::new(4, config).unwrap();
    let report = trainer.train(&separable(8, 1)).unwrap();
    assert_eq!(report.outcome, TrainingOutcome::EarlyStopped);
    assert_eq!(report.epochs_run, 2);
    assert_eq!(trainer.state(), TrainingState::EarlyStopped);
}

#[test]
fn test_training_stops_at_first_converged_epoch() {
    const THRESHOLD: f32 = 1e-3;
    let (tx, rx) = mpsc::channel();
    let config = TrainConfig {
        hidden_dim: 8,
        label_dim: 2,
        batch_size: 4,
        learning_rate: 0.5,
        max_epochs: 100,
        loss_termination_threshold: THRESHOLD,
        seed: Some(11),
        ..TrainConfig::default()
    }
    .with_progress(tx);

    let mut trainer = Trainer::new(4, config).unwrap();
    let report = trainer.train(&separable(40, 5)).unwrap();
    let stats: Vec<EpochStats> = rx.try_iter().collect();

    assert_eq!(report.outcome, TrainingOutcome::EarlyStopped);
    assert_eq!(trainer.state(), TrainingState::EarlyStopped);
    assert_eq!(report.epochs_run, stats.len());
    assert!(stats.len() > 2 && stats.len() < 100, "stopped after {} epochs", stats.len());

    let (last, earlier) = stats.split_last().unwrap();
    assert!(last.loss_delta.unwrap() < THRESHOLD);
    assert_eq!(earlier[0].loss_delta, None);
    for s in &earlier[1..] {
        let delta = s.loss_delta.unwrap();
        assert!(delta >= THRESHOLD, "epoch {} already converged: {delta}", s.epoch);
    }

    for pair in stats.windows(2) {
        let (prev, next) = (pair[0].average_loss, pair[1].average_loss);
        assert!(next <= prev + 1e-4, "loss rose from {prev} to {next} at epoch {}", pair[1].epoch);
        assert!((pair[1].loss_delta.unwrap() - (next - prev).abs()).abs() < 1e-6);
    }
    assert_eq!(report.final_loss, Some(last.average_loss));
}

#[test]
fn test_raised_stop_flag_cancels() {
    let flag = Arc::new(AtomicBool::new(true));
    let config = TrainConfig {
        hidden_dim: 4,
        label_dim: 2,
        batch_size: 2,
        seed: Some(2),
        ..TrainConfig::default()
    }
    .with_stop_flag(flag);
    let mut trainer = Trainer::new(4, config).unwrap();
    let before = trainer.params().clone();

    let stats = trainer.train_epoch(&separable(8, 1)).unwrap();
    assert!(!stats.completed);
    assert_eq!(stats.batches, 0);

    let report = trainer.train(&separable(8, 1)).unwrap();
    assert_eq!(report.outcome, TrainingOutcome::Cancelled);
    assert_eq!(report.epochs_run, 0);
    assert_eq!(report.final_loss, None);
    assert_eq!(trainer.params(), &before);
}

#[test]
fn test_dropped_progress_receiver_cancels() {
    let (tx, rx) = mpsc::channel();
    drop(rx);
    let config = TrainConfig {
        hidden_dim: 4,
        label_dim: 2,
        batch_size: 2,
        max_epochs: 5,
        seed: Some(2),
        ..TrainConfig::default()
    }
    .with_progress(tx);
    let mut trainer = Trainer::new(4, config).unwrap();
    let report = trainer.train(&separable(8, 1)).unwrap();
    assert_eq!(report.outcome, TrainingOutcome::Cancelled);
    assert_eq!(report.epochs_run, 1);
}

#[test]
fn test_trailing_partial_batch_is_dropped() {
    let config = TrainConfig {
        hidden_dim: 3,
        label_dim: 2,
        batch_size: 2,
        seed: Some(6),
        ..TrainConfig::default()
    };
    let mut trainer = Trainer::new(4, config).unwrap();
    let stats = trainer.train_epoch(&separable(5, 2)).unwrap();
    assert_eq!(stats.batches, 2);
}

#[test]
fn test_dataset_smaller_than_a_batch_is_rejected() {
    let config = TrainConfig {
        hidden_dim: 3,
        label_dim: 2,
        batch_size: 10,
        ..TrainConfig::default()
    };
    let mut trainer = Trainer::new(4, config).unwrap();
    assert!(matches!(
        trainer.train_epoch(&separable(4, 2)),
        Err(OcrError::InvalidConfig(_))
    ));
}

#[test]
fn test_out_of_range_label_fails_the_batch() {
    let data = Dataset::new(vec![vec![1.0, 0.0, 1.0], vec![0.0, 1.0, 1.0]], vec![0, 5]).unwrap();
    let mut trainer = Trainer::with_executor(tiny_params(), Box::new(CpuExecutor), tiny_config()).unwrap();
    assert!(matches!(
        trainer.train_epoch(&data),
        Err(OcrError::IndexOutOfRange { index: 5, len: 2 })
    ));
    assert_eq!(trainer.state(), TrainingState::Idle);
}

#[test]
fn test_mismatched_and_empty_datasets_are_rejected() {
    let mut trainer = Trainer::with_executor(tiny_params(), Box::new(CpuExecutor), tiny_config()).unwrap();
    assert!(matches!(
        trainer.evaluate(&separable(4, 1)),
        Err(OcrError::DimensionMismatch { .. })
    ));
    assert!(matches!(
        trainer.evaluate(&Dataset::default()),
        Err(OcrError::InvalidConfig(_))
    ));
}

#[test]
fn test_classify_uses_the_executor() {
    let mut trainer = Trainer::with_executor(tiny_params(), Box::new(CpuExecutor), tiny_config()).unwrap();
    assert_eq!(trainer.executor_name(), "cpu");
    let predicted = trainer.classify(&[1.0, 0.0, 1.0]).unwrap();
    assert!(predicted < 2);
}

#[test]
fn test_cross_checked_backend_trains() {
    let config = TrainConfig {
        hidden_dim: 4,
        label_dim: 2,
        batch_size: 2,
        max_epochs: 1,
        seed: Some(3),
        backend: Backend::Emulated,
        cross_check: true,
        ..TrainConfig::default()
    };
    let mut trainer = Trainer::new(4, config).unwrap();
    assert_eq!(trainer.executor_name(), "emulated+cross-check");
    assert_eq!(trainer.train(&separable(4, 5)).unwrap().epochs_run, 1);
}

#[cfg(not(feature = "wgpu"))]
#[test]
fn test_wgpu_backend_needs_the_feature() {
    let config = TrainConfig {
        backend: Backend::Wgpu,
        ..TrainConfig::default()
    };
    assert!(matches!(
        Trainer::new(4, config),
        Err(OcrError::BackendUnavailable("wgpu"))
    ));
}
