use super::*;
use crate::{
    criterion, layer, loss,
    optim::{BatchKind, StochKind},
    task::MemoryTask,
    tensor::{Dims, Tensor},
    Vector,
};
use approx::assert_relative_eq;
use rand::Rng;

/// `t = A * x + b` with `A = [[1, -2, 0.5], [0, 1, 3]]` and `b = [0.25, -1]`.
fn linear_task(train: usize, valid: usize, test: usize) -> MemoryTask {
    let mut rng = StdRng::seed_from_u64(7);
    let mut task = MemoryTask::new(Dims::flat(3), Dims::flat(2));
    let folds = [(Fold::train(0), train), (Fold::valid(0), valid), (Fold::test(0), test)];
    for (fold, size) in folds {
        for _ in 0..size {
            let x: Vec<Scalar> = (0..3).map(|_| rng.gen_range(-1. ..1.)).collect();
            let t = vec![
                x[0] - 2. * x[1] + 0.5 * x[2] + 0.25,
                x[1] + 3. * x[2] - 1.,
            ];
            task.push(
                fold,
                Tensor::from_vec(Dims::flat(3), x).unwrap(),
                Tensor::from_vec(Dims::flat(2), t).unwrap(),
            )
            .unwrap();
        }
    }
    task
}

fn network(seed: u64) -> Network {
    let mut network =
        Network::from_description(&layer::registry(), Dims::flat(3), "affine:dims=2").unwrap();
    network.random_params(&mut StdRng::seed_from_u64(seed));
    network
}

fn train(
    config: TrainerConfig,
    network: &mut Network,
    task: &MemoryTask,
) -> Result<TrainerResult> {
    let loss: Arc<dyn Loss> = loss::registry().build("square")?.into();
    let criterion: Arc<dyn Criterion> = criterion::registry().build("avg")?.into();
    Trainer::new(config).train(network, task, 0, loss, criterion)
}

#[test]
fn lbfgs_solves_linear_regression() {
    let task = linear_task(40, 10, 10);
    let mut network = network(0);
    let config = TrainerConfig::default()
        .with_threads(2)
        .with_optimizer(BatchConfig::new(BatchKind::Lbfgs));
    let result = train(config, &mut network, &task).unwrap();
    assert_eq!(result.status(), TrainerStatus::Solved);
    let history = result.history();
    assert!(history.len() > 1);
    for (epoch, state) in history.iter().enumerate() {
        assert_eq!(state.epoch, epoch);
        assert_eq!(state.train.count, 40);
        assert_eq!(state.valid.count, 10);
        assert_eq!(state.test.count, 10);
    }
    assert!(history.last().unwrap().train.value < history[0].train.value);
    let optimum = result.optimum().unwrap();
    assert!(optimum.valid.value < 1e-8, "{optimum:?}");
    assert!(optimum.test.value < 1e-8);
    assert_eq!(&network.save_params(), result.optimum_params());
    let expected = [1., -2., 0.5, 0., 1., 3., 0.25, -1.];
    for (x, e) in network.save_params().iter().zip(expected) {
        assert_relative_eq!(*x, e, epsilon = 1e-4);
    }
}

#[test]
fn stochastic_runs_are_reproducible() {
    let task = linear_task(50, 0, 0);
    let config = TrainerConfig::default()
        .with_epochs(5)
        .with_threads(1)
        .with_seed(3)
        .with_optimizer(
            StochConfig::new(StochKind::Sgm)
                .with_batch_size(8)
                .with_rate(LearningRate::constant(0.02)),
        );
    let mut first = network(1);
    let a = train(config.clone(), &mut first, &task).unwrap();
    let mut second = network(1);
    let b = train(config.clone(), &mut second, &task).unwrap();
    assert_eq!(a.history().len(), 6);
    for (a, b) in a.history().iter().zip(b.history()) {
        assert_eq!(a.train, b.train);
        // No validation samples, the train measurement stands in.
        assert_eq!(a.valid, a.train);
        assert_eq!(a.test.count, 0);
    }
    assert_eq!(first.save_params(), second.save_params());
    let c = train(config.with_seed(4), &mut network(1), &task).unwrap();
    assert_ne!(c.history()[1].train, a.history()[1].train);
    assert!(a.optimum().unwrap().train.value < a.history()[0].train.value);
}

#[test]
fn rate_tuning_picks_the_best_candidate() {
    let task = linear_task(40, 10, 0);
    let config = TrainerConfig::default()
        .with_epochs(3)
        .with_threads(1)
        .with_optimizer(
            StochConfig::new(StochKind::Sg)
                .with_batch_size(4)
                .with_tuning(vec![1e-5, 0.05, 50.], 2),
        );
    let mut network = network(2);
    let result = train(config, &mut network, &task).unwrap();
    assert_eq!(result.tuned_rate(), Some(0.05));
    assert_eq!(result.history()[0].epoch, 0);
    assert!(result.optimum().unwrap().valid.value < result.history()[0].valid.value);
}

#[test]
fn invalid_runs() {
    let task = linear_task(4, 0, 0);
    let mut wrong_input =
        Network::from_description(&layer::registry(), Dims::flat(2), "affine:dims=2").unwrap();
    assert!(train(TrainerConfig::default(), &mut wrong_input, &task).is_err());
    let mut wrong_output =
        Network::from_description(&layer::registry(), Dims::flat(3), "affine:dims=1").unwrap();
    assert!(train(TrainerConfig::default(), &mut wrong_output, &task).is_err());
    let empty = linear_task(0, 3, 0);
    assert!(train(TrainerConfig::default(), &mut network(0), &empty).is_err());
    let loss: Arc<dyn Loss> = loss::registry().build("square").unwrap().into();
    let criterion: Arc<dyn Criterion> = criterion::registry().build("avg").unwrap().into();
    assert!(Trainer::default()
        .train(&mut network(0), &task, 1, loss, criterion)
        .is_err());
    let bad_optimizer = TrainerConfig::default()
        .with_optimizer(StochConfig::new(StochKind::Adam).with_batch_size(0));
    assert!(train(bad_optimizer, &mut network(0), &task).is_err());
}

fn state(epoch: usize, valid: Scalar) -> TrainerState {
    let evaluation = Evaluation {
        value: valid,
        error: 0.,
        count: 1,
    };
    TrainerState {
        epoch,
        train: evaluation,
        valid: evaluation,
        ..TrainerState::default()
    }
}

#[test]
fn status_updates() {
    let params = |x: Scalar| Vector::from(vec![x]);
    let mut result = TrainerResult::new(TrainerConfig::default().with_patience(1));
    assert_eq!(result.update(state(0, 2.), &params(0.), OptStatus::Running), TrainerStatus::Better);
    assert_eq!(result.update(state(1, 1.), &params(1.), OptStatus::Running), TrainerStatus::Better);
    assert_eq!(result.update(state(2, 1.), &params(2.), OptStatus::Running), TrainerStatus::Worse);
    assert_eq!(result.update(state(3, 3.), &params(3.), OptStatus::Running), TrainerStatus::Overfit);
    assert!(result.status().is_terminal());
    assert_eq!(result.optimum().unwrap().epoch, 1);
    assert_eq!(result.optimum_params(), &params(1.));
    assert_eq!(result.history().len(), 4);

    let mut result = TrainerResult::new(TrainerConfig::default());
    assert_eq!(result.update(state(0, 1.), &params(0.), OptStatus::Running), TrainerStatus::Better);
    assert_eq!(
        result.update(state(1, Scalar::NAN), &params(1.), OptStatus::Running),
        TrainerStatus::Diverge
    );
    assert_eq!(result.optimum().unwrap().epoch, 0);
    assert_eq!(result.update(state(2, 0.5), &params(2.), OptStatus::Converged), TrainerStatus::Solved);
    assert_eq!(result.optimum().unwrap().epoch, 2);
    assert_eq!(result.update(state(3, 0.1), &params(3.), OptStatus::Failed), TrainerStatus::Failed);
    assert_eq!(result.update(state(4, 0.1), &params(4.), OptStatus::Diverged), TrainerStatus::Diverge);
    assert_eq!(result.optimum().unwrap().epoch, 2);
    for status in [TrainerStatus::Better, TrainerStatus::Worse] {
        assert!(!status.is_terminal());
    }
}

#[test]
fn table() {
    let mut result = TrainerResult::new(TrainerConfig::default());
    result.update(state(0, 2.), &Vector::zeros(1), OptStatus::Running);
    let mut with_test = state(1, 1.);
    with_test.test = with_test.valid;
    result.update(with_test, &Vector::zeros(1), OptStatus::Running);
    let mut buffer = Vec::new();
    result.write_table(&mut buffer).unwrap();
    let text = String::from_utf8(buffer).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].trim_start().starts_with("epoch"));
    assert_eq!(lines[1].split_whitespace().next(), Some("0"));
    assert!(lines[1].split_whitespace().any(|x| x == "-"));
    assert!(!lines[2].split_whitespace().any(|x| x == "-"));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.txt");
    result.save_table(&path).unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), text);
}

#[test]
fn config_serde() {
    let config = TrainerConfig::default()
        .with_epochs(7)
        .with_optimizer(StochConfig::new(StochKind::Adagrad).with_tuning(vec![0.1, 0.01], 2));
    let json = serde_json::to_string(&config).unwrap();
    assert_eq!(serde_json::from_str::<TrainerConfig>(&json).unwrap(), config);
}
