use super::*;
use crate::{
    accumulator::Accumulator,
    criterion, layer, loss,
    function::{Ellipse, Function, NetworkFunction, Rosenbrock, Sphere},
    network::Network,
    task::{Fold, MemoryTask},
    tensor::{Dims, Tensor},
};
use approx::assert_relative_eq;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::Arc;

fn random_start(rng: &mut StdRng, size: usize) -> Vector {
    Vector::from_shape_simple_fn(size, || rng.gen_range(-2. ..2.))
}

fn check_converges(config: &BatchConfig, function: &mut dyn Function, x0: Vector) -> OptState {
    let mut callbacks = 0;
    let state = minimize(config, function, x0, |_| {
        callbacks += 1;
        true
    })
    .unwrap();
    assert_eq!(
        state.status,
        OptStatus::Converged,
        "{} with {:?}: {} after {} iterations, criterion {}",
        config.kind,
        config.line_search.kind,
        state.status,
        state.iterations,
        state.convergence_criterion(),
    );
    assert!(state.convergence_criterion() < config.epsilon);
    assert!(state.iterations <= config.max_iterations);
    assert_eq!(callbacks, state.iterations);
    assert!(state.fcalls > state.iterations);
    state
}

#[test]
fn batch_optimizers_converge_on_quadratics() {
    let mut rng = StdRng::seed_from_u64(11);
    for kind in BatchKind::all() {
        for line_search in LineSearchKind::ALL {
            let config = BatchConfig::new(kind)
                .with_max_iterations(2000)
                .with_line_search(LineSearchConfig::default().with_kind(line_search));
            for _ in 0..3 {
                let mut sphere = Sphere::new(8);
                let x0 = random_start(&mut rng, 8);
                let state = check_converges(&config, &mut sphere, x0);
                assert!(state.f < 1e-10);
                let mut ellipse = Ellipse::new(8);
                let x0 = random_start(&mut rng, 8);
                check_converges(&config, &mut ellipse, x0);
            }
        }
    }
}

#[test]
fn lbfgs_solves_rosenbrock() {
    let mut rosenbrock = Rosenbrock::new(2).unwrap();
    let config = BatchConfig::default();
    let state = check_converges(&config, &mut rosenbrock, Vector::from(vec![-1.2, 1.]));
    for x in state.x.iter() {
        assert_relative_eq!(*x, 1., epsilon = 1e-4);
    }
    assert!(state.iterations < 200);
}

#[test]
fn already_optimal_start() {
    let mut optimizer = BatchOptimizer::new(BatchConfig::default()).unwrap();
    let state = optimizer.init(&mut Sphere::new(3), Vector::zeros(3)).unwrap();
    assert_eq!(state.status, OptStatus::Converged);
    assert_eq!(state.iterations, 0);
    assert!(optimizer.init(&mut Sphere::new(3), Vector::zeros(2)).is_err());
}

#[test]
fn callback_stops_early() {
    let config = BatchConfig::new(BatchKind::Gd);
    let mut ellipse = Ellipse::new(6);
    let state = minimize(&config, &mut ellipse, Vector::ones(6), |state| {
        state.iterations < 3
    })
    .unwrap();
    assert_eq!(state.iterations, 3);
    assert_eq!(state.status, OptStatus::Running);
}

#[derive(Debug)]
struct Diverging;

impl Function for Diverging {
    fn size(&self) -> usize {
        1
    }
    fn value(&mut self, x: &Vector) -> anyhow::Result<Scalar> {
        Ok(if x[0] > 1. { Scalar::NAN } else { -x[0] })
    }
    fn vgrad(&mut self, x: &Vector, grad: &mut Vector) -> anyhow::Result<Scalar> {
        grad[0] = if x[0] > 1. { Scalar::NAN } else { -1. };
        self.value(x)
    }
}

#[test]
fn non_finite_values_fail_or_diverge() {
    for line_search in LineSearchKind::ALL {
        let config = BatchConfig::new(BatchKind::Gd)
            .with_line_search(LineSearchConfig::default().with_kind(line_search));
        let state = minimize(&config, &mut Diverging, Vector::zeros(1), |_| true).unwrap();
        assert!(
            matches!(state.status, OptStatus::Failed | OptStatus::Diverged),
            "{line_search:?}: {}",
            state.status
        );
        assert!(state.x[0] <= 1.);
    }
}

#[test]
fn stochastic_optimizers_decrease_sphere() {
    for kind in StochKind::ALL {
        let (rate, ratio) = match kind {
            StochKind::Adadelta => (1., 1.),
            _ => (0.1, 0.01),
        };
        let config = StochConfig::new(kind).with_rate(LearningRate::constant(rate));
        let mut optimizer = config.build().unwrap();
        let mut sphere = Sphere::new(5);
        let mut x = Vector::ones(5);
        let f0 = sphere.value(&x).unwrap();
        optimizer.reset(&x);
        let mut g = Vector::zeros(5);
        for t in 0..200 {
            let y = optimizer.query(&x).clone();
            let fy = sphere.vgrad(&y, &mut g).unwrap();
            optimizer.update(config.rate.at(t), &mut x, fy, &g);
        }
        let f = sphere.value(&x).unwrap();
        assert!(f < ratio * f0, "{kind}: {f0} -> {f}");
    }
}

#[test]
fn sg_step_on_scaled_identity() {
    let (s, rate) = (0.5, 0.25);
    let input = [1., -2.];
    let target = [3., 1.];
    let mut task = MemoryTask::new(Dims::flat(2), Dims::flat(2));
    task.push(
        Fold::train(0),
        Tensor::from_vec(Dims::flat(2), input.to_vec()).unwrap(),
        Tensor::from_vec(Dims::flat(2), target.to_vec()).unwrap(),
    )
    .unwrap();
    let mut network = Network::from_description(&layer::registry(), Dims::flat(2), "affine:dims=2").unwrap();
    // W = s * I, b = 0
    let x0 = Vector::from(vec![s, 0., 0., s, 0., 0.]);
    network.load_params(x0.as_slice().unwrap()).unwrap();
    let loss: Arc<dyn loss::Loss> = loss::registry().build("square").unwrap().into();
    let criterion: Arc<dyn criterion::Criterion> = criterion::registry().build("avg").unwrap().into();
    let mut accumulator = Accumulator::new(&network, loss, criterion, 1).unwrap();
    let mut function = NetworkFunction::with_fold(&mut accumulator, &task, Fold::train(0)).unwrap();

    let mut x = x0.clone();
    let mut g = Vector::zeros(6);
    let f = function.vgrad(&x, &mut g).unwrap();
    let mut sg = StochConfig::new(StochKind::Sg).build().unwrap();
    sg.reset(&x);
    sg.update(rate, &mut x, f, &g);

    // r = s * input - target, dW = r * input^T, db = r
    let r = [s * input[0] - target[0], s * input[1] - target[1]];
    let expected = [
        s - rate * r[0] * input[0],
        -rate * r[0] * input[1],
        -rate * r[1] * input[0],
        s - rate * r[1] * input[1],
        -rate * r[0],
        -rate * r[1],
    ];
    assert_relative_eq!(f, 0.5 * (r[0] * r[0] + r[1] * r[1]), epsilon = 1e-15);
    for (x, e) in x.iter().zip(expected) {
        assert_relative_eq!(*x, e, epsilon = 1e-15);
    }
}
