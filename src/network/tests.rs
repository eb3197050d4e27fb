use super::*;
use crate::layer;
use approx::assert_abs_diff_eq;
use rand::SeedableRng;

const H: Scalar = 1e-6;

fn network(input_dims: Dims, description: &str, seed: u64) -> Network {
    let mut network = Network::from_description(&layer::registry(), input_dims, description).unwrap();
    network.random_params(&mut StdRng::seed_from_u64(seed));
    network
}

fn dot(a: &Tensor, b: &Tensor) -> Scalar {
    a.iter().zip(b.iter()).map(|(a, b)| a * b).sum()
}

fn check_gradients(input_dims: Dims, description: &str, seed: u64) {
    let mut network = network(input_dims, description, seed);
    let mut rng = StdRng::seed_from_u64(seed + 100);
    let input = Tensor::random(input_dims, &mut rng, -1., 1.);
    let u = Tensor::random(network.output_dims(), &mut rng, -1., 1.);
    let params = network.save_params();

    let output_dims = network.value(&input).dims();
    assert_eq!(output_dims, network.output_dims());
    let mut param_grad = vec![0.; network.param_count()];
    let input_grad = network.gradient(&u, &mut param_grad).clone();
    assert_eq!(input_grad.dims(), input_dims);

    for i in 0..params.len() {
        let mut p = params.clone();
        p[i] += H;
        network.load_params(p.as_slice().unwrap()).unwrap();
        let fp = dot(network.value(&input), &u);
        p[i] -= 2. * H;
        network.load_params(p.as_slice().unwrap()).unwrap();
        let fm = dot(network.value(&input), &u);
        assert_abs_diff_eq!(param_grad[i], (fp - fm) / (2. * H), epsilon = 1e-6);
    }
    network.load_params(params.as_slice().unwrap()).unwrap();
    for i in 0..input.size() {
        let mut x = input.clone();
        x.as_slice_mut()[i] += H;
        let fp = dot(network.value(&x), &u);
        x.as_slice_mut()[i] -= 2. * H;
        let fm = dot(network.value(&x), &u);
        assert_abs_diff_eq!(input_grad.as_slice()[i], (fp - fm) / (2. * H), epsilon = 1e-6);
    }
}

#[test]
fn depth_0_is_identity() {
    let dims = Dims::new(2, 3, 3);
    let mut network = Network::new(dims, Vec::new()).unwrap();
    assert_eq!(network.depth(), 0);
    assert_eq!(network.param_count(), 0);
    assert_eq!(network.output_dims(), dims);
    let input = Tensor::random(dims, &mut StdRng::seed_from_u64(0), -1., 1.);
    assert_eq!(network.value(&input), &input);
    let grad = Tensor::from_elem(dims, 2.);
    assert_eq!(network.gradient(&grad, &mut []), &grad);
    check_gradients(dims, "", 0);
}

#[test]
fn depth_1_gradients() {
    check_gradients(Dims::new(2, 3, 2), "affine:dims=3", 1);
    check_gradients(Dims::new(1, 5, 5), "conv:dims=2,rows=2,cols=3", 2);
}

#[test]
fn depth_2_gradients() {
    check_gradients(Dims::flat(4), "affine:dims=5;act-tanh", 3);
    check_gradients(Dims::new(2, 6, 6), "conv:dims=3,rows=3,cols=3;pool-soft", 4);
}

#[test]
fn depth_3_gradients() {
    check_gradients(Dims::new(1, 8, 8), "conv:dims=2,rows=3,cols=3;act-snorm;affine:dims=2", 5);
    check_gradients(Dims::new(2, 7, 6), "pool-max;act-splus;affine:dims=3", 6);
    check_gradients(Dims::new(1, 6, 6), "conv:dims=2,rows=3,cols=3;pool-min;affine:dims=2", 7);
}

#[test]
fn shape_chain() {
    let network = network(
        Dims::new(1, 12, 12),
        "conv:dims=4,rows=5,cols=5;act-tanh;pool-max;conv:dims=6,rows=3,cols=3;act-snorm;affine:dims=10",
        0,
    );
    let layers = network.layers();
    for pair in layers.windows(2) {
        assert_eq!(pair[0].output_dims(), pair[1].input_dims());
    }
    assert_eq!(layers[0].input_dims(), network.input_dims());
    assert_eq!(layers[2].output_dims(), Dims::new(4, 4, 4));
    assert_eq!(layers[3].output_dims(), Dims::new(6, 2, 2));
    assert_eq!(network.output_dims(), Dims::flat(10));
    let param_count: usize = layers.iter().map(|x| x.param_count()).sum();
    assert_eq!(network.param_count(), param_count);
    assert_eq!(param_count, (4 * 25 + 4) + (6 * 4 * 9 + 6) + (10 * 24 + 10));
}

#[test]
fn configure_errors() {
    let registry = layer::registry();
    let err = Network::from_description(
        &registry,
        Dims::new(1, 6, 6),
        "conv:dims=2,rows=3,cols=3;pool-max;conv:dims=2,rows=3,cols=3",
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::InputTooSmall { .. })
    ));
    assert!(Network::from_description(&registry, Dims::new(1, 6, 6), "act-tanh;dense").is_err());
}

#[test]
fn save_load_params() {
    let mut network = network(Dims::new(2, 5, 5), "conv:dims=3,rows=2,cols=2;pool-avg;affine:dims=4", 8);
    let params = network.save_params();
    let mut other = network.clone();
    other.zero_params();
    assert!(other.save_params().iter().all(|x| *x == 0.));
    other.load_params(params.as_slice().unwrap()).unwrap();
    assert_eq!(other.save_params(), params);

    let err = network.load_params(&params.as_slice().unwrap()[1..]).unwrap_err();
    assert_eq!(
        err.downcast_ref::<ConfigError>(),
        Some(&ConfigError::ParamCount {
            expected: params.len(),
            found: params.len() - 1,
        })
    );
}

#[test]
fn save_load_file() {
    let registry = layer::registry();
    let input_dims = Dims::new(1, 6, 5);
    let mut network = network(input_dims, "conv:dims=2,rows=3,cols=2;act-tanh;pool-soft:alpha=2;affine:dims=3", 9);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("network.json");
    network.save(&path).unwrap();
    let mut loaded = Network::load(&path, &registry).unwrap();
    assert_eq!(loaded.description(), network.description());
    assert_eq!(loaded.input_dims(), input_dims);
    assert_eq!(loaded.save_params(), network.save_params());
    let input = Tensor::random(input_dims, &mut StdRng::seed_from_u64(10), -1., 1.);
    let expected = network.value(&input).clone();
    assert_eq!(loaded.value(&input), &expected);
    assert!(Network::load(dir.path().join("missing.json"), &registry).is_err());
}

#[test]
fn display() {
    let network = network(Dims::new(1, 4, 4), "conv:dims=2,rows=3,cols=3;affine:dims=1", 0);
    let text = network.to_string();
    assert!(text.starts_with("network: 1x4x4 -> 1x1x1, 29 params"), "{text}");
    assert!(text.contains("[0] conv:dims=2,rows=3,cols=3: 1x4x4 -> 2x2x2, 20 params"), "{text}");
    assert!(text.contains("[1] affine:dims=1: 2x2x2 -> 1x1x1, 9 params"), "{text}");
}
