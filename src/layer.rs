use crate::{
    registry::{Params, Registry},
    tensor::{Dims, Tensor},
    Scalar,
};
use anyhow::Result;
use rand::{distributions::Uniform, rngs::StdRng};
use std::fmt::Debug;

mod activation;
pub use activation::{Activation, ActivationKind};

mod affine;
pub use affine::Affine;

mod conv;
pub use conv::Conv;

mod pool;
pub use pool::Pool;


/// A differentiable transformation of a [`Tensor`].
///
/// # Call order
/// Layers cache their input and output. [`.backward_input()`](Self::backward_input()) and
/// [`.backward_params()`](Self::backward_params()) refer to the most recent
/// [`.forward()`](Self::forward()), so a layer instance cannot be shared between threads that
/// evaluate different samples. Use [`.clone_layer()`](Self::clone_layer()) to give each thread
/// its own instance.
///
/// # Parameters
/// The trainable parameters of a layer are a contiguous region of the network's parameter
/// vector, in a fixed order defined by the layer.
pub trait Layer: Debug + Send + Sync {
    /// The registry name, ie "conv".
    fn kind(&self) -> &'static str;
    /// The registry description, ie "conv:dims=8,rows=3,cols=3".
    fn describe(&self) -> String {
        self.kind().to_string()
    }
    /// Configures the layer for `input`, allocating parameters and buffers.
    ///
    /// Returns the output dimensions.
    ///
    /// **Errors**
    /// Returns [`ConfigError::InputTooSmall`](crate::error::ConfigError::InputTooSmall) if
    /// `input` is too small for the layer.
    fn configure(&mut self, input: Dims) -> Result<Dims>;
    /// The configured input dimensions.
    fn input_dims(&self) -> Dims;
    /// The configured output dimensions.
    fn output_dims(&self) -> Dims;
    /// The number of trainable parameters.
    fn param_count(&self) -> usize {
        0
    }
    /// Sets all parameters to zero.
    fn zero_params(&mut self) {}
    /// Initializes the parameters randomly.
    #[allow(unused)]
    fn random_params(&mut self, rng: &mut StdRng) {}
    /// Writes the parameters into `params`, which has length [`.param_count()`](Self::param_count()).
    #[allow(unused)]
    fn save_params(&self, params: &mut [Scalar]) {}
    /// Reads the parameters from `params`, which has length [`.param_count()`](Self::param_count()).
    #[allow(unused)]
    fn load_params(&mut self, params: &[Scalar]) {}
    /// Computes the output for `input`.
    fn forward(&mut self, input: &Tensor) -> &Tensor;
    /// Computes the gradient of the input from the gradient of the output.
    fn backward_input(&mut self, output_grad: &Tensor) -> &Tensor;
    /// Writes the gradient of the parameters into `param_grad`.
    #[allow(unused)]
    fn backward_params(&self, output_grad: &Tensor, param_grad: &mut [Scalar]) {}
    /// Clones the layer, including its parameters and buffers.
    fn clone_layer(&self) -> Box<dyn Layer>;
}

impl Clone for Box<dyn Layer> {
    fn clone(&self) -> Self {
        self.clone_layer()
    }
}

/// The default layer registry.
///
/// | name | parameters |
/// |------|------------|
/// | `affine` | `dims` outputs |
/// | `conv` | `dims` output maps, `rows` x `cols` kernel |
/// | `pool-soft` | `alpha` (default 1) |
/// | `pool-max`, `pool-min`, `pool-avg` | soft pooling with alpha 8, -8 and 0 |
/// | `act-unit`, `act-tanh`, `act-snorm`, `act-splus` | none |
pub fn registry() -> Registry<Box<dyn Layer>> {
    let mut registry = Registry::<Box<dyn Layer>>::new("layer");
    registry
        .register("affine", "fully connected: W * x + b", |params| {
            Ok(Box::new(Affine::new(params.require("dims")?)?))
        })
        .register("conv", "convolution (valid correlation)", |params| {
            Ok(Box::new(Conv::new(
                params.require("dims")?,
                params.require("rows")?,
                params.require("cols")?,
            )?))
        })
        .register("pool-soft", "soft 2x2 pooling", |params| {
            Ok(Box::new(Pool::new(params.get("alpha", 1.)?)?))
        })
        .register("pool-max", "soft 2x2 pooling (alpha = 8)", |params| {
            Ok(Box::new(Pool::with_kind("pool-max", params.get("alpha", 8.)?)?))
        })
        .register("pool-min", "soft 2x2 pooling (alpha = -8)", |params| {
            Ok(Box::new(Pool::with_kind("pool-min", params.get("alpha", -8.)?)?))
        })
        .register("pool-avg", "2x2 average pooling", |_| {
            Ok(Box::new(Pool::with_kind("pool-avg", 0.)?))
        });
    for kind in ActivationKind::ALL {
        registry.register(kind.name(), kind.description(), activation_factory(kind));
    }
    registry
}

fn activation_factory(kind: ActivationKind) -> fn(&Params) -> Result<Box<dyn Layer>> {
    match kind {
        ActivationKind::Unit => |_| Ok(Box::new(Activation::new(ActivationKind::Unit))),
        ActivationKind::Tanh => |_| Ok(Box::new(Activation::new(ActivationKind::Tanh))),
        ActivationKind::SNorm => |_| Ok(Box::new(Activation::new(ActivationKind::SNorm))),
        ActivationKind::SPlus => |_| Ok(Box::new(Activation::new(ActivationKind::SPlus))),
    }
}

/// Uniform initialization in `(-a, a)` with `a = 1 / sqrt(fan_in)`.
fn fan_in_uniform(fan_in: usize) -> Uniform<Scalar> {
    let a = 1. / (fan_in.max(1) as Scalar).sqrt();
    Uniform::new(-a, a)
}
