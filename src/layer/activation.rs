use super::Layer;
use crate::{
    tensor::{Dims, Tensor},
    Scalar,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Elementwise nonlinearities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivationKind {
    /// `x`
    Unit,
    /// `tanh(x)`
    Tanh,
    /// `x / sqrt(1 + x^2)`
    SNorm,
    /// `log(1 + exp(x))`
    SPlus,
}

impl ActivationKind {
    /// All kinds.
    pub const ALL: [Self; 4] = [Self::Unit, Self::Tanh, Self::SNorm, Self::SPlus];
    /// The registry name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unit => "act-unit",
            Self::Tanh => "act-tanh",
            Self::SNorm => "act-snorm",
            Self::SPlus => "act-splus",
        }
    }
    pub(super) fn description(&self) -> &'static str {
        match self {
            Self::Unit => "identity",
            Self::Tanh => "hyperbolic tangent",
            Self::SNorm => "x / sqrt(1 + x^2)",
            Self::SPlus => "soft plus: log(1 + e^x)",
        }
    }
    fn value(&self, x: Scalar) -> Scalar {
        match self {
            Self::Unit => x,
            Self::Tanh => x.tanh(),
            Self::SNorm => x / (1. + x * x).sqrt(),
            // max(x, 0) + log(1 + e^-|x|) does not overflow
            Self::SPlus => x.max(0.) + (-x.abs()).exp().ln_1p(),
        }
    }
    /// Derivative at input `x` with output `y`.
    fn derivative(&self, x: Scalar, y: Scalar) -> Scalar {
        match self {
            Self::Unit => 1.,
            Self::Tanh => 1. - y * y,
            Self::SNorm => {
                let s = 1. + x * x;
                1. / (s * s.sqrt())
            }
            Self::SPlus => {
                if x >= 0. {
                    1. / (1. + (-x).exp())
                } else {
                    let e = x.exp();
                    e / (1. + e)
                }
            }
        }
    }
}

/// Activation layer.
///
/// Applies an [`ActivationKind`] to each element, keeping the shape.
#[derive(Debug, Clone)]
pub struct Activation {
    kind: ActivationKind,
    input: Tensor,
    output: Tensor,
    input_grad: Tensor,
}

impl Activation {
    /// Creates a new activation of `kind`.
    pub fn new(kind: ActivationKind) -> Self {
        Self {
            kind,
            input: Tensor::default(),
            output: Tensor::default(),
            input_grad: Tensor::default(),
        }
    }
    /// The nonlinearity.
    pub fn activation_kind(&self) -> ActivationKind {
        self.kind
    }
}

impl Layer for Activation {
    fn kind(&self) -> &'static str {
        self.kind.name()
    }
    fn configure(&mut self, input: Dims) -> Result<Dims> {
        self.input.resize(input);
        self.output.resize(input);
        self.input_grad.resize(input);
        Ok(input)
    }
    fn input_dims(&self) -> Dims {
        self.input.dims()
    }
    fn output_dims(&self) -> Dims {
        self.output.dims()
    }
    fn forward(&mut self, input: &Tensor) -> &Tensor {
        debug_assert_eq!(input.dims(), self.input.dims());
        let kind = self.kind;
        self.input.assign(input);
        for (y, x) in self
            .output
            .as_slice_mut()
            .iter_mut()
            .zip(input.as_slice())
        {
            *y = kind.value(*x);
        }
        &self.output
    }
    fn backward_input(&mut self, output_grad: &Tensor) -> &Tensor {
        debug_assert_eq!(output_grad.dims(), self.output.dims());
        let kind = self.kind;
        for (dx, ((x, y), dy)) in self.input_grad.as_slice_mut().iter_mut().zip(
            self.input
                .as_slice()
                .iter()
                .zip(self.output.as_slice())
                .zip(output_grad.as_slice()),
        ) {
            *dx = dy * kind.derivative(*x, *y);
        }
        &self.input_grad
    }
    fn clone_layer(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}
