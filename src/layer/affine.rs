use super::{fan_in_uniform, Layer};
use crate::{
    error::ConfigError,
    tensor::{Dims, Tensor},
    Scalar,
};
use anyhow::Result;
use ndarray::{Array1, Array2, ArrayView1};
use rand::{rngs::StdRng, Rng};

/// Fully connected layer.
///
/// Flattens the input to a vector `x` and computes `W * x + b` with `W` of shape
/// `[outputs, input size]`. The output has dims `outputs x 1 x 1`.
///
/// Parameters are stored as `W` (row major) followed by `b`.
#[derive(Debug, Clone)]
pub struct Affine {
    outputs: usize,
    weight: Array2<Scalar>,
    bias: Array1<Scalar>,
    input: Tensor,
    output: Tensor,
    input_grad: Tensor,
}

impl Affine {
    /// Creates a new [`Affine`] with `outputs` outputs.
    ///
    /// **Errors**
    /// `outputs` must be positive.
    pub fn new(outputs: usize) -> Result<Self> {
        if outputs == 0 {
            return Err(ConfigError::invalid("dims", outputs, "must be positive").into());
        }
        Ok(Self {
            outputs,
            weight: Array2::zeros([outputs, 0]),
            bias: Array1::zeros(outputs),
            input: Tensor::default(),
            output: Tensor::default(),
            input_grad: Tensor::default(),
        })
    }
    /// The weight, `[outputs, inputs]`.
    pub fn weight(&self) -> &Array2<Scalar> {
        &self.weight
    }
    /// The bias, `[outputs]`.
    pub fn bias(&self) -> &Array1<Scalar> {
        &self.bias
    }
}

impl Layer for Affine {
    fn kind(&self) -> &'static str {
        "affine"
    }
    fn describe(&self) -> String {
        format!("affine:dims={}", self.outputs)
    }
    fn configure(&mut self, input: Dims) -> Result<Dims> {
        if input.size() == 0 {
            return Err(ConfigError::InputTooSmall {
                kind: self.kind().to_string(),
                expected: Dims::new(1, 1, 1),
                found: input,
            }
            .into());
        }
        let output = Dims::flat(self.outputs);
        if self.weight.dim() != (self.outputs, input.size()) {
            self.weight = Array2::zeros([self.outputs, input.size()]);
        }
        self.input.resize(input);
        self.output.resize(output);
        self.input_grad.resize(input);
        Ok(output)
    }
    fn input_dims(&self) -> Dims {
        self.input.dims()
    }
    fn output_dims(&self) -> Dims {
        self.output.dims()
    }
    fn param_count(&self) -> usize {
        self.weight.len() + self.bias.len()
    }
    fn zero_params(&mut self) {
        self.weight.fill(0.);
        self.bias.fill(0.);
    }
    fn random_params(&mut self, rng: &mut StdRng) {
        let dist = fan_in_uniform(self.weight.ncols());
        self.weight.mapv_inplace(|_| rng.sample(dist));
        self.bias.mapv_inplace(|_| rng.sample(dist));
    }
    fn save_params(&self, params: &mut [Scalar]) {
        let (w, b) = params.split_at_mut(self.weight.len());
        for (p, x) in w.iter_mut().zip(self.weight.iter()) {
            *p = *x;
        }
        for (p, x) in b.iter_mut().zip(self.bias.iter()) {
            *p = *x;
        }
    }
    fn load_params(&mut self, params: &[Scalar]) {
        let (w, b) = params.split_at(self.weight.len());
        for (x, p) in self.weight.iter_mut().zip(w) {
            *x = *p;
        }
        for (x, p) in self.bias.iter_mut().zip(b) {
            *x = *p;
        }
    }
    fn forward(&mut self, input: &Tensor) -> &Tensor {
        debug_assert_eq!(input.dims(), self.input.dims());
        self.input.assign(input);
        let y = self.weight.dot(&input.vector()) + &self.bias;
        self.output.vector_mut().assign(&y);
        &self.output
    }
    fn backward_input(&mut self, output_grad: &Tensor) -> &Tensor {
        debug_assert_eq!(output_grad.dims(), self.output.dims());
        let dx = self.weight.t().dot(&output_grad.vector());
        self.input_grad.vector_mut().assign(&dx);
        &self.input_grad
    }
    fn backward_params(&self, output_grad: &Tensor, param_grad: &mut [Scalar]) {
        debug_assert_eq!(param_grad.len(), self.param_count());
        let x: ArrayView1<Scalar> = self.input.vector();
        let dy = output_grad.as_slice();
        let (dw, db) = param_grad.split_at_mut(self.weight.len());
        for (dw, dy) in dw.chunks_exact_mut(x.len()).zip(dy) {
            for (dw, x) in dw.iter_mut().zip(x.iter()) {
                *dw = dy * x;
            }
        }
        db.copy_from_slice(dy);
    }
    fn clone_layer(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}
