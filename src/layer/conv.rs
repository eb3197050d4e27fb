use super::{fan_in_uniform, Layer};
use crate::{
    error::ConfigError,
    tensor::{Dims, Tensor},
    Scalar,
};
use anyhow::Result;
use dry::macro_for;
use rand::{rngs::StdRng, Rng};

/// Convolutional layer.
///
/// Each output map is the sum over input maps of the valid 2D correlation with a
/// `rows x cols` kernel, plus a per map bias. There is no padding and the stride is 1, so an
/// `idims x irows x icols` input produces `dims x (irows - rows + 1) x (icols - cols + 1)`.
///
/// Parameters are stored as the kernels, `[outputs, inputs, rows, cols]`, followed by the bias.
#[derive(Debug, Clone)]
pub struct Conv {
    outputs: usize,
    krows: usize,
    kcols: usize,
    kernels: Vec<Scalar>,
    bias: Vec<Scalar>,
    input: Tensor,
    output: Tensor,
    input_grad: Tensor,
}

impl Conv {
    /// Creates a new [`Conv`] with `outputs` maps and a `krows x kcols` kernel.
    ///
    /// **Errors**
    /// All arguments must be positive.
    pub fn new(outputs: usize, krows: usize, kcols: usize) -> Result<Self> {
        for (key, value) in [("dims", outputs), ("rows", krows), ("cols", kcols)] {
            if value == 0 {
                return Err(ConfigError::invalid(key, value, "must be positive").into());
            }
        }
        Ok(Self {
            outputs,
            krows,
            kcols,
            kernels: Vec::new(),
            bias: vec![0.; outputs],
            input: Tensor::default(),
            output: Tensor::default(),
            input_grad: Tensor::default(),
        })
    }
    fn inputs(&self) -> usize {
        self.input.dims().dims
    }
    fn kernel_size(&self) -> usize {
        self.krows * self.kcols
    }
    /// The kernel connecting input map `i` to output map `o`.
    pub fn kernel(&self, o: usize, i: usize) -> &[Scalar] {
        let size = self.kernel_size();
        let offset = (o * self.inputs() + i) * size;
        &self.kernels[offset..offset + size]
    }
    /// The bias of each output map.
    pub fn bias(&self) -> &[Scalar] {
        &self.bias
    }
}

impl Layer for Conv {
    fn kind(&self) -> &'static str {
        "conv"
    }
    fn describe(&self) -> String {
        format!(
            "conv:dims={},rows={},cols={}",
            self.outputs, self.krows, self.kcols
        )
    }
    fn configure(&mut self, input: Dims) -> Result<Dims> {
        if input.dims == 0 || input.rows < self.krows || input.cols < self.kcols {
            return Err(ConfigError::InputTooSmall {
                kind: self.kind().to_string(),
                expected: Dims::new(1, self.krows, self.kcols),
                found: input,
            }
            .into());
        }
        let output = Dims::new(
            self.outputs,
            input.rows - self.krows + 1,
            input.cols - self.kcols + 1,
        );
        let kernels_len = self.outputs * input.dims * self.kernel_size();
        if self.kernels.len() != kernels_len {
            self.kernels = vec![0.; kernels_len];
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
        self.kernels.len() + self.bias.len()
    }
    fn zero_params(&mut self) {
        self.kernels.fill(0.);
        self.bias.fill(0.);
    }
    fn random_params(&mut self, rng: &mut StdRng) {
        let dist = fan_in_uniform(self.inputs() * self.kernel_size());
        self.kernels.iter_mut().for_each(|x| *x = rng.sample(dist));
        self.bias.iter_mut().for_each(|x| *x = rng.sample(dist));
    }
    fn save_params(&self, params: &mut [Scalar]) {
        let (k, b) = params.split_at_mut(self.kernels.len());
        k.copy_from_slice(&self.kernels);
        b.copy_from_slice(&self.bias);
    }
    fn load_params(&mut self, params: &[Scalar]) {
        let (k, b) = params.split_at(self.kernels.len());
        self.kernels.copy_from_slice(k);
        self.bias.copy_from_slice(b);
    }
    fn forward(&mut self, input: &Tensor) -> &Tensor {
        debug_assert_eq!(input.dims(), self.input.dims());
        self.input.assign(input);
        let Dims {
            dims: inputs,
            cols: icols,
            ..
        } = input.dims();
        let ocols = self.output.dims().cols;
        for o in 0..self.outputs {
            let bias = self.bias[o];
            let size = self.kernel_size();
            let output = self.output.plane_slice_mut(o);
            output.fill(bias);
            for i in 0..inputs {
                let offset = (o * inputs + i) * size;
                correlate(
                    input.plane_slice(i),
                    icols,
                    &self.kernels[offset..offset + size],
                    self.kcols,
                    output,
                    ocols,
                );
            }
        }
        &self.output
    }
    fn backward_input(&mut self, output_grad: &Tensor) -> &Tensor {
        debug_assert_eq!(output_grad.dims(), self.output.dims());
        let inputs = self.inputs();
        let icols = self.input.dims().cols;
        let ocols = output_grad.dims().cols;
        let size = self.kernel_size();
        self.input_grad.fill(0.);
        for i in 0..inputs {
            let input_grad = self.input_grad.plane_slice_mut(i);
            for o in 0..self.outputs {
                let offset = (o * inputs + i) * size;
                correlate_full(
                    output_grad.plane_slice(o),
                    ocols,
                    &self.kernels[offset..offset + size],
                    self.kcols,
                    input_grad,
                    icols,
                );
            }
        }
        &self.input_grad
    }
    fn backward_params(&self, output_grad: &Tensor, param_grad: &mut [Scalar]) {
        debug_assert_eq!(param_grad.len(), self.param_count());
        let inputs = self.inputs();
        let icols = self.input.dims().cols;
        let ocols = output_grad.dims().cols;
        let (kernels_grad, bias_grad) = param_grad.split_at_mut(self.kernels.len());
        let mut kernels_grad = kernels_grad.chunks_exact_mut(self.kernel_size());
        for o in 0..self.outputs {
            let output_grad = output_grad.plane_slice(o);
            for i in 0..inputs {
                if let Some(kernel_grad) = kernels_grad.next() {
                    correlate_kernel(
                        self.input.plane_slice(i),
                        icols,
                        output_grad,
                        ocols,
                        kernel_grad,
                        self.kcols,
                    );
                }
            }
            bias_grad[o] = output_grad.iter().sum();
        }
    }
    fn clone_layer(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

/// `output[r][c] += sum(input[r + kr][c + kc] * kernel[kr][kc])`
fn correlate(
    input: &[Scalar],
    icols: usize,
    kernel: &[Scalar],
    kcols: usize,
    output: &mut [Scalar],
    ocols: usize,
) {
    macro_for!($W in [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15] {
        if kcols == $W {
            return correlate_impl(input, icols, kernel, $W, output, ocols);
        }
    });
    correlate_impl(input, icols, kernel, kcols, output, ocols)
}

// Inlined into each branch of the width dispatch so the inner loops see a constant width.
#[inline(always)]
fn correlate_impl(
    input: &[Scalar],
    icols: usize,
    kernel: &[Scalar],
    kcols: usize,
    output: &mut [Scalar],
    ocols: usize,
) {
    let window = ocols + kcols - 1;
    for (r, output) in output.chunks_exact_mut(ocols).enumerate() {
        for (kr, kernel) in kernel.chunks_exact(kcols).enumerate() {
            let start = (r + kr) * icols;
            let input = &input[start..start + window];
            for (c, y) in output.iter_mut().enumerate() {
                *y += input[c..c + kcols]
                    .iter()
                    .zip(kernel)
                    .map(|(x, k)| x * k)
                    .sum::<Scalar>();
            }
        }
    }
}

/// `input_grad[r + kr][c + kc] += output_grad[r][c] * kernel[kr][kc]`
fn correlate_full(
    output_grad: &[Scalar],
    ocols: usize,
    kernel: &[Scalar],
    kcols: usize,
    input_grad: &mut [Scalar],
    icols: usize,
) {
    macro_for!($W in [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15] {
        if kcols == $W {
            return correlate_full_impl(output_grad, ocols, kernel, $W, input_grad, icols);
        }
    });
    correlate_full_impl(output_grad, ocols, kernel, kcols, input_grad, icols)
}

#[inline(always)]
fn correlate_full_impl(
    output_grad: &[Scalar],
    ocols: usize,
    kernel: &[Scalar],
    kcols: usize,
    input_grad: &mut [Scalar],
    icols: usize,
) {
    let window = ocols + kcols - 1;
    for (r, output_grad) in output_grad.chunks_exact(ocols).enumerate() {
        for (kr, kernel) in kernel.chunks_exact(kcols).enumerate() {
            let start = (r + kr) * icols;
            let input_grad = &mut input_grad[start..start + window];
            for (c, dy) in output_grad.iter().enumerate() {
                for (dx, k) in input_grad[c..c + kcols].iter_mut().zip(kernel) {
                    *dx += dy * k;
                }
            }
        }
    }
}

/// `kernel_grad[kr][kc] = sum(input[r + kr][c + kc] * output_grad[r][c])`
fn correlate_kernel(
    input: &[Scalar],
    icols: usize,
    output_grad: &[Scalar],
    ocols: usize,
    kernel_grad: &mut [Scalar],
    kcols: usize,
) {
    for (kr, kernel_grad) in kernel_grad.chunks_exact_mut(kcols).enumerate() {
        for (kc, dk) in kernel_grad.iter_mut().enumerate() {
            *dk = output_grad
                .chunks_exact(ocols)
                .enumerate()
                .map(|(r, output_grad)| {
                    let start = (r + kr) * icols + kc;
                    input[start..start + ocols]
                        .iter()
                        .zip(output_grad)
                        .map(|(x, dy)| x * dy)
                        .sum::<Scalar>()
                })
                .sum();
        }
    }
}
