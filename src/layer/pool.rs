use super::Layer;
use crate::{
    error::ConfigError,
    tensor::{Dims, Tensor},
    Scalar,
};
use anyhow::Result;

/// Soft 2x2 pooling.
///
/// Each non overlapping 2x2 block `x` of a plane becomes `log(mean(exp(alpha * x))) / alpha`,
/// which tends to the maximum as `alpha` grows, to the minimum as it falls, and is exactly the
/// mean for `alpha == 0`. Odd trailing rows and columns are dropped.
///
/// The value is computed relative to the block mean and to the block maximum of
/// `alpha * (x - mean)`, so that large `alpha` cannot overflow and small `alpha` stays close to
/// the mean. The forward pass keeps the normalized weights `exp(alpha * x) / sum`,
/// which are the partial derivatives of the output.
#[derive(Debug, Clone)]
pub struct Pool {
    kind: &'static str,
    alpha: Scalar,
    input: Tensor,
    output: Tensor,
    weights: Tensor,
    input_grad: Tensor,
}

impl Pool {
    /// Creates a new "pool-soft" layer.
    ///
    /// **Errors**
    /// `alpha` must be finite.
    pub fn new(alpha: Scalar) -> Result<Self> {
        Self::with_kind("pool-soft", alpha)
    }
    pub(super) fn with_kind(kind: &'static str, alpha: Scalar) -> Result<Self> {
        if !alpha.is_finite() {
            return Err(ConfigError::invalid("alpha", alpha, "must be finite").into());
        }
        Ok(Self {
            kind,
            alpha,
            input: Tensor::default(),
            output: Tensor::default(),
            weights: Tensor::default(),
            input_grad: Tensor::default(),
        })
    }
    /// The sharpness.
    pub fn alpha(&self) -> Scalar {
        self.alpha
    }
}

impl Layer for Pool {
    fn kind(&self) -> &'static str {
        self.kind
    }
    fn describe(&self) -> String {
        if self.kind == "pool-avg" {
            self.kind.to_string()
        } else {
            format!("{}:alpha={}", self.kind, self.alpha)
        }
    }
    fn configure(&mut self, input: Dims) -> Result<Dims> {
        if input.dims == 0 || input.rows < 2 || input.cols < 2 {
            return Err(ConfigError::InputTooSmall {
                kind: self.kind.to_string(),
                expected: Dims::new(1, 2, 2),
                found: input,
            }
            .into());
        }
        let output = Dims::new(input.dims, input.rows / 2, input.cols / 2);
        self.input.resize(input);
        self.output.resize(output);
        self.weights.resize(input);
        self.input_grad.resize(input);
        Ok(output)
    }
    fn input_dims(&self) -> Dims {
        self.input.dims()
    }
    fn output_dims(&self) -> Dims {
        self.output.dims()
    }
    fn forward(&mut self, input: &Tensor) -> &Tensor {
        debug_assert_eq!(input.dims(), self.input.dims());
        self.input.assign(input);
        let alpha = self.alpha;
        let Dims { dims, .. } = input.dims();
        let Dims {
            rows: orows,
            cols: ocols,
            ..
        } = self.output.dims();
        for d in 0..dims {
            let x = input.plane(d);
            let mut y = self.output.plane_mut(d);
            let mut w = self.weights.plane_mut(d);
            for r in 0..orows {
                for c in 0..ocols {
                    let block = [
                        [2 * r, 2 * c],
                        [2 * r, 2 * c + 1],
                        [2 * r + 1, 2 * c],
                        [2 * r + 1, 2 * c + 1],
                    ];
                    if alpha == 0. {
                        y[[r, c]] = block.iter().map(|i| x[*i]).sum::<Scalar>() / 4.;
                        for i in block {
                            w[i] = 0.25;
                        }
                        continue;
                    }
                    let mean = block.iter().map(|i| x[*i]).sum::<Scalar>() / 4.;
                    let m = block
                        .iter()
                        .map(|i| alpha * (x[*i] - mean))
                        .fold(Scalar::NEG_INFINITY, Scalar::max);
                    // sum(exp(z - m)) - 4, exact for small alpha
                    let mut excess = 0.;
                    for i in block {
                        let e = (alpha * (x[i] - mean) - m).exp_m1();
                        w[i] = e;
                        excess += e;
                    }
                    let sum = 4. + excess;
                    for i in block {
                        w[i] = (w[i] + 1.) / sum;
                    }
                    y[[r, c]] = mean + (m + (excess / 4.).ln_1p()) / alpha;
                }
            }
        }
        &self.output
    }
    fn backward_input(&mut self, output_grad: &Tensor) -> &Tensor {
        debug_assert_eq!(output_grad.dims(), self.output.dims());
        let Dims {
            dims,
            rows: orows,
            cols: ocols,
        } = output_grad.dims();
        // Dropped trailing rows and columns stay zero.
        self.input_grad.fill(0.);
        for d in 0..dims {
            let dy = output_grad.plane(d);
            let w = self.weights.plane(d);
            let mut dx = self.input_grad.plane_mut(d);
            for r in 0..orows {
                for c in 0..ocols {
                    for i in [
                        [2 * r, 2 * c],
                        [2 * r, 2 * c + 1],
                        [2 * r + 1, 2 * c],
                        [2 * r + 1, 2 * c + 1],
                    ] {
                        dx[i] = dy[[r, c]] * w[i];
                    }
                }
            }
        }
        &self.input_grad
    }
    fn clone_layer(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}
