use crate::{
    accumulator::{Accumulator, Evaluation},
    task::{Fold, Task},
    Scalar, Vector,
};
use anyhow::{ensure, Result};

/// A differentiable scalar function of a vector, the objective of the optimizers.
pub trait Function {
    /// The dimension of the domain.
    fn size(&self) -> usize;
    /// The value at `x`.
    fn value(&mut self, x: &Vector) -> Result<Scalar>;
    /// Writes the gradient at `x` into `grad` and returns the value.
    fn vgrad(&mut self, x: &Vector, grad: &mut Vector) -> Result<Scalar>;
}

/// The largest difference between the gradient of `function` at `x` and central finite
/// differences, relative to the magnitude of the gradient.
pub fn grad_accuracy(function: &mut dyn Function, x: &Vector) -> Result<Scalar> {
    let mut grad = Vector::zeros(x.len());
    function.vgrad(x, &mut grad)?;
    let mut accuracy: Scalar = 0.;
    let mut xh = x.clone();
    for i in 0..x.len() {
        let h = 1e-6 * x[i].abs().max(1.);
        xh[i] = x[i] + h;
        let fp = function.value(&xh)?;
        xh[i] = x[i] - h;
        let fm = function.value(&xh)?;
        xh[i] = x[i];
        let delta = (fp - fm) / (2. * h);
        accuracy = accuracy.max((grad[i] - delta).abs() / grad[i].abs().max(1.));
    }
    Ok(accuracy)
}

/// The criterion of a network over the samples of a fold, as a function of the parameters.
pub struct NetworkFunction<'a> {
    accumulator: &'a mut Accumulator,
    task: &'a dyn Task,
    fold: Fold,
    indices: Vec<usize>,
    last: Evaluation,
}

impl<'a> NetworkFunction<'a> {
    /// Evaluates `accumulator` over the samples `indices` of `fold`.
    ///
    /// **Errors**
    /// `indices` must not be empty and must be less than the size of `fold`.
    pub fn new(
        accumulator: &'a mut Accumulator,
        task: &'a dyn Task,
        fold: Fold,
        indices: Vec<usize>,
    ) -> Result<Self> {
        ensure!(!indices.is_empty(), "no samples in {fold}");
        let size = task.size(fold);
        ensure!(
            indices.iter().all(|i| *i < size),
            "sample index out of range for {fold} of size {size}"
        );
        Ok(Self {
            accumulator,
            task,
            fold,
            indices,
            last: Evaluation::default(),
        })
    }
    /// All samples of `fold`.
    pub fn with_fold(accumulator: &'a mut Accumulator, task: &'a dyn Task, fold: Fold) -> Result<Self> {
        let indices = (0..task.size(fold)).collect();
        Self::new(accumulator, task, fold, indices)
    }
    /// The evaluation of the last call to [`Function::value()`] or [`Function::vgrad()`].
    pub fn last_evaluation(&self) -> Evaluation {
        self.last
    }
    fn set_params(&mut self, x: &Vector) -> Result<()> {
        match x.as_slice() {
            Some(x) => self.accumulator.set_params(x),
            None => self.accumulator.set_params(&x.to_vec()),
        }
    }
}

impl Function for NetworkFunction<'_> {
    fn size(&self) -> usize {
        self.accumulator.param_count()
    }
    fn value(&mut self, x: &Vector) -> Result<Scalar> {
        self.set_params(x)?;
        self.last = self.accumulator.value(self.task, self.fold, &self.indices)?;
        Ok(self.last.value)
    }
    fn vgrad(&mut self, x: &Vector, grad: &mut Vector) -> Result<Scalar> {
        self.set_params(x)?;
        let (evaluation, g) = self.accumulator.vgrad(self.task, self.fold, &self.indices)?;
        self.last = evaluation;
        *grad = g;
        Ok(evaluation.value)
    }
}

/// `sum(x_i^2)`
#[derive(Debug, Clone, Copy)]
pub struct Sphere {
    size: usize,
}

impl Sphere {
    /// Creates a sphere of `size` dimensions.
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

impl Function for Sphere {
    fn size(&self) -> usize {
        self.size
    }
    fn value(&mut self, x: &Vector) -> Result<Scalar> {
        Ok(x.dot(x))
    }
    fn vgrad(&mut self, x: &Vector, grad: &mut Vector) -> Result<Scalar> {
        *grad = x * 2.;
        Ok(x.dot(x))
    }
}

/// `sum((i + 1) * x_i^2)`, an ill conditioned quadratic.
#[derive(Debug, Clone, Copy)]
pub struct Ellipse {
    size: usize,
}

impl Ellipse {
    /// Creates an ellipse of `size` dimensions.
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

impl Function for Ellipse {
    fn size(&self) -> usize {
        self.size
    }
    fn value(&mut self, x: &Vector) -> Result<Scalar> {
        Ok(x.iter()
            .enumerate()
            .map(|(i, x)| (i + 1) as Scalar * x * x)
            .sum())
    }
    fn vgrad(&mut self, x: &Vector, grad: &mut Vector) -> Result<Scalar> {
        *grad = Vector::from_shape_fn(x.len(), |i| 2. * (i + 1) as Scalar * x[i]);
        self.value(x)
    }
}

/// `sum(100 * (x_{i+1} - x_i^2)^2 + (1 - x_i)^2)`, minimized at `x = 1`.
#[derive(Debug, Clone, Copy)]
pub struct Rosenbrock {
    size: usize,
}

impl Rosenbrock {
    /// **Errors**
    /// `size` must be at least 2.
    pub fn new(size: usize) -> Result<Self> {
        ensure!(size >= 2, "rosenbrock needs at least 2 dimensions");
        Ok(Self { size })
    }
}

impl Function for Rosenbrock {
    fn size(&self) -> usize {
        self.size
    }
    fn value(&mut self, x: &Vector) -> Result<Scalar> {
        Ok(x.windows(2)
            .into_iter()
            .map(|w| 100. * (w[1] - w[0] * w[0]).powi(2) + (1. - w[0]).powi(2))
            .sum())
    }
    fn vgrad(&mut self, x: &Vector, grad: &mut Vector) -> Result<Scalar> {
        *grad = Vector::zeros(x.len());
        for i in 0..x.len() - 1 {
            let d = x[i + 1] - x[i] * x[i];
            grad[i] += -400. * d * x[i] - 2. * (1. - x[i]);
            grad[i + 1] += 200. * d;
        }
        self.value(x)
    }
}
