use crate::{registry::Registry, tensor::Tensor, Scalar};
use std::fmt::Debug;

/// A per-sample loss of a network output against a target.
///
/// Classification losses expect targets coded as `+1` for positive and `-1` for negative
/// classes.
pub trait Loss: Debug + Send + Sync {
    /// The registry name.
    fn kind(&self) -> &'static str;
    /// The loss value.
    fn value(&self, target: &Tensor, output: &Tensor) -> Scalar;
    /// The error, ie the classification error or the L1 distance.
    fn error(&self, target: &Tensor, output: &Tensor) -> Scalar;
    /// Writes the gradient w.r.t. `output` into `grad` and returns the value.
    fn vgrad(&self, target: &Tensor, output: &Tensor, grad: &mut Tensor) -> Scalar;
    /// The gradient w.r.t. `output`.
    fn gradient(&self, target: &Tensor, output: &Tensor) -> Tensor {
        let mut grad = Tensor::zeros(output.dims());
        self.vgrad(target, output, &mut grad);
        grad
    }
}

/// The default loss registry.
///
/// | name | value | error |
/// |------|-------|-------|
/// | `square` | `1/2 * sum((o - t)^2)` | L1 distance |
/// | `cauchy` | `1/2 * sum(log(1 + (o - t)^2))` | L1 distance |
/// | `logistic` | `sum(log(1 + exp(-t * o)))` | 1 if any sign differs |
/// | `classnll` | `log(sum(exp(o))) - log(sum(exp(o[t > 0])))` | 1 if the arg max is negative |
pub fn registry() -> Registry<Box<dyn Loss>> {
    let mut registry = Registry::<Box<dyn Loss>>::new("loss");
    registry
        .register("square", "squared error", |_| Ok(Box::new(Square)))
        .register("cauchy", "robust cauchy error", |_| Ok(Box::new(Cauchy)))
        .register("logistic", "multi label logistic", |_| Ok(Box::new(Logistic)))
        .register("classnll", "single label negative log likelihood", |_| {
            Ok(Box::new(ClassNll))
        });
    registry
}

fn l1(target: &Tensor, output: &Tensor) -> Scalar {
    target
        .iter()
        .zip(output.iter())
        .map(|(t, o)| (o - t).abs())
        .sum()
}

/// `log(1 + exp(x))` without overflow.
fn softplus(x: Scalar) -> Scalar {
    x.max(0.) + (-x.abs()).exp().ln_1p()
}

fn sigmoid(x: Scalar) -> Scalar {
    if x >= 0. {
        1. / (1. + (-x).exp())
    } else {
        let e = x.exp();
        e / (1. + e)
    }
}

/// Squared error.
#[derive(Debug, Default, Clone, Copy)]
pub struct Square;

impl Loss for Square {
    fn kind(&self) -> &'static str {
        "square"
    }
    fn value(&self, target: &Tensor, output: &Tensor) -> Scalar {
        0.5 * target
            .iter()
            .zip(output.iter())
            .map(|(t, o)| (o - t) * (o - t))
            .sum::<Scalar>()
    }
    fn error(&self, target: &Tensor, output: &Tensor) -> Scalar {
        l1(target, output)
    }
    fn vgrad(&self, target: &Tensor, output: &Tensor, grad: &mut Tensor) -> Scalar {
        let mut value = 0.;
        for (g, (t, o)) in grad
            .as_slice_mut()
            .iter_mut()
            .zip(target.iter().zip(output.iter()))
        {
            let d = o - t;
            value += d * d;
            *g = d;
        }
        0.5 * value
    }
}

/// Cauchy error, less sensitive to outliers than [`Square`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Cauchy;

impl Loss for Cauchy {
    fn kind(&self) -> &'static str {
        "cauchy"
    }
    fn value(&self, target: &Tensor, output: &Tensor) -> Scalar {
        0.5 * target
            .iter()
            .zip(output.iter())
            .map(|(t, o)| ((o - t) * (o - t)).ln_1p())
            .sum::<Scalar>()
    }
    fn error(&self, target: &Tensor, output: &Tensor) -> Scalar {
        l1(target, output)
    }
    fn vgrad(&self, target: &Tensor, output: &Tensor, grad: &mut Tensor) -> Scalar {
        let mut value = 0.;
        for (g, (t, o)) in grad
            .as_slice_mut()
            .iter_mut()
            .zip(target.iter().zip(output.iter()))
        {
            let d = o - t;
            value += (d * d).ln_1p();
            *g = d / (1. + d * d);
        }
        0.5 * value
    }
}

/// Logistic loss, summed over independent ±1 labels.
#[derive(Debug, Default, Clone, Copy)]
pub struct Logistic;

impl Loss for Logistic {
    fn kind(&self) -> &'static str {
        "logistic"
    }
    fn value(&self, target: &Tensor, output: &Tensor) -> Scalar {
        target
            .iter()
            .zip(output.iter())
            .map(|(t, o)| softplus(-t * o))
            .sum()
    }
    fn error(&self, target: &Tensor, output: &Tensor) -> Scalar {
        let wrong = target.iter().zip(output.iter()).any(|(t, o)| t * o <= 0.);
        if wrong {
            1.
        } else {
            0.
        }
    }
    fn vgrad(&self, target: &Tensor, output: &Tensor, grad: &mut Tensor) -> Scalar {
        let mut value = 0.;
        for (g, (t, o)) in grad
            .as_slice_mut()
            .iter_mut()
            .zip(target.iter().zip(output.iter()))
        {
            value += softplus(-t * o);
            *g = -t * sigmoid(-t * o);
        }
        value
    }
}

/// Negative log likelihood of the positive classes under a softmax of the outputs.
///
/// A target without a positive entry has no class to score, so its value and gradient are 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClassNll;

impl ClassNll {
    /// Returns `log(sum(exp(o)))` over all outputs and over the positive targets, or `None`
    /// without a positive target.
    fn log_sums(target: &Tensor, output: &Tensor) -> Option<(Scalar, Scalar)> {
        let positive: Vec<Scalar> = target
            .iter()
            .zip(output.iter())
            .filter(|(t, _)| **t > 0.)
            .map(|(_, o)| *o)
            .collect();
        if positive.is_empty() {
            return None;
        }
        Some((log_sum_exp(output.as_slice()), log_sum_exp(&positive)))
    }
}

fn log_sum_exp(values: &[Scalar]) -> Scalar {
    let max = values.iter().copied().fold(Scalar::NEG_INFINITY, Scalar::max);
    max + values.iter().map(|x| (x - max).exp()).sum::<Scalar>().ln()
}

impl Loss for ClassNll {
    fn kind(&self) -> &'static str {
        "classnll"
    }
    fn value(&self, target: &Tensor, output: &Tensor) -> Scalar {
        Self::log_sums(target, output).map_or(0., |(all, positive)| all - positive)
    }
    fn error(&self, target: &Tensor, output: &Tensor) -> Scalar {
        match output.argmax() {
            Some(i) if target.as_slice()[i] > 0. => 0.,
            _ => 1.,
        }
    }
    fn vgrad(&self, target: &Tensor, output: &Tensor, grad: &mut Tensor) -> Scalar {
        let Some((all, positive)) = Self::log_sums(target, output) else {
            grad.fill(0.);
            return 0.;
        };
        for (g, (t, o)) in grad
            .as_slice_mut()
            .iter_mut()
            .zip(target.iter().zip(output.iter()))
        {
            *g = (o - all).exp();
            if *t > 0. {
                *g -= (o - positive).exp();
            }
        }
        all - positive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Dims;
    use approx::assert_abs_diff_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn tensor(data: &[Scalar]) -> Tensor {
        Tensor::from_vec(Dims::flat(data.len()), data.to_vec()).unwrap()
    }

    #[test]
    fn gradients() {
        let h = 1e-6;
        let mut rng = StdRng::seed_from_u64(0);
        let target = tensor(&[1., -1., -1., 1., -1.]);
        for name in ["square", "cauchy", "logistic", "classnll"] {
            let loss = registry().build(name).unwrap();
            assert_eq!(loss.kind(), name);
            let output = Tensor::random(target.dims(), &mut rng, -2., 2.);
            let mut grad = Tensor::default();
            grad.resize(output.dims());
            let value = loss.vgrad(&target, &output, &mut grad);
            assert_abs_diff_eq!(value, loss.value(&target, &output), epsilon = 1e-12);
            assert_eq!(loss.gradient(&target, &output), grad);
            for i in 0..output.size() {
                let mut x = output.clone();
                x.as_slice_mut()[i] += h;
                let fp = loss.value(&target, &x);
                x.as_slice_mut()[i] -= 2. * h;
                let fm = loss.value(&target, &x);
                assert_abs_diff_eq!(grad.as_slice()[i], (fp - fm) / (2. * h), epsilon = 1e-7);
            }
        }
    }

    #[test]
    fn values() {
        let target = tensor(&[1., -1.]);
        let output = tensor(&[3., -1.]);
        assert_abs_diff_eq!(Square.value(&target, &output), 2.);
        assert_abs_diff_eq!(Square.error(&target, &output), 2.);
        assert_abs_diff_eq!(Cauchy.value(&target, &output), 0.5 * (5 as Scalar).ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(
            Logistic.value(&target, &output),
            (1. + (-3 as Scalar).exp()).ln() + (1. + (-1 as Scalar).exp()).ln(),
            epsilon = 1e-12
        );
        assert_eq!(Logistic.error(&target, &output), 0.);
        assert_eq!(Logistic.error(&target, &tensor(&[3., 0.5])), 1.);
        let nll = ClassNll.value(&target, &output);
        assert_abs_diff_eq!(nll, (1. + (-4 as Scalar).exp()).ln(), epsilon = 1e-12);
        assert_eq!(ClassNll.error(&target, &output), 0.);
        assert_eq!(ClassNll.error(&target, &tensor(&[-1., 2.])), 1.);
    }

    #[test]
    fn large_outputs_are_finite() {
        let target = tensor(&[1., -1., -1.]);
        let output = tensor(&[-900., 800., 1000.]);
        for name in ["logistic", "classnll"] {
            let loss = registry().build(name).unwrap();
            let grad = loss.gradient(&target, &output);
            assert!(loss.value(&target, &output).is_finite(), "{name}");
            assert!(grad.is_finite(), "{name}");
        }
        assert_abs_diff_eq!(ClassNll.value(&target, &output), 1900., epsilon = 1e-9);
    }

    #[test]
    fn classnll_without_positive_target() {
        let target = tensor(&[-1., -1., 0.]);
        let output = tensor(&[0.5, 2., -1.]);
        assert_eq!(ClassNll.value(&target, &output), 0.);
        assert_eq!(ClassNll.error(&target, &output), 1.);
        let mut grad = Tensor::from_elem(output.dims(), 7.);
        assert_eq!(ClassNll.vgrad(&target, &output, &mut grad), 0.);
        assert!(grad.iter().all(|g| *g == 0.));
    }
}
