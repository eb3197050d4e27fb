use crate::{error::ConfigError, registry::Registry, Scalar};
use anyhow::Result;
use std::fmt::Debug;

/// Aggregates per-sample losses into one value, optionally regularized by the parameters.
///
/// The gradient of the aggregate w.r.t. the parameters is `sum(w_i * dl_i) + dr`, with the
/// per-sample weights `w_i` from [`.weights()`](Self::weights()) and `dr` from
/// [`.regularize()`](Self::regularize()).
pub trait Criterion: Debug + Send + Sync {
    /// The registry name.
    fn kind(&self) -> &'static str;
    /// The registry description, including parameters.
    fn describe(&self) -> String {
        self.kind().to_string()
    }
    /// Whether the weights depend on the losses.
    ///
    /// If so the accumulator needs all losses before it can weight the gradients.
    fn two_pass(&self) -> bool {
        false
    }
    /// The aggregate value.
    fn value(&self, losses: &[Scalar], params: &[Scalar]) -> Scalar;
    /// The derivatives of [`.value()`](Self::value()) w.r.t. each loss.
    fn weights(&self, losses: &[Scalar]) -> Vec<Scalar> {
        let n = losses.len();
        vec![1. / n as Scalar; n]
    }
    /// Adds the gradient of the parameter regularizer to `grad`.
    #[allow(unused)]
    fn regularize(&self, params: &[Scalar], grad: &mut [Scalar]) {}
}

/// The default criterion registry.
///
/// | name | value |
/// |------|-------|
/// | `avg` | mean loss |
/// | `avg-l2n-reg` | mean loss + `lambda / 2 * |x|^2`, `lambda` (default 0.01) |
/// | `avg-var-reg` | mean loss + `lambda * variance`, `lambda` (default 0.1) |
/// | `max` | `log(mean(exp(beta * l))) / beta`, `beta` (default 5) |
pub fn registry() -> Registry<Box<dyn Criterion>> {
    let mut registry = Registry::<Box<dyn Criterion>>::new("criterion");
    registry
        .register("avg", "average loss", |_| Ok(Box::new(Average)))
        .register("avg-l2n-reg", "average loss + L2 norm of the parameters", |params| {
            Ok(Box::new(L2Regularized::new(params.get("lambda", 0.01)?)?))
        })
        .register("avg-var-reg", "average loss + variance of the losses", |params| {
            Ok(Box::new(VarianceRegularized::new(params.get("lambda", 0.1)?)?))
        })
        .register("max", "soft maximum loss", |params| {
            Ok(Box::new(SoftMax::new(params.get("beta", 5.)?)?))
        });
    registry
}

fn mean(losses: &[Scalar]) -> Scalar {
    if losses.is_empty() {
        0.
    } else {
        losses.iter().sum::<Scalar>() / losses.len() as Scalar
    }
}

/// Mean loss.
#[derive(Debug, Default, Clone, Copy)]
pub struct Average;

impl Criterion for Average {
    fn kind(&self) -> &'static str {
        "avg"
    }
    fn value(&self, losses: &[Scalar], _: &[Scalar]) -> Scalar {
        mean(losses)
    }
}

/// Mean loss plus `lambda / 2 * |x|^2`.
#[derive(Debug, Clone, Copy)]
pub struct L2Regularized {
    lambda: Scalar,
}

impl L2Regularized {
    /// **Errors**
    /// `lambda` must be finite and non negative.
    pub fn new(lambda: Scalar) -> Result<Self> {
        if !(lambda.is_finite() && lambda >= 0.) {
            return Err(ConfigError::invalid("lambda", lambda, "must be finite and >= 0").into());
        }
        Ok(Self { lambda })
    }
}

impl Criterion for L2Regularized {
    fn kind(&self) -> &'static str {
        "avg-l2n-reg"
    }
    fn describe(&self) -> String {
        format!("avg-l2n-reg:lambda={}", self.lambda)
    }
    fn value(&self, losses: &[Scalar], params: &[Scalar]) -> Scalar {
        mean(losses) + 0.5 * self.lambda * params.iter().map(|x| x * x).sum::<Scalar>()
    }
    fn regularize(&self, params: &[Scalar], grad: &mut [Scalar]) {
        for (g, x) in grad.iter_mut().zip(params) {
            *g += self.lambda * x;
        }
    }
}

/// Mean loss plus `lambda` times the variance of the losses.
///
/// Penalizes an uneven fit across samples.
#[derive(Debug, Clone, Copy)]
pub struct VarianceRegularized {
    lambda: Scalar,
}

impl VarianceRegularized {
    /// **Errors**
    /// `lambda` must be finite and non negative.
    pub fn new(lambda: Scalar) -> Result<Self> {
        if !(lambda.is_finite() && lambda >= 0.) {
            return Err(ConfigError::invalid("lambda", lambda, "must be finite and >= 0").into());
        }
        Ok(Self { lambda })
    }
}

impl Criterion for VarianceRegularized {
    fn kind(&self) -> &'static str {
        "avg-var-reg"
    }
    fn describe(&self) -> String {
        format!("avg-var-reg:lambda={}", self.lambda)
    }
    fn two_pass(&self) -> bool {
        true
    }
    fn value(&self, losses: &[Scalar], _: &[Scalar]) -> Scalar {
        let mu = mean(losses);
        let var = mean(&losses.iter().map(|l| (l - mu) * (l - mu)).collect::<Vec<_>>());
        mu + self.lambda * var
    }
    fn weights(&self, losses: &[Scalar]) -> Vec<Scalar> {
        let mu = mean(losses);
        let n = losses.len() as Scalar;
        losses
            .iter()
            .map(|l| (1. + 2. * self.lambda * (l - mu)) / n)
            .collect()
    }
}

/// Soft maximum of the losses, `log(mean(exp(beta * l))) / beta`.
///
/// Tends to the worst sample loss as `beta` grows.
#[derive(Debug, Clone, Copy)]
pub struct SoftMax {
    beta: Scalar,
}

impl SoftMax {
    /// **Errors**
    /// `beta` must be finite and positive.
    pub fn new(beta: Scalar) -> Result<Self> {
        if !(beta.is_finite() && beta > 0.) {
            return Err(ConfigError::invalid("beta", beta, "must be finite and > 0").into());
        }
        Ok(Self { beta })
    }
    fn max(losses: &[Scalar]) -> Scalar {
        losses.iter().copied().fold(Scalar::NEG_INFINITY, Scalar::max)
    }
}

impl Criterion for SoftMax {
    fn kind(&self) -> &'static str {
        "max"
    }
    fn describe(&self) -> String {
        format!("max:beta={}", self.beta)
    }
    fn two_pass(&self) -> bool {
        true
    }
    fn value(&self, losses: &[Scalar], _: &[Scalar]) -> Scalar {
        if losses.is_empty() {
            return 0.;
        }
        let beta = self.beta;
        let max = Self::max(losses);
        let sum: Scalar = losses.iter().map(|l| (beta * (l - max)).exp()).sum();
        max + (sum / losses.len() as Scalar).ln() / beta
    }
    fn weights(&self, losses: &[Scalar]) -> Vec<Scalar> {
        let beta = self.beta;
        let max = Self::max(losses);
        let exp: Vec<Scalar> = losses.iter().map(|l| (beta * (l - max)).exp()).collect();
        let sum: Scalar = exp.iter().sum();
        exp.into_iter().map(|e| e / sum).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const LOSSES: [Scalar; 5] = [0.5, 2., 0.1, 1.3, 0.7];
    const PARAMS: [Scalar; 3] = [1., -2., 0.5];

    #[test]
    fn weights_are_loss_derivatives() {
        let h = 1e-6;
        let registry = registry();
        for description in ["avg", "avg-l2n-reg:lambda=0.3", "avg-var-reg:lambda=0.7", "max:beta=3"] {
            let criterion = registry.build(description).unwrap();
            assert_eq!(criterion.describe(), description);
            let weights = criterion.weights(&LOSSES);
            assert_eq!(weights.len(), LOSSES.len());
            for i in 0..LOSSES.len() {
                let mut losses = LOSSES;
                losses[i] += h;
                let fp = criterion.value(&losses, &PARAMS);
                losses[i] -= 2. * h;
                let fm = criterion.value(&losses, &PARAMS);
                assert_abs_diff_eq!(weights[i], (fp - fm) / (2. * h), epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn regularizer_gradient() {
        let h = 1e-6;
        let registry = registry();
        for description in ["avg", "avg-l2n-reg:lambda=0.3", "avg-var-reg", "max"] {
            let criterion = registry.build(description).unwrap();
            let mut grad = [0.; 3];
            criterion.regularize(&PARAMS, &mut grad);
            for i in 0..PARAMS.len() {
                let mut params = PARAMS;
                params[i] += h;
                let fp = criterion.value(&LOSSES, &params);
                params[i] -= 2. * h;
                let fm = criterion.value(&LOSSES, &params);
                assert_abs_diff_eq!(grad[i], (fp - fm) / (2. * h), epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn values() {
        let mean = LOSSES.iter().sum::<Scalar>() / 5.;
        assert_abs_diff_eq!(Average.value(&LOSSES, &PARAMS), mean, epsilon = 1e-15);
        let l2 = L2Regularized::new(0.5).unwrap();
        assert_abs_diff_eq!(l2.value(&LOSSES, &PARAMS), mean + 0.25 * 5.25, epsilon = 1e-15);
        let var = VarianceRegularized::new(0.).unwrap();
        assert_abs_diff_eq!(var.value(&LOSSES, &PARAMS), mean, epsilon = 1e-15);
        for w in var.weights(&LOSSES) {
            assert_abs_diff_eq!(w, 0.2, epsilon = 1e-15);
        }
        let max = SoftMax::new(1e3).unwrap();
        let value = max.value(&LOSSES, &PARAMS);
        assert!(value <= 2. && value > 2. - 1e-2, "{value}");
        assert!(!Average.two_pass() && !l2.two_pass());
        assert!(var.two_pass() && max.two_pass());
    }

    #[test]
    fn invalid_parameters() {
        let registry = registry();
        for description in ["avg-l2n-reg:lambda=-1", "avg-var-reg:lambda=nan", "max:beta=0", "min"] {
            assert!(registry.build(description).is_err(), "{description}");
        }
    }
}
