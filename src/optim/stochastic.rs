use crate::{error::ConfigError, Scalar, Vector};
use anyhow::{Error, Result};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, str::FromStr};

/// A stochastic optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum StochKind {
    /// Stochastic gradient.
    #[display(fmt = "sg")]
    Sg,
    /// Stochastic gradient with momentum.
    #[display(fmt = "sgm")]
    Sgm,
    /// Normalized gradient descent.
    #[display(fmt = "ngd")]
    Ngd,
    /// Nesterov accelerated gradient.
    #[display(fmt = "ag")]
    Ag,
    /// Nesterov accelerated gradient, restarted when the value increases.
    #[display(fmt = "agfr")]
    Agfr,
    /// Nesterov accelerated gradient, restarted when the gradient opposes the last step.
    #[display(fmt = "aggr")]
    Aggr,
    /// Adam.
    #[display(fmt = "adam")]
    Adam,
    /// Adagrad.
    #[display(fmt = "adagrad")]
    Adagrad,
    /// Adadelta.
    #[display(fmt = "adadelta")]
    Adadelta,
    /// RMSProp.
    #[display(fmt = "rmsprop")]
    RmsProp,
}

impl StochKind {
    /// All kinds.
    pub const ALL: [Self; 10] = [
        Self::Sg,
        Self::Sgm,
        Self::Ngd,
        Self::Ag,
        Self::Agfr,
        Self::Aggr,
        Self::Adam,
        Self::Adagrad,
        Self::Adadelta,
        Self::RmsProp,
    ];
}

impl FromStr for StochKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|x| x.to_string() == s)
            .ok_or_else(|| {
                ConfigError::UnknownKind {
                    what: "stochastic optimizer",
                    name: s.to_string(),
                    known: Self::ALL.iter().map(|x| x.to_string()).collect(),
                }
                .into()
            })
    }
}

/// Updates parameters from minibatch gradients.
pub trait Stochastic: Debug + Send {
    /// The kind.
    fn kind(&self) -> StochKind;
    /// Clears the state, starting from `x`.
    fn reset(&mut self, x: &Vector);
    /// The point at which the next gradient is evaluated.
    fn query<'a>(&'a self, x: &'a Vector) -> &'a Vector {
        x
    }
    /// Updates `x` from the value `fx` and the gradient `g` at [`.query(x)`](Stochastic::query).
    fn update(&mut self, rate: Scalar, x: &mut Vector, fx: Scalar, g: &Vector);
}

/// `x -= rate * g`
#[derive(Debug, Default, Clone)]
pub struct Sg;

impl Stochastic for Sg {
    fn kind(&self) -> StochKind {
        StochKind::Sg
    }
    fn reset(&mut self, _x: &Vector) {}
    fn update(&mut self, rate: Scalar, x: &mut Vector, _fx: Scalar, g: &Vector) {
        x.scaled_add(-rate, g);
    }
}

/// `v = momentum * v - rate * g`, `x += v`
#[derive(Debug, Clone)]
pub struct Sgm {
    momentum: Scalar,
    velocity: Vector,
}

impl Sgm {
    /// **Errors**
    /// `momentum` must be in [0, 1).
    pub fn new(momentum: Scalar) -> Result<Self> {
        if !(0. ..1.).contains(&momentum) {
            return Err(ConfigError::invalid("momentum", momentum, "must be in [0, 1)").into());
        }
        Ok(Self {
            momentum,
            velocity: Vector::zeros(0),
        })
    }
}

impl Stochastic for Sgm {
    fn kind(&self) -> StochKind {
        StochKind::Sgm
    }
    fn reset(&mut self, x: &Vector) {
        self.velocity = Vector::zeros(x.len());
    }
    fn update(&mut self, rate: Scalar, x: &mut Vector, _fx: Scalar, g: &Vector) {
        self.velocity *= self.momentum;
        self.velocity.scaled_add(-rate, g);
        *x += &self.velocity;
    }
}

/// `x -= rate * g / |g|`
#[derive(Debug, Default, Clone)]
pub struct Ngd;

impl Stochastic for Ngd {
    fn kind(&self) -> StochKind {
        StochKind::Ngd
    }
    fn reset(&mut self, _x: &Vector) {}
    fn update(&mut self, rate: Scalar, x: &mut Vector, _fx: Scalar, g: &Vector) {
        let norm = g.dot(g).sqrt();
        if norm > 0. {
            x.scaled_add(-rate / norm, g);
        }
    }
}

/// When [`Ag`] drops its momentum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgRestart {
    /// Never.
    None,
    /// When the value increases.
    Function,
    /// When the gradient opposes the last step.
    Gradient,
}

/// Nesterov's accelerated gradient.
///
/// The gradient is evaluated at the extrapolated point
/// `y = x + k / (k + 3) * (x - x_prev)`, then `x = y - rate * g(y)`.
#[derive(Debug, Clone)]
pub struct Ag {
    restart: AgRestart,
    y: Vector,
    k: usize,
    fprev: Scalar,
}

impl Ag {
    /// Creates the optimizer.
    pub fn new(restart: AgRestart) -> Self {
        Self {
            restart,
            y: Vector::zeros(0),
            k: 0,
            fprev: Scalar::INFINITY,
        }
    }
    /// The extrapolation counter, 0 after a restart.
    pub fn momentum_steps(&self) -> usize {
        self.k
    }
}

impl Stochastic for Ag {
    fn kind(&self) -> StochKind {
        match self.restart {
            AgRestart::None => StochKind::Ag,
            AgRestart::Function => StochKind::Agfr,
            AgRestart::Gradient => StochKind::Aggr,
        }
    }
    fn reset(&mut self, x: &Vector) {
        self.y = x.clone();
        self.k = 0;
        self.fprev = Scalar::INFINITY;
    }
    fn query<'a>(&'a self, x: &'a Vector) -> &'a Vector {
        if self.y.len() == x.len() {
            &self.y
        } else {
            x
        }
    }
    fn update(&mut self, rate: Scalar, x: &mut Vector, fx: Scalar, g: &Vector) {
        if self.y.len() != x.len() {
            self.reset(x);
        }
        let mut next = self.y.clone();
        next.scaled_add(-rate, g);
        let step = &next - &*x;
        let restart = match self.restart {
            AgRestart::None => false,
            AgRestart::Function => fx > self.fprev,
            AgRestart::Gradient => g.dot(&step) > 0.,
        };
        self.fprev = fx;
        if restart {
            self.k = 0;
            self.y = next.clone();
        } else {
            let k = self.k as Scalar;
            self.y = &next + &(step * (k / (k + 3.)));
            self.k += 1;
        }
        *x = next;
    }
}

/// Adam, with bias corrected moments.
#[derive(Debug, Clone)]
pub struct Adam {
    beta1: Scalar,
    beta2: Scalar,
    epsilon: Scalar,
    m: Vector,
    v: Vector,
    t: i32,
}

impl Adam {
    /// **Errors**
    /// `beta1` and `beta2` must be in [0, 1), `epsilon` must be positive.
    pub fn new(beta1: Scalar, beta2: Scalar, epsilon: Scalar) -> Result<Self> {
        for (key, beta) in [("beta1", beta1), ("beta2", beta2)] {
            if !(0. ..1.).contains(&beta) {
                return Err(ConfigError::invalid(key, beta, "must be in [0, 1)").into());
            }
        }
        check_epsilon(epsilon)?;
        Ok(Self {
            beta1,
            beta2,
            epsilon,
            m: Vector::zeros(0),
            v: Vector::zeros(0),
            t: 0,
        })
    }
}

impl Stochastic for Adam {
    fn kind(&self) -> StochKind {
        StochKind::Adam
    }
    fn reset(&mut self, x: &Vector) {
        self.m = Vector::zeros(x.len());
        self.v = Vector::zeros(x.len());
        self.t = 0;
    }
    fn update(&mut self, rate: Scalar, x: &mut Vector, _fx: Scalar, g: &Vector) {
        let Self {
            beta1,
            beta2,
            epsilon,
            ..
        } = *self;
        self.t = self.t.saturating_add(1);
        let c1 = 1. - beta1.powi(self.t);
        let c2 = 1. - beta2.powi(self.t);
        ndarray::Zip::from(x)
            .and(&mut self.m)
            .and(&mut self.v)
            .and(g)
            .for_each(|x, m, v, g| {
                *m = beta1 * *m + (1. - beta1) * g;
                *v = beta2 * *v + (1. - beta2) * g * g;
                *x -= rate * (*m / c1) / ((*v / c2).sqrt() + epsilon);
            });
    }
}

/// `v += g^2`, `x -= rate * g / (sqrt(v) + epsilon)`
#[derive(Debug, Clone)]
pub struct Adagrad {
    epsilon: Scalar,
    v: Vector,
}

impl Adagrad {
    /// **Errors**
    /// `epsilon` must be positive.
    pub fn new(epsilon: Scalar) -> Result<Self> {
        check_epsilon(epsilon)?;
        Ok(Self {
            epsilon,
            v: Vector::zeros(0),
        })
    }
}

impl Stochastic for Adagrad {
    fn kind(&self) -> StochKind {
        StochKind::Adagrad
    }
    fn reset(&mut self, x: &Vector) {
        self.v = Vector::zeros(x.len());
    }
    fn update(&mut self, rate: Scalar, x: &mut Vector, _fx: Scalar, g: &Vector) {
        let epsilon = self.epsilon;
        ndarray::Zip::from(x)
            .and(&mut self.v)
            .and(g)
            .for_each(|x, v, g| {
                *v += g * g;
                *x -= rate * g / (v.sqrt() + epsilon);
            });
    }
}

/// `v = rho * v + (1 - rho) * g^2`, `x -= rate * g / (sqrt(v) + epsilon)`
#[derive(Debug, Clone)]
pub struct RmsProp {
    rho: Scalar,
    epsilon: Scalar,
    v: Vector,
}

impl RmsProp {
    /// **Errors**
    /// `rho` must be in [0, 1), `epsilon` must be positive.
    pub fn new(rho: Scalar, epsilon: Scalar) -> Result<Self> {
        check_rho(rho)?;
        check_epsilon(epsilon)?;
        Ok(Self {
            rho,
            epsilon,
            v: Vector::zeros(0),
        })
    }
}

impl Stochastic for RmsProp {
    fn kind(&self) -> StochKind {
        StochKind::RmsProp
    }
    fn reset(&mut self, x: &Vector) {
        self.v = Vector::zeros(x.len());
    }
    fn update(&mut self, rate: Scalar, x: &mut Vector, _fx: Scalar, g: &Vector) {
        let Self { rho, epsilon, .. } = *self;
        ndarray::Zip::from(x)
            .and(&mut self.v)
            .and(g)
            .for_each(|x, v, g| {
                *v = rho * *v + (1. - rho) * g * g;
                *x -= rate * g / (v.sqrt() + epsilon);
            });
    }
}

/// Adadelta, scaled by the learning rate.
///
/// `dx = -sqrt(u + epsilon) / sqrt(v + epsilon) * g` with `v` and `u` the moving averages of
/// `g^2` and `dx^2`.
#[derive(Debug, Clone)]
pub struct Adadelta {
    rho: Scalar,
    epsilon: Scalar,
    v: Vector,
    u: Vector,
}

impl Adadelta {
    /// **Errors**
    /// `rho` must be in [0, 1), `epsilon` must be positive.
    pub fn new(rho: Scalar, epsilon: Scalar) -> Result<Self> {
        check_rho(rho)?;
        check_epsilon(epsilon)?;
        Ok(Self {
            rho,
            epsilon,
            v: Vector::zeros(0),
            u: Vector::zeros(0),
        })
    }
}

impl Stochastic for Adadelta {
    fn kind(&self) -> StochKind {
        StochKind::Adadelta
    }
    fn reset(&mut self, x: &Vector) {
        self.v = Vector::zeros(x.len());
        self.u = Vector::zeros(x.len());
    }
    fn update(&mut self, rate: Scalar, x: &mut Vector, _fx: Scalar, g: &Vector) {
        let Self { rho, epsilon, .. } = *self;
        ndarray::Zip::from(x)
            .and(&mut self.v)
            .and(&mut self.u)
            .and(g)
            .for_each(|x, v, u, g| {
                *v = rho * *v + (1. - rho) * g * g;
                let dx = -((*u + epsilon).sqrt() / (*v + epsilon).sqrt()) * g;
                *u = rho * *u + (1. - rho) * dx * dx;
                *x += rate * dx;
            });
    }
}

fn check_epsilon(epsilon: Scalar) -> Result<()> {
    if !(epsilon > 0. && epsilon.is_finite()) {
        return Err(ConfigError::invalid("epsilon", epsilon, "must be positive").into());
    }
    Ok(())
}

fn check_rho(rho: Scalar) -> Result<()> {
    if !(0. ..1.).contains(&rho) {
        return Err(ConfigError::invalid("rho", rho, "must be in [0, 1)").into());
    }
    Ok(())
}

/// `rate(t) = initial / (1 + t)^decay`, with `t` the number of updates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningRate {
    /// The rate of the first update.
    pub initial: Scalar,
    /// The decay exponent in [0, 1], 0 is constant.
    pub decay: Scalar,
}

impl Default for LearningRate {
    fn default() -> Self {
        Self {
            initial: 0.01,
            decay: 0.,
        }
    }
}

impl LearningRate {
    /// A constant rate.
    pub fn constant(initial: Scalar) -> Self {
        Self { initial, decay: 0. }
    }
    /// Sets the decay exponent.
    pub fn with_decay(self, decay: Scalar) -> Self {
        Self { decay, ..self }
    }
    /// The rate of update `t`.
    pub fn at(&self, t: usize) -> Scalar {
        if self.decay == 0. {
            self.initial
        } else {
            self.initial / (1. + t as Scalar).powf(self.decay)
        }
    }
    fn check(&self) -> Result<()> {
        if !(self.initial > 0. && self.initial.is_finite()) {
            return Err(ConfigError::invalid("rate", self.initial, "must be positive").into());
        }
        if !(0. ..=1.).contains(&self.decay) {
            return Err(ConfigError::invalid("decay", self.decay, "must be in [0, 1]").into());
        }
        Ok(())
    }
}

/// Stochastic optimizer settings.
///
/// Hyper-parameters left as `None` take the conventional default of the kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StochConfig {
    /// The optimizer.
    pub kind: StochKind,
    /// The number of samples per minibatch.
    pub batch_size: usize,
    /// The learning rate schedule.
    pub rate: LearningRate,
    /// Momentum of [`Sgm`], default 0.9.
    pub momentum: Option<Scalar>,
    /// First moment decay of [`Adam`], default 0.9.
    pub beta1: Option<Scalar>,
    /// Second moment decay of [`Adam`], default 0.999.
    pub beta2: Option<Scalar>,
    /// Moving average decay of [`RmsProp`] (default 0.9) and [`Adadelta`] (default 0.95).
    pub rho: Option<Scalar>,
    /// Denominator offset, default 1e-6 for [`Adadelta`] and 1e-8 otherwise.
    pub epsilon: Option<Scalar>,
    /// Candidate initial rates tried before training. Empty disables tuning.
    pub tune_rates: Vec<Scalar>,
    /// The number of epochs each candidate rate is trained for.
    pub tune_epochs: usize,
}

impl Default for StochConfig {
    fn default() -> Self {
        Self {
            kind: StochKind::Adam,
            batch_size: 32,
            rate: LearningRate::default(),
            momentum: None,
            beta1: None,
            beta2: None,
            rho: None,
            epsilon: None,
            tune_rates: Vec::new(),
            tune_epochs: 1,
        }
    }
}

impl StochConfig {
    /// The default settings of `kind`.
    pub fn new(kind: StochKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }
    /// Sets the minibatch size.
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }
    /// Sets the learning rate schedule.
    pub fn with_rate(self, rate: LearningRate) -> Self {
        Self { rate, ..self }
    }
    /// Sets the momentum.
    pub fn with_momentum(self, momentum: Scalar) -> Self {
        Self {
            momentum: Some(momentum),
            ..self
        }
    }
    /// Sets the Adam moment decays.
    pub fn with_betas(self, beta1: Scalar, beta2: Scalar) -> Self {
        Self {
            beta1: Some(beta1),
            beta2: Some(beta2),
            ..self
        }
    }
    /// Sets the moving average decay.
    pub fn with_rho(self, rho: Scalar) -> Self {
        Self {
            rho: Some(rho),
            ..self
        }
    }
    /// Sets the denominator offset.
    pub fn with_epsilon(self, epsilon: Scalar) -> Self {
        Self {
            epsilon: Some(epsilon),
            ..self
        }
    }
    /// Sets the candidate rates and the epochs per candidate.
    pub fn with_tuning(self, tune_rates: Vec<Scalar>, tune_epochs: usize) -> Self {
        Self {
            tune_rates,
            tune_epochs,
            ..self
        }
    }
    /// Validates the settings and creates the optimizer.
    pub fn build(&self) -> Result<Box<dyn Stochastic>> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", 0, "must be positive").into());
        }
        self.rate.check()?;
        if let Some(rate) = self
            .tune_rates
            .iter()
            .find(|x| !(**x > 0. && x.is_finite()))
        {
            return Err(ConfigError::invalid("tune_rates", rate, "must be positive").into());
        }
        if !self.tune_rates.is_empty() && self.tune_epochs == 0 {
            return Err(ConfigError::invalid("tune_epochs", 0, "must be positive").into());
        }
        let epsilon = self.epsilon.unwrap_or(match self.kind {
            StochKind::Adadelta => 1e-6,
            _ => 1e-8,
        });
        Ok(match self.kind {
            StochKind::Sg => Box::new(Sg),
            StochKind::Sgm => Box::new(Sgm::new(self.momentum.unwrap_or(0.9))?),
            StochKind::Ngd => Box::new(Ngd),
            StochKind::Ag => Box::new(Ag::new(AgRestart::None)),
            StochKind::Agfr => Box::new(Ag::new(AgRestart::Function)),
            StochKind::Aggr => Box::new(Ag::new(AgRestart::Gradient)),
            StochKind::Adam => Box::new(Adam::new(
                self.beta1.unwrap_or(0.9),
                self.beta2.unwrap_or(0.999),
                epsilon,
            )?),
            StochKind::Adagrad => Box::new(Adagrad::new(epsilon)?),
            StochKind::Adadelta => Box::new(Adadelta::new(self.rho.unwrap_or(0.95), epsilon)?),
            StochKind::RmsProp => Box::new(RmsProp::new(self.rho.unwrap_or(0.9), epsilon)?),
        })
    }
}
