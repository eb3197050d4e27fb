use super::{inf_norm, OptState};
use crate::{error::ConfigError, function::Function, Scalar, Vector};
use anyhow::{Error, Result};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How a step length is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
pub enum LineSearchKind {
    /// Halves the step until sufficient decrease.
    #[display(fmt = "backtrack-armijo")]
    BacktrackArmijo,
    /// Bisects until sufficient decrease and the curvature condition.
    #[display(fmt = "backtrack-wolfe")]
    BacktrackWolfe,
    /// Bisects until sufficient decrease and the strong curvature condition.
    #[display(fmt = "backtrack-strong-wolfe")]
    BacktrackStrongWolfe,
    /// Brackets and zooms with safeguarded cubic interpolation until the strong Wolfe
    /// conditions hold.
    #[display(fmt = "interpolation")]
    Interpolation,
}

impl LineSearchKind {
    /// All kinds.
    pub const ALL: [Self; 4] = [
        Self::BacktrackArmijo,
        Self::BacktrackWolfe,
        Self::BacktrackStrongWolfe,
        Self::Interpolation,
    ];
}

impl FromStr for LineSearchKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|x| x.to_string() == s)
            .ok_or_else(|| {
                ConfigError::UnknownKind {
                    what: "line search",
                    name: s.to_string(),
                    known: Self::ALL.iter().map(ToString::to_string).collect(),
                }
                .into()
            })
    }
}

/// How the first trial step of an iteration is chosen.
///
/// The first iteration always tries `1 / max(1, |g|_inf)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
pub enum LineSearchInit {
    /// `1`, natural for quasi Newton directions.
    #[display(fmt = "unit")]
    Unit,
    /// `min(1, 1.01 * 2 * (f - f_prev) / g.d)`, from a quadratic fit of the last decrease.
    #[display(fmt = "quadratic")]
    Quadratic,
    /// `t_prev * (g.d)_prev / g.d`, assuming the first order change is the same.
    #[display(fmt = "consistent")]
    Consistent,
}

/// Line search settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineSearchConfig {
    /// The acceptance strategy.
    pub kind: LineSearchKind,
    /// The initial step, or the default of the optimizer.
    pub init: Option<LineSearchInit>,
    /// The sufficient decrease constant.
    pub c1: Scalar,
    /// The curvature constant, or the default of the optimizer.
    pub c2: Option<Scalar>,
    /// The maximum number of trial steps per iteration.
    pub max_iterations: usize,
}

impl Default for LineSearchConfig {
    fn default() -> Self {
        Self {
            kind: LineSearchKind::Interpolation,
            init: None,
            c1: 1e-4,
            c2: None,
            max_iterations: 40,
        }
    }
}

impl LineSearchConfig {
    /// Sets the acceptance strategy.
    pub fn with_kind(self, kind: LineSearchKind) -> Self {
        Self { kind, ..self }
    }
    /// Sets the initial step.
    pub fn with_init(self, init: LineSearchInit) -> Self {
        Self {
            init: Some(init),
            ..self
        }
    }
    /// Sets the sufficient decrease constant.
    pub fn with_c1(self, c1: Scalar) -> Self {
        Self { c1, ..self }
    }
    /// Sets the curvature constant.
    pub fn with_c2(self, c2: Scalar) -> Self {
        Self {
            c2: Some(c2),
            ..self
        }
    }
    /// Sets the maximum number of trial steps per iteration.
    pub fn with_max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }
}

/// A trial step: length, value and directional derivative.
#[derive(Debug, Clone, Copy)]
struct Trial {
    t: Scalar,
    f: Scalar,
    dg: Scalar,
}

impl Trial {
    fn is_finite(&self) -> bool {
        self.f.is_finite() && self.dg.is_finite()
    }
}

/// Finds a step length along a descent direction.
#[derive(Debug, Clone)]
pub struct LineSearch {
    kind: LineSearchKind,
    init: LineSearchInit,
    c1: Scalar,
    c2: Scalar,
    max_iterations: usize,
    prev: Option<Trial>,
    x: Vector,
    g: Vector,
}

impl LineSearch {
    /// Creates a line search, using `init` and `c2` where `config` does not set them.
    ///
    /// **Errors**
    /// Requires `0 < c1 < c2 < 1` and at least one trial step.
    pub fn new(config: &LineSearchConfig, init: LineSearchInit, c2: Scalar) -> Result<Self> {
        let c1 = config.c1;
        let c2 = config.c2.unwrap_or(c2);
        if !(0. < c1 && c1 < 0.5) {
            return Err(ConfigError::invalid("c1", c1, "expected 0 < c1 < 0.5").into());
        }
        if !(c1 < c2 && c2 < 1.) {
            return Err(ConfigError::invalid("c2", c2, "expected c1 < c2 < 1").into());
        }
        if config.max_iterations == 0 {
            return Err(ConfigError::invalid("max_iterations", 0, "must be positive").into());
        }
        Ok(Self {
            kind: config.kind,
            init: config.init.unwrap_or(init),
            c1,
            c2,
            max_iterations: config.max_iterations,
            prev: None,
            x: Vector::zeros(0),
            g: Vector::zeros(0),
        })
    }
    /// Forgets the previous iteration, so the next search starts like the first.
    pub fn reset(&mut self) {
        self.prev = None;
    }
    /// Searches along `state.d` from `state.x`.
    ///
    /// On success moves `state` to the accepted point and returns `true`. Otherwise `state` is
    /// unchanged apart from its call counters. The accepted step always satisfies the
    /// sufficient decrease condition.
    pub fn search(&mut self, function: &mut dyn Function, state: &mut OptState) -> Result<bool> {
        let f0 = state.f;
        let dg0 = state.g.dot(&state.d);
        if !(dg0 < 0.) {
            return Ok(false);
        }
        let t0 = self.initial_step(state, f0, dg0);
        let start = Trial {
            t: 0.,
            f: f0,
            dg: dg0,
        };
        let accepted = match self.kind {
            LineSearchKind::Interpolation => self.interpolate(function, state, start, t0)?,
            _ => self.backtrack(function, state, start, t0)?,
        };
        let Some(trial) = accepted else {
            return Ok(false);
        };
        std::mem::swap(&mut state.x, &mut self.x);
        std::mem::swap(&mut state.g, &mut self.g);
        state.f = trial.f;
        state.t = trial.t;
        self.prev = Some(Trial { t: trial.t, ..start });
        Ok(true)
    }
    fn initial_step(&self, state: &OptState, f0: Scalar, dg0: Scalar) -> Scalar {
        let t = match (self.prev, self.init) {
            (None, _) => 1. / inf_norm(&state.g).max(1.),
            (Some(_), LineSearchInit::Unit) => 1.,
            (Some(prev), LineSearchInit::Quadratic) => (1.01 * 2. * (f0 - prev.f) / dg0).min(1.),
            (Some(prev), LineSearchInit::Consistent) => prev.t * prev.dg / dg0,
        };
        if t.is_finite() && t > 0. {
            t
        } else {
            1.
        }
    }
    fn evaluate(
        &mut self,
        function: &mut dyn Function,
        state: &mut OptState,
        t: Scalar,
    ) -> Result<Trial> {
        self.x = &state.x + &(&state.d * t);
        if self.g.len() != self.x.len() {
            self.g = Vector::zeros(self.x.len());
        }
        let f = function.vgrad(&self.x, &mut self.g)?;
        state.fcalls += 1;
        state.gcalls += 1;
        Ok(Trial {
            t,
            f,
            dg: self.g.dot(&state.d),
        })
    }
    fn armijo(&self, start: Trial, trial: Trial) -> bool {
        trial.is_finite() && trial.f <= start.f + self.c1 * trial.t * start.dg
    }
    fn wolfe(&self, start: Trial, trial: Trial) -> bool {
        trial.dg >= self.c2 * start.dg
    }
    fn strong_wolfe(&self, start: Trial, trial: Trial) -> bool {
        trial.dg.abs() <= -self.c2 * start.dg
    }
    fn backtrack(
        &mut self,
        function: &mut dyn Function,
        state: &mut OptState,
        start: Trial,
        t0: Scalar,
    ) -> Result<Option<Trial>> {
        let (mut lo, mut hi) = (0., Scalar::INFINITY);
        let mut t = t0;
        for _ in 0..self.max_iterations {
            let trial = self.evaluate(function, state, t)?;
            let too_long = if !self.armijo(start, trial) {
                true
            } else {
                match self.kind {
                    LineSearchKind::BacktrackArmijo => return Ok(Some(trial)),
                    LineSearchKind::BacktrackWolfe if self.wolfe(start, trial) => {
                        return Ok(Some(trial))
                    }
                    LineSearchKind::BacktrackWolfe => false,
                    _ if self.strong_wolfe(start, trial) => return Ok(Some(trial)),
                    _ => trial.dg > 0.,
                }
            };
            if too_long {
                hi = t;
            } else {
                lo = t;
            }
            t = if hi.is_finite() { 0.5 * (lo + hi) } else { 2. * t };
        }
        Ok(None)
    }
    fn interpolate(
        &mut self,
        function: &mut dyn Function,
        state: &mut OptState,
        start: Trial,
        t0: Scalar,
    ) -> Result<Option<Trial>> {
        let mut prev = start;
        let mut t = t0;
        for i in 0..self.max_iterations {
            let trial = self.evaluate(function, state, t)?;
            if !trial.is_finite() {
                t = 0.5 * (prev.t + t);
                continue;
            }
            if !self.armijo(start, trial) || (i > 0 && trial.f >= prev.f) {
                return self.zoom(function, state, start, prev, trial);
            }
            if self.strong_wolfe(start, trial) {
                return Ok(Some(trial));
            }
            if trial.dg >= 0. {
                return self.zoom(function, state, start, trial, prev);
            }
            prev = trial;
            t *= 3.;
        }
        Ok(None)
    }
    /// Shrinks `[lo, hi]`, where `lo` satisfies sufficient decrease with the lowest value seen
    /// and the minimizer lies between `lo` and `hi`.
    fn zoom(
        &mut self,
        function: &mut dyn Function,
        state: &mut OptState,
        start: Trial,
        mut lo: Trial,
        mut hi: Trial,
    ) -> Result<Option<Trial>> {
        for _ in 0..self.max_iterations {
            if (hi.t - lo.t).abs() <= Scalar::EPSILON * lo.t.abs().max(hi.t.abs()) {
                break;
            }
            let trial = self.evaluate(function, state, cubic_min(lo, hi))?;
            if !self.armijo(start, trial) || trial.f >= lo.f {
                hi = trial;
            } else {
                if self.strong_wolfe(start, trial) {
                    return Ok(Some(trial));
                }
                if trial.dg * (hi.t - lo.t) >= 0. {
                    hi = lo;
                }
                lo = trial;
            }
        }
        Ok(None)
    }
}

/// The minimizer of the cubic interpolating `a` and `b`, kept inside the interior of the
/// interval. Falls back to bisection.
fn cubic_min(a: Trial, b: Trial) -> Scalar {
    let mid = 0.5 * (a.t + b.t);
    if !b.is_finite() {
        return mid;
    }
    let d1 = a.dg + b.dg - 3. * (a.f - b.f) / (a.t - b.t);
    let disc = d1 * d1 - a.dg * b.dg;
    if !(disc >= 0.) {
        return mid;
    }
    let d2 = (b.t - a.t).signum() * disc.sqrt();
    let t = b.t - (b.t - a.t) * (b.dg + d2 - d1) / (b.dg - a.dg + 2. * d2);
    let (min, max) = (a.t.min(b.t), a.t.max(b.t));
    let margin = 0.1 * (max - min);
    if t.is_finite() && t >= min + margin && t <= max - margin {
        t
    } else {
        mid
    }
}
