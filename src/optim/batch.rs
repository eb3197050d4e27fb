use super::{
    line_search::{LineSearch, LineSearchConfig, LineSearchInit},
    OptState, OptStatus,
};
use crate::{error::ConfigError, function::Function, Scalar, Vector};
use anyhow::{ensure, Error, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    fmt::{self, Display},
    str::FromStr,
};

/// The conjugate gradient update `beta`.
///
/// With `g` the current gradient, `g0` the previous gradient, `d0` the previous direction and
/// `y = g - g0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CgdBeta {
    /// Fletcher-Reeves, `g.g / g0.g0`.
    FR,
    /// Polak-Ribiere+, `max(0, g.y / g0.g0)`.
    PRP,
    /// Hestenes-Stiefel, `g.y / d0.y`.
    HS,
    /// Dai-Yuan, `g.g / d0.y`.
    DY,
    /// Conjugate descent, `-g.g / d0.g0`.
    CD,
    /// Liu-Storey, `-g.y / d0.g0`.
    LS,
    /// Hager-Zhang, `(y - 2 * d0 * y.y / d0.y).g / d0.y`.
    N,
    /// `max(0, min(DY, CD))`
    DYCD,
    /// `max(0, min(DY, HS))`
    DYHS,
}

impl CgdBeta {
    /// All updates.
    pub const ALL: [Self; 9] = [
        Self::FR,
        Self::PRP,
        Self::HS,
        Self::DY,
        Self::CD,
        Self::LS,
        Self::N,
        Self::DYCD,
        Self::DYHS,
    ];
    fn name(&self) -> &'static str {
        match self {
            Self::FR => "fr",
            Self::PRP => "prp",
            Self::HS => "hs",
            Self::DY => "dy",
            Self::CD => "cd",
            Self::LS => "ls",
            Self::N => "n",
            Self::DYCD => "dycd",
            Self::DYHS => "dyhs",
        }
    }
    fn beta(&self, g: &Vector, g0: &Vector, d0: &Vector) -> Scalar {
        let y = g - g0;
        let gg = g.dot(g);
        let g0g0 = g0.dot(g0);
        let gy = g.dot(&y);
        let d0y = d0.dot(&y);
        let d0g0 = d0.dot(g0);
        let dy = gg / d0y;
        let cd = -gg / d0g0;
        let hs = gy / d0y;
        match self {
            Self::FR => gg / g0g0,
            Self::PRP => (gy / g0g0).max(0.),
            Self::HS => hs,
            Self::DY => dy,
            Self::CD => cd,
            Self::LS => -gy / d0g0,
            Self::N => (gy - 2. * d0.dot(g) * y.dot(&y) / d0y) / d0y,
            Self::DYCD => dy.min(cd).max(0.),
            Self::DYHS => dy.min(hs).max(0.),
        }
    }
}

/// A batch optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum BatchKind {
    /// Gradient descent, `d = -g`.
    Gd,
    /// Nonlinear conjugate gradient, `d = -g + beta * d0`.
    Cgd(CgdBeta),
    /// Limited memory BFGS.
    Lbfgs,
}

impl BatchKind {
    /// All kinds.
    pub fn all() -> impl Iterator<Item = Self> {
        [Self::Gd, Self::Lbfgs]
            .into_iter()
            .chain(CgdBeta::ALL.into_iter().map(Self::Cgd))
    }
}

impl Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Gd => write!(f, "gd"),
            Self::Cgd(beta) => write!(f, "cgd-{}", beta.name()),
            Self::Lbfgs => write!(f, "lbfgs"),
        }
    }
}

impl FromStr for BatchKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::all().find(|x| x.to_string() == s).ok_or_else(|| {
            ConfigError::UnknownKind {
                what: "batch optimizer",
                name: s.to_string(),
                known: Self::all().map(|x| x.to_string()).collect(),
            }
            .into()
        })
    }
}

impl From<BatchKind> for String {
    fn from(kind: BatchKind) -> Self {
        kind.to_string()
    }
}

impl TryFrom<String> for BatchKind {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Batch optimizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// The optimizer.
    pub kind: BatchKind,
    /// Converged if `|g|_inf < epsilon * max(1, |f|)`.
    pub epsilon: Scalar,
    /// Converged if `f_prev - f < f_tolerance * max(1, |f|)`. 0 disables the test.
    pub f_tolerance: Scalar,
    /// The maximum number of iterations of [`minimize()`].
    pub max_iterations: usize,
    /// The number of L-BFGS correction pairs.
    pub history: usize,
    /// The line search.
    pub line_search: LineSearchConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            kind: BatchKind::Lbfgs,
            epsilon: 1e-6,
            f_tolerance: 0.,
            max_iterations: 1000,
            history: 6,
            line_search: LineSearchConfig::default(),
        }
    }
}

impl BatchConfig {
    /// The default settings of `kind`.
    pub fn new(kind: BatchKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }
    /// Sets the convergence threshold of the gradient.
    pub fn with_epsilon(self, epsilon: Scalar) -> Self {
        Self { epsilon, ..self }
    }
    /// Sets the convergence threshold of the relative improvement.
    pub fn with_f_tolerance(self, f_tolerance: Scalar) -> Self {
        Self {
            f_tolerance,
            ..self
        }
    }
    /// Sets the maximum number of iterations.
    pub fn with_max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }
    /// Sets the number of L-BFGS correction pairs.
    pub fn with_history(self, history: usize) -> Self {
        Self { history, ..self }
    }
    /// Sets the line search.
    pub fn with_line_search(self, line_search: LineSearchConfig) -> Self {
        Self {
            line_search,
            ..self
        }
    }
}

/// Runs one of the [`BatchKind`] optimizers an iteration at a time.
#[derive(Debug, Clone)]
pub struct BatchOptimizer {
    config: BatchConfig,
    line_search: LineSearch,
    /// `(x - x0, g - g0)` pairs, oldest first.
    history: VecDeque<(Vector, Vector)>,
    /// The gradient before the last step, for conjugate gradient.
    g0: Option<Vector>,
}

impl BatchOptimizer {
    /// Creates a new optimizer.
    ///
    /// **Errors**
    /// The settings must be valid.
    pub fn new(config: BatchConfig) -> Result<Self> {
        if !(config.epsilon >= 0.) {
            return Err(ConfigError::invalid("epsilon", config.epsilon, "must be >= 0").into());
        }
        if !(config.f_tolerance >= 0.) {
            return Err(
                ConfigError::invalid("f_tolerance", config.f_tolerance, "must be >= 0").into(),
            );
        }
        if config.kind == BatchKind::Lbfgs && config.history == 0 {
            return Err(ConfigError::invalid("history", 0, "must be positive").into());
        }
        let (init, c2) = match config.kind {
            BatchKind::Gd => (LineSearchInit::Quadratic, 0.9),
            BatchKind::Cgd(_) => (LineSearchInit::Quadratic, 0.1),
            BatchKind::Lbfgs => (LineSearchInit::Unit, 0.9),
        };
        let line_search = LineSearch::new(&config.line_search, init, c2)?;
        Ok(Self {
            config,
            line_search,
            history: VecDeque::new(),
            g0: None,
        })
    }
    /// The settings.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }
    /// Evaluates `function` at `x0` and returns the starting state.
    ///
    /// The status is [`OptStatus::Converged`] if `x0` is already optimal, or
    /// [`OptStatus::Diverged`] if the value or the gradient is not finite.
    pub fn init(&mut self, function: &mut dyn Function, x0: Vector) -> Result<OptState> {
        ensure!(
            x0.len() == function.size(),
            "expected {} parameters, found {}",
            function.size(),
            x0.len()
        );
        self.history.clear();
        self.g0 = None;
        self.line_search.reset();
        let mut state = OptState::new(x0);
        state.f = function.vgrad(&state.x, &mut state.g)?;
        state.fcalls += 1;
        state.gcalls += 1;
        state.status = if !state.is_finite() {
            OptStatus::Diverged
        } else if state.convergence_criterion() < self.config.epsilon {
            OptStatus::Converged
        } else {
            OptStatus::Running
        };
        Ok(state)
    }
    /// Performs one iteration from `state`, updating its status.
    pub fn step(&mut self, function: &mut dyn Function, state: &mut OptState) -> Result<()> {
        if state.status != OptStatus::Running {
            return Ok(());
        }
        state.d = self.direction(state);
        let (x0, g0, f0) = (state.x.clone(), state.g.clone(), state.f);
        if !self.line_search.search(function, state)? {
            log::warn!(
                "{}: line search failed at iteration {}, f = {}",
                self.config.kind,
                state.iterations,
                state.f
            );
            state.status = OptStatus::Failed;
            return Ok(());
        }
        state.iterations += 1;
        if !state.is_finite() {
            log::warn!("{}: diverged at iteration {}", self.config.kind, state.iterations);
            state.status = OptStatus::Diverged;
            return Ok(());
        }
        if self.config.kind == BatchKind::Lbfgs {
            let s = &state.x - &x0;
            let y = &state.g - &g0;
            if s.dot(&y) > Scalar::EPSILON * y.dot(&y) {
                if self.history.len() == self.config.history {
                    self.history.pop_front();
                }
                self.history.push_back((s, y));
            }
        }
        self.g0.replace(g0);
        let scale = state.f.abs().max(1.);
        if state.convergence_criterion() < self.config.epsilon
            || f0 - state.f < self.config.f_tolerance * scale
        {
            state.status = OptStatus::Converged;
        }
        log::debug!(
            "{}: iteration {}, f = {:.6e}, |g| = {:.3e}, t = {:.3e}",
            self.config.kind,
            state.iterations,
            state.f,
            state.convergence_criterion(),
            state.t
        );
        Ok(())
    }
    fn direction(&self, state: &OptState) -> Vector {
        let g = &state.g;
        let d = match self.config.kind {
            BatchKind::Gd => -g,
            BatchKind::Cgd(beta) => match self.g0.as_ref() {
                Some(g0) if g.dot(g0).abs() < 0.1 * g.dot(g) => {
                    let beta = beta.beta(g, g0, &state.d);
                    if beta.is_finite() {
                        &state.d * beta - g
                    } else {
                        -g
                    }
                }
                _ => -g,
            },
            BatchKind::Lbfgs => self.two_loop(g),
        };
        if d.dot(g) < 0. {
            d
        } else {
            -g
        }
    }
    /// `-H * g`, with `H` the inverse Hessian estimate of the history.
    fn two_loop(&self, g: &Vector) -> Vector {
        let mut q = g.clone();
        let mut alphas = Vec::with_capacity(self.history.len());
        for (s, y) in self.history.iter().rev() {
            let alpha = s.dot(&q) / s.dot(y);
            q.scaled_add(-alpha, y);
            alphas.push(alpha);
        }
        if let Some((s, y)) = self.history.back() {
            q *= s.dot(y) / y.dot(y);
        }
        for ((s, y), alpha) in self.history.iter().zip(alphas.into_iter().rev()) {
            let beta = y.dot(&q) / s.dot(y);
            q.scaled_add(alpha - beta, s);
        }
        -q
    }
}

/// Minimizes `function` from `x0`.
///
/// Calls `callback` after every iteration, including the one that ends the run. Returning
/// `false` stops early with the status [`OptStatus::Running`].
pub fn minimize(
    config: &BatchConfig,
    function: &mut dyn Function,
    x0: Vector,
    mut callback: impl FnMut(&OptState) -> bool,
) -> Result<OptState> {
    let mut optimizer = BatchOptimizer::new(config.clone())?;
    let mut state = optimizer.init(function, x0)?;
    for _ in 0..config.max_iterations {
        if state.status != OptStatus::Running {
            break;
        }
        optimizer.step(function, &mut state)?;
        if !callback(&state) {
            break;
        }
    }
    Ok(state)
}
