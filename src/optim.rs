use crate::{Scalar, Vector};
use derive_more::Display;
use serde::{Deserialize, Serialize};

mod batch;
pub use batch::{minimize, BatchConfig, BatchKind, BatchOptimizer, CgdBeta};

mod line_search;
pub use line_search::{LineSearch, LineSearchConfig, LineSearchInit, LineSearchKind};

mod stochastic;
pub use stochastic::{
    Adadelta, Adagrad, Adam, Ag, AgRestart, LearningRate, Ngd, RmsProp, Sg, Sgm, StochConfig,
    StochKind, Stochastic,
};

#[cfg(test)]
mod tests;

/// The outcome of an optimizer iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum OptStatus {
    /// Still improving.
    #[display(fmt = "running")]
    Running,
    /// The convergence criterion is met.
    #[display(fmt = "converged")]
    Converged,
    /// The value or the gradient is not finite.
    #[display(fmt = "diverged")]
    Diverged,
    /// The line search could not find an acceptable step.
    #[display(fmt = "failed")]
    Failed,
}

/// The state of a batch optimizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptState {
    /// The current point.
    pub x: Vector,
    /// The gradient at `x`.
    pub g: Vector,
    /// The last descent direction.
    pub d: Vector,
    /// The value at `x`.
    pub f: Scalar,
    /// The last accepted step length.
    pub t: Scalar,
    /// The number of completed iterations.
    pub iterations: usize,
    /// The number of function evaluations.
    pub fcalls: usize,
    /// The number of gradient evaluations.
    pub gcalls: usize,
    /// The status after the last iteration.
    pub status: OptStatus,
}

impl OptState {
    pub(crate) fn new(x: Vector) -> Self {
        let size = x.len();
        Self {
            x,
            g: Vector::zeros(size),
            d: Vector::zeros(size),
            f: Scalar::INFINITY,
            t: 0.,
            iterations: 0,
            fcalls: 0,
            gcalls: 0,
            status: OptStatus::Running,
        }
    }
    /// `max(|g|) / max(1, |f|)`, compared against epsilon to detect convergence.
    pub fn convergence_criterion(&self) -> Scalar {
        inf_norm(&self.g) / self.f.abs().max(1.)
    }
    /// Whether the value and the gradient are finite.
    pub fn is_finite(&self) -> bool {
        self.f.is_finite() && self.g.iter().all(|x| x.is_finite())
    }
}

/// `max(|x_i|)`
pub(crate) fn inf_norm(x: &Vector) -> Scalar {
    x.iter().fold(0., |m, x| m.max(x.abs()))
}
