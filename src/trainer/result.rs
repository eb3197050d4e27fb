use super::TrainerConfig;
use crate::{accumulator::Evaluation, optim::OptStatus, Scalar, Vector};
use anyhow::{Context, Result};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
    time::Duration,
};

/// The measurements taken after an epoch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// The epoch, 0 for the initial parameters.
    pub epoch: usize,
    /// The time spent training so far.
    pub elapsed: Duration,
    /// The training samples.
    pub train: Evaluation,
    /// The validation samples, or a copy of `train` if the task has none.
    pub valid: Evaluation,
    /// The test samples, with a count of 0 if the task has none.
    pub test: Evaluation,
    /// `|x|_2` of the parameters.
    pub param_norm: Scalar,
    /// `|g|_inf` of the last gradient.
    pub grad_norm: Scalar,
}

impl TrainerState {
    /// Whether the values and norms are finite.
    pub fn is_finite(&self) -> bool {
        self.train.value.is_finite()
            && self.valid.value.is_finite()
            && self.param_norm.is_finite()
            && self.grad_norm.is_finite()
    }
}

/// The outcome of an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum TrainerStatus {
    /// The validation value improved.
    #[display(fmt = "better")]
    Better,
    /// No improvement, within the patience.
    #[display(fmt = "worse")]
    Worse,
    /// No improvement for more than the patience.
    #[display(fmt = "overfit")]
    Overfit,
    /// The values became non-finite.
    #[display(fmt = "diverge")]
    Diverge,
    /// The optimizer converged.
    #[display(fmt = "solved")]
    Solved,
    /// The optimizer could not make progress.
    #[display(fmt = "failed")]
    Failed,
}

impl TrainerStatus {
    /// Whether training stops.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Better | Self::Worse)
    }
}

/// The history of a training run and its best parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerResult {
    config: TrainerConfig,
    history: Vec<TrainerState>,
    optimum: Option<TrainerState>,
    optimum_params: Vector,
    since_better: usize,
    status: TrainerStatus,
    tuned_rate: Option<Scalar>,
}

impl TrainerResult {
    pub(super) fn new(config: TrainerConfig) -> Self {
        Self {
            config,
            history: Vec::new(),
            optimum: None,
            optimum_params: Vector::zeros(0),
            since_better: 0,
            status: TrainerStatus::Worse,
            tuned_rate: None,
        }
    }
    pub(super) fn set_tuned_rate(&mut self, rate: Scalar) {
        self.tuned_rate.replace(rate);
    }
    /// Records `state`, reached with `params`, and returns the status.
    ///
    /// The optimum is the state with the lowest validation value. `opt_status` is the status
    /// reported by the optimizer for the epoch.
    pub fn update(
        &mut self,
        state: TrainerState,
        params: &Vector,
        opt_status: OptStatus,
    ) -> TrainerStatus {
        self.history.push(state);
        let status = match opt_status {
            OptStatus::Failed => TrainerStatus::Failed,
            OptStatus::Diverged => TrainerStatus::Diverge,
            _ if !state.is_finite() => TrainerStatus::Diverge,
            _ => {
                let better = self
                    .optimum
                    .map_or(true, |optimum| state.valid.value < optimum.valid.value);
                if better {
                    self.optimum.replace(state);
                    self.optimum_params = params.clone();
                    self.since_better = 0;
                } else {
                    self.since_better += 1;
                }
                if opt_status == OptStatus::Converged {
                    TrainerStatus::Solved
                } else if better {
                    TrainerStatus::Better
                } else if self.since_better > self.config.patience {
                    TrainerStatus::Overfit
                } else {
                    TrainerStatus::Worse
                }
            }
        };
        self.status = status;
        status
    }
    /// The settings of the run.
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }
    /// The states of every epoch, starting with epoch 0.
    pub fn history(&self) -> &[TrainerState] {
        &self.history
    }
    /// The state with the lowest validation value.
    pub fn optimum(&self) -> Option<&TrainerState> {
        self.optimum.as_ref()
    }
    /// The parameters of [`.optimum()`](Self::optimum()).
    pub fn optimum_params(&self) -> &Vector {
        &self.optimum_params
    }
    /// The status of the last epoch.
    pub fn status(&self) -> TrainerStatus {
        self.status
    }
    /// The learning rate picked by tuning, if any.
    pub fn tuned_rate(&self) -> Option<Scalar> {
        self.tuned_rate
    }
    /// Writes the history as a table, one row per epoch.
    pub fn write_table<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writeln!(
            writer,
            "{:>6} {:>10} {:>13} {:>10} {:>13} {:>10} {:>13} {:>10} {:>11} {:>11}",
            "epoch",
            "seconds",
            "train_value",
            "train_err",
            "valid_value",
            "valid_err",
            "test_value",
            "test_err",
            "param_norm",
            "grad_norm",
        )?;
        for state in self.history.iter() {
            let (test_value, test_error) = if state.test.count > 0 {
                (
                    format!("{:.6e}", state.test.value),
                    format!("{:.6}", state.test.error),
                )
            } else {
                ("-".to_string(), "-".to_string())
            };
            writeln!(
                writer,
                "{:>6} {:>10.3} {:>13.6e} {:>10.6} {:>13.6e} {:>10.6} {:>13} {:>10} {:>11.4e} {:>11.4e}",
                state.epoch,
                state.elapsed.as_secs_f64(),
                state.train.value,
                state.train.error,
                state.valid.value,
                state.valid.error,
                test_value,
                test_error,
                state.param_norm,
                state.grad_norm,
            )?;
        }
        Ok(())
    }
    /// Writes the table to a file at `path`.
    pub fn save_table(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| format!("creating {path:?}"))?;
        let mut writer = BufWriter::new(file);
        self.write_table(&mut writer)?;
        writer.flush()?;
        Ok(())
    }
}
