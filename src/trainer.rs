use crate::{
    accumulator::{Accumulator, Evaluation},
    criterion::Criterion,
    error::ConfigError,
    function::NetworkFunction,
    loss::Loss,
    network::Network,
    optim::{
        inf_norm, BatchConfig, BatchOptimizer, LearningRate, OptState, OptStatus, StochConfig,
    },
    task::{Fold, Task},
    Scalar,
};
use anyhow::{bail, ensure, Result};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Instant};

mod result;
pub use result::{TrainerResult, TrainerState, TrainerStatus};

#[cfg(test)]
mod tests;

/// The optimizer of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptimizerConfig {
    /// One batch iteration over all training samples per epoch.
    Batch(BatchConfig),
    /// One pass over shuffled minibatches per epoch.
    Stochastic(StochConfig),
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::Batch(BatchConfig::default())
    }
}

impl From<BatchConfig> for OptimizerConfig {
    fn from(config: BatchConfig) -> Self {
        Self::Batch(config)
    }
}

impl From<StochConfig> for OptimizerConfig {
    fn from(config: StochConfig) -> Self {
        Self::Stochastic(config)
    }
}

/// Training settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// The maximum number of epochs.
    pub epochs: usize,
    /// The number of epochs without improvement tolerated before stopping.
    pub patience: usize,
    /// The number of accumulator threads, 0 for the rayon default.
    pub threads: usize,
    /// Seeds the minibatch shuffles.
    pub seed: u64,
    /// The optimizer.
    pub optimizer: OptimizerConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            patience: 10,
            threads: 0,
            seed: 0,
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl TrainerConfig {
    /// Sets the maximum number of epochs.
    pub fn with_epochs(self, epochs: usize) -> Self {
        Self { epochs, ..self }
    }
    /// Sets the patience.
    pub fn with_patience(self, patience: usize) -> Self {
        Self { patience, ..self }
    }
    /// Sets the number of threads.
    pub fn with_threads(self, threads: usize) -> Self {
        Self { threads, ..self }
    }
    /// Sets the shuffle seed.
    pub fn with_seed(self, seed: u64) -> Self {
        Self { seed, ..self }
    }
    /// Sets the optimizer.
    pub fn with_optimizer(self, optimizer: impl Into<OptimizerConfig>) -> Self {
        Self {
            optimizer: optimizer.into(),
            ..self
        }
    }
}

/// Trains a network on one split of a task, with early stopping on the validation value.
#[derive(Debug, Clone, Default)]
pub struct Trainer {
    config: TrainerConfig,
}

struct Run<'a> {
    task: &'a dyn Task,
    index: usize,
    train: Vec<usize>,
    valid: Vec<usize>,
    test: Vec<usize>,
    start: Instant,
}

impl Run<'_> {
    fn evaluate(
        &self,
        accumulator: &Accumulator,
        epoch: usize,
        grad_norm: Scalar,
    ) -> Result<TrainerState> {
        let train = accumulator.value(self.task, Fold::train(self.index), &self.train)?;
        let valid = if self.valid.is_empty() {
            train
        } else {
            accumulator.value(self.task, Fold::valid(self.index), &self.valid)?
        };
        let test = if self.test.is_empty() {
            Evaluation::default()
        } else {
            accumulator.value(self.task, Fold::test(self.index), &self.test)?
        };
        let params = accumulator.params();
        Ok(TrainerState {
            epoch,
            elapsed: self.start.elapsed(),
            train,
            valid,
            test,
            param_norm: params.dot(params).sqrt(),
            grad_norm,
        })
    }
}

impl Trainer {
    /// Creates a trainer.
    pub fn new(config: TrainerConfig) -> Self {
        Self { config }
    }
    /// The settings.
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }
    /// Trains `network` on split `index` of `task`, starting from its current parameters.
    ///
    /// Epoch 0 measures the initial parameters. Training stops on the first terminal
    /// [`TrainerStatus`] or after the configured number of epochs. The parameters with the
    /// lowest validation value are loaded into `network` before returning.
    ///
    /// **Errors**
    /// - The network and the task must have the same input and output dimensions.
    /// - `index` must be less than the fold count and the split must have training samples.
    /// - The optimizer settings must be valid.
    pub fn train(
        &self,
        network: &mut Network,
        task: &dyn Task,
        index: usize,
        loss: Arc<dyn Loss>,
        criterion: Arc<dyn Criterion>,
    ) -> Result<TrainerResult> {
        if network.input_dims() != task.input_dims() {
            return Err(ConfigError::ShapeMismatch {
                expected: task.input_dims(),
                found: network.input_dims(),
            }
            .into());
        }
        if network.output_dims() != task.output_dims() {
            return Err(ConfigError::ShapeMismatch {
                expected: task.output_dims(),
                found: network.output_dims(),
            }
            .into());
        }
        ensure!(
            index < task.fold_count(),
            "fold {index} out of range for a task with {} folds",
            task.fold_count()
        );
        let run = Run {
            task,
            index,
            train: (0..task.size(Fold::train(index))).collect(),
            valid: (0..task.size(Fold::valid(index))).collect(),
            test: (0..task.size(Fold::test(index))).collect(),
            start: Instant::now(),
        };
        if run.train.is_empty() {
            bail!("no training samples in {}", Fold::train(index));
        }
        log::info!(
            "training {} params on {} train / {} valid / {} test samples with {}, {}",
            network.param_count(),
            run.train.len(),
            run.valid.len(),
            run.test.len(),
            loss.kind(),
            criterion.describe(),
        );
        let mut accumulator = Accumulator::new(network, loss, criterion, self.config.threads)?;
        let mut result = TrainerResult::new(self.config.clone());
        match &self.config.optimizer {
            OptimizerConfig::Batch(config) => {
                self.train_batch(&mut accumulator, &run, config, &mut result)?;
            }
            OptimizerConfig::Stochastic(config) => {
                let config = self.tune(&mut accumulator, &run, config, &mut result)?;
                self.train_stochastic(
                    &mut accumulator,
                    &run,
                    &config,
                    self.config.epochs,
                    &mut result,
                )?;
            }
        }
        if let Some(optimum) = result.optimum() {
            log::info!(
                "{}: optimum at epoch {}, valid value {:.6e}, error {:.6}",
                result.status(),
                optimum.epoch,
                optimum.valid.value,
                optimum.valid.error
            );
            network.load_params(result.optimum_params().as_slice().unwrap_or(&[]))?;
        } else {
            log::warn!("{}: no finite epoch, keeping the initial parameters", result.status());
        }
        Ok(result)
    }
    fn log_epoch(state: &TrainerState, status: TrainerStatus) {
        log::info!(
            "epoch {}: train {:.6e} ({:.4}), valid {:.6e} ({:.4}), {}",
            state.epoch,
            state.train.value,
            state.train.error,
            state.valid.value,
            state.valid.error,
            status
        );
    }
    fn train_batch(
        &self,
        accumulator: &mut Accumulator,
        run: &Run,
        config: &BatchConfig,
        result: &mut TrainerResult,
    ) -> Result<()> {
        let mut optimizer = BatchOptimizer::new(config.clone())?;
        let x0 = accumulator.params().clone();
        let mut state: OptState = {
            let mut function =
                NetworkFunction::with_fold(accumulator, run.task, Fold::train(run.index))?;
            optimizer.init(&mut function, x0)?
        };
        for epoch in 0..=self.config.epochs {
            if epoch > 0 {
                let mut function =
                    NetworkFunction::with_fold(accumulator, run.task, Fold::train(run.index))?;
                optimizer.step(&mut function, &mut state)?;
            }
            accumulator.set_params(state.x.as_slice().unwrap_or(&[]))?;
            let snapshot = run.evaluate(accumulator, epoch, inf_norm(&state.g))?;
            let status = result.update(snapshot, &state.x, state.status);
            Self::log_epoch(&snapshot, status);
            if status.is_terminal() {
                break;
            }
        }
        Ok(())
    }
    /// Runs `epochs` epochs of `config` from the parameters of `accumulator`.
    fn train_stochastic(
        &self,
        accumulator: &mut Accumulator,
        run: &Run,
        config: &StochConfig,
        epochs: usize,
        result: &mut TrainerResult,
    ) -> Result<()> {
        let mut optimizer = config.build()?;
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut x = accumulator.params().clone();
        optimizer.reset(&x);
        let mut indices = run.train.clone();
        let mut updates = 0;
        let mut grad_norm = Scalar::NAN;
        for epoch in 0..=epochs {
            let mut opt_status = OptStatus::Running;
            if epoch > 0 {
                indices.shuffle(&mut rng);
                for batch in indices.chunks(config.batch_size) {
                    let y = optimizer.query(&x).clone();
                    accumulator.set_params(y.as_slice().unwrap_or(&[]))?;
                    let (evaluation, g) =
                        accumulator.vgrad(run.task, Fold::train(run.index), batch)?;
                    grad_norm = inf_norm(&g);
                    if !(evaluation.value.is_finite() && grad_norm.is_finite()) {
                        log::warn!("{}: diverged at epoch {epoch}", config.kind);
                        opt_status = OptStatus::Diverged;
                        break;
                    }
                    optimizer.update(config.rate.at(updates), &mut x, evaluation.value, &g);
                    updates += 1;
                }
                log::debug!(
                    "{}: epoch {epoch}, {updates} updates, rate {:.3e}",
                    config.kind,
                    config.rate.at(updates)
                );
            } else {
                let (_, g) = accumulator.vgrad(run.task, Fold::train(run.index), &run.train)?;
                grad_norm = inf_norm(&g);
            }
            accumulator.set_params(x.as_slice().unwrap_or(&[]))?;
            let snapshot = run.evaluate(accumulator, epoch, grad_norm)?;
            let status = result.update(snapshot, &x, opt_status);
            Self::log_epoch(&snapshot, status);
            if status.is_terminal() {
                break;
            }
        }
        Ok(())
    }
    /// Trains each candidate rate of `config` for a few epochs from the same parameters and
    /// returns `config` with the rate of the best validation value.
    fn tune(
        &self,
        accumulator: &mut Accumulator,
        run: &Run,
        config: &StochConfig,
        result: &mut TrainerResult,
    ) -> Result<StochConfig> {
        if config.tune_rates.is_empty() {
            return Ok(config.clone());
        }
        let x0 = accumulator.params().clone();
        let mut best: Option<(Scalar, Scalar)> = None;
        for &rate in config.tune_rates.iter() {
            let candidate = StochConfig {
                rate: LearningRate {
                    initial: rate,
                    ..config.rate
                },
                ..config.clone()
            };
            let mut trial = TrainerResult::new(self.config.clone());
            accumulator.set_params(x0.as_slice().unwrap_or(&[]))?;
            self.train_stochastic(accumulator, run, &candidate, config.tune_epochs, &mut trial)?;
            let value = trial
                .optimum()
                .map_or(Scalar::INFINITY, |optimum| optimum.valid.value);
            log::info!("{}: rate {rate:.3e}, valid value {value:.6e}", config.kind);
            if value.is_finite() && best.map_or(true, |(_, best)| value < best) {
                best.replace((rate, value));
            }
        }
        accumulator.set_params(x0.as_slice().unwrap_or(&[]))?;
        let Some((rate, _)) = best else {
            log::warn!(
                "{}: every candidate rate diverged, using {:.3e}",
                config.kind,
                config.rate.initial
            );
            return Ok(config.clone());
        };
        result.set_tuned_rate(rate);
        Ok(StochConfig {
            rate: LearningRate {
                initial: rate,
                ..config.rate
            },
            ..config.clone()
        })
    }
}
