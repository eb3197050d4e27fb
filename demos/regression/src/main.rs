use anyhow::{bail, Result};
use clap::Parser;
use nanotrain::{
    criterion::{self, Criterion},
    layer,
    loss::{self, Loss},
    network::Network,
    optim::{BatchConfig, BatchKind, LearningRate, StochConfig, StochKind},
    task::{Fold, MemoryTask, Task},
    tensor::{Dims, Tensor},
    trainer::{OptimizerConfig, Trainer, TrainerConfig},
    Scalar,
};
use rand::{rngs::StdRng, SeedableRng};
use std::{io, path::PathBuf, sync::Arc};

/// Trains a network on a synthetic regression task.
///
/// Each target is `tanh(<w_k, x>)` for a random image `x` and fixed random weights `w_k`.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Options {
    /// The layers, separated by ';'.
    #[arg(
        long,
        default_value = "conv:dims=4,rows=3,cols=3;act-snorm;pool-soft;affine:dims=2"
    )]
    network: String,
    /// Rows of the input images.
    #[arg(long, default_value_t = 8)]
    rows: usize,
    /// Columns of the input images.
    #[arg(long, default_value_t = 8)]
    cols: usize,
    /// Training samples.
    #[arg(long, default_value_t = 256)]
    train: usize,
    /// Validation samples.
    #[arg(long, default_value_t = 64)]
    valid: usize,
    /// Test samples.
    #[arg(long, default_value_t = 64)]
    test: usize,
    /// The loss: square, cauchy, logistic or classnll.
    #[arg(long, default_value = "square")]
    loss: String,
    /// The criterion, ie "avg" or "avg-var-reg:lambda=0.1".
    #[arg(long, default_value = "avg")]
    criterion: String,
    /// A batch (gd, cgd-prp, lbfgs, ...) or stochastic (sg, adam, ...) optimizer.
    #[arg(long, default_value = "lbfgs")]
    optimizer: String,
    /// The maximum number of epochs.
    #[arg(long, default_value_t = 50)]
    epochs: usize,
    /// Epochs without improvement before stopping.
    #[arg(long, default_value_t = 10)]
    patience: usize,
    /// Worker threads, 0 for one per core.
    #[arg(long, default_value_t = 0)]
    threads: usize,
    /// Seeds the data, the initial parameters and the minibatches.
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Minibatch size of stochastic optimizers.
    #[arg(long, default_value_t = 32)]
    batch_size: usize,
    /// Initial learning rate of stochastic optimizers.
    #[arg(long, default_value_t = 0.01)]
    rate: Scalar,
    /// Learning rate decay exponent.
    #[arg(long, default_value_t = 0.)]
    decay: Scalar,
    /// Candidate learning rates to tune, ie "0.001,0.01,0.1".
    #[arg(long, value_delimiter = ',')]
    tune: Vec<Scalar>,
    /// Saves the trained network as JSON.
    #[arg(long)]
    save: Option<PathBuf>,
    /// Saves the epoch table.
    #[arg(long)]
    table: Option<PathBuf>,
}

impl Options {
    fn optimizer(&self) -> Result<OptimizerConfig> {
        if let Ok(kind) = self.optimizer.parse::<BatchKind>() {
            return Ok(BatchConfig::new(kind).into());
        }
        if let Ok(kind) = self.optimizer.parse::<StochKind>() {
            return Ok(StochConfig::new(kind)
                .with_batch_size(self.batch_size)
                .with_rate(LearningRate::constant(self.rate).with_decay(self.decay))
                .with_tuning(self.tune.clone(), 2)
                .into());
        }
        bail!("unknown optimizer {:?}", self.optimizer)
    }
}

fn synthetic_task(options: &Options, output_dims: Dims, rng: &mut StdRng) -> Result<MemoryTask> {
    let input_dims = Dims::new(1, options.rows, options.cols);
    let scale = 1. / (input_dims.size() as Scalar).sqrt();
    let weights: Vec<Tensor> = (0..output_dims.size())
        .map(|_| Tensor::random(input_dims, rng, -scale, scale))
        .collect();
    let mut task = MemoryTask::new(input_dims, output_dims);
    let folds = [
        (Fold::train(0), options.train),
        (Fold::valid(0), options.valid),
        (Fold::test(0), options.test),
    ];
    for (fold, size) in folds {
        for _ in 0..size {
            let input = Tensor::random(input_dims, rng, -1., 1.);
            let target = weights
                .iter()
                .map(|w| {
                    let dot: Scalar = w.iter().zip(input.iter()).map(|(w, x)| w * x).sum();
                    (2. * dot).tanh()
                })
                .collect();
            task.push(fold, input, Tensor::from_vec(output_dims, target)?)?;
        }
    }
    Ok(task)
}

fn main() -> Result<()> {
    env_logger::init();
    let options = Options::parse();
    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut network = Network::from_description(
        &layer::registry(),
        Dims::new(1, options.rows, options.cols),
        &options.network,
    )?;
    let task = synthetic_task(&options, network.output_dims(), &mut rng)?;
    network.random_params(&mut rng);
    println!("{network}");

    let loss: Arc<dyn Loss> = loss::registry().build(&options.loss)?.into();
    let criterion: Arc<dyn Criterion> = criterion::registry().build(&options.criterion)?.into();
    let config = TrainerConfig::default()
        .with_epochs(options.epochs)
        .with_patience(options.patience)
        .with_threads(options.threads)
        .with_seed(options.seed)
        .with_optimizer(options.optimizer()?);
    let result = Trainer::new(config).train(&mut network, &task, 0, loss, criterion)?;

    result.write_table(io::stdout().lock())?;
    println!("status: {}", result.status());
    if let Some(rate) = result.tuned_rate() {
        println!("tuned rate: {rate}");
    }
    if let Some(optimum) = result.optimum() {
        println!(
            "optimum: epoch {}, valid {:.6e}, test {:.6e} on {} samples",
            optimum.epoch,
            optimum.valid.value,
            optimum.test.value,
            task.size(Fold::test(0)),
        );
    }
    if let Some(path) = options.table.as_ref() {
        result.save_table(path)?;
    }
    if let Some(path) = options.save.as_ref() {
        network.save(path)?;
        log::info!("saved {path:?}");
    }
    Ok(())
}
