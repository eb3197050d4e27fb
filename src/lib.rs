/*!
# nanotrain

Trains feed-forward layer graphs by minimizing a scalar criterion with batch
(gradient descent, nonlinear conjugate gradient, L-BFGS) or stochastic
(SG, momentum, Nesterov, Adam, Adagrad, ...) optimizers.

Layers implement their forward pass and both backward passes by hand (there is
no autograd graph), so a [`Network`](network::Network) is a plain ordered list of
[`Layer`](layer::Layer)s sharing one flat parameter vector.

```no_run
# use anyhow::Result;
use nanotrain::{
    criterion, layer, loss,
    network::Network,
    task::{Fold, MemoryTask},
    tensor::Dims,
    trainer::{Trainer, TrainerConfig},
};
use std::sync::Arc;

# fn main() -> Result<()> {
let layers = layer::registry();
let mut network = Network::from_description(
    &layers,
    Dims::new(1, 8, 8),
    "conv:dims=4,rows=3,cols=3;act-snorm;pool-max;affine:dims=2",
)?;
# let task: MemoryTask = todo!();
let loss: Arc<dyn loss::Loss> = loss::registry().build("square")?.into();
let criterion: Arc<dyn criterion::Criterion> = criterion::registry().build("avg")?.into();
let trainer = Trainer::new(TrainerConfig::default());
let result = trainer.train(&mut network, &task, 0, loss, criterion)?;
println!("{:?}", result.optimum());
# Ok(())
# }
```
*/

/// Accumulation of criterion values and gradients over samples.
pub mod accumulator;
/// Aggregation of per-sample losses.
pub mod criterion;
/// Errors.
pub mod error;
/// Scalar functions consumed by the optimizers.
pub mod function;
/// Layers.
pub mod layer;
/// Per-sample losses.
pub mod loss;
/// Networks.
pub mod network;
/// Batch and stochastic optimizers.
pub mod optim;
mod parallel;
/// Named factories.
pub mod registry;
/// Sample access.
pub mod task;
/// Tensors.
pub mod tensor;
/// Training loops and result tracking.
pub mod trainer;

/// The floating point type used for parameters, samples and gradients.
pub type Scalar = f64;

/// A flat vector of [`Scalar`]s (parameters or gradients).
pub type Vector = ndarray::Array1<Scalar>;
