use crate::{
    criterion::Criterion,
    error::ConfigError,
    loss::Loss,
    network::Network,
    parallel::{chunk, WorkerPool},
    task::{Fold, Task},
    tensor::Tensor,
    Scalar, Vector,
};
use anyhow::{ensure, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The aggregate of a criterion over a set of samples.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// The criterion value, including regularization.
    pub value: Scalar,
    /// The average per-sample error.
    pub error: Scalar,
    /// The number of samples.
    pub count: usize,
}

#[derive(Debug)]
struct Worker {
    network: Network,
    output_grad: Tensor,
    sample_grad: Vec<Scalar>,
    grad: Vec<Scalar>,
    losses: Vec<Scalar>,
    error: Scalar,
}

impl Worker {
    fn new(network: Network) -> Self {
        let param_count = network.param_count();
        Self {
            output_grad: Tensor::zeros(network.output_dims()),
            sample_grad: vec![0.; param_count],
            grad: vec![0.; param_count],
            losses: Vec::new(),
            error: 0.,
            network,
        }
    }
    fn reset(&mut self) {
        self.grad.fill(0.);
        self.losses.clear();
        self.error = 0.;
    }
}

#[derive(Clone, Copy)]
enum Pass<'a> {
    Value,
    Gradient,
    Weighted(&'a [Scalar]),
}

/// Evaluates a network, loss and criterion over samples on a fixed number of threads.
///
/// Every thread owns a private copy of the network. The samples are split into contiguous
/// chunks, one per thread, and the partial sums are reduced in thread order.
///
/// Criteria with loss dependent weights (see [`Criterion::two_pass()`]) take two passes for a
/// gradient: the first collects the losses, the second accumulates the weighted sample
/// gradients.
#[derive(Debug)]
pub struct Accumulator {
    pool: WorkerPool,
    workers: Vec<Mutex<Worker>>,
    loss: Arc<dyn Loss>,
    criterion: Arc<dyn Criterion>,
    params: Vector,
}

impl Accumulator {
    /// Creates an accumulator with `threads` copies of `network`, starting from its current
    /// parameters.
    ///
    /// If `threads` is 0, uses the number of threads of the global rayon pool.
    pub fn new(
        network: &Network,
        loss: Arc<dyn Loss>,
        criterion: Arc<dyn Criterion>,
        threads: usize,
    ) -> Result<Self> {
        let pool = WorkerPool::new(threads)?;
        let workers = (0..pool.threads())
            .map(|_| Mutex::new(Worker::new(network.clone())))
            .collect();
        Ok(Self {
            pool,
            workers,
            loss,
            criterion,
            params: network.save_params(),
        })
    }
    /// The number of threads.
    pub fn threads(&self) -> usize {
        self.pool.threads()
    }
    /// The number of parameters.
    pub fn param_count(&self) -> usize {
        self.params.len()
    }
    /// The current parameters.
    pub fn params(&self) -> &Vector {
        &self.params
    }
    /// The loss.
    pub fn loss(&self) -> &Arc<dyn Loss> {
        &self.loss
    }
    /// The criterion.
    pub fn criterion(&self) -> &Arc<dyn Criterion> {
        &self.criterion
    }
    /// Sets the parameters of every network copy.
    ///
    /// **Errors**
    /// `params` must have length [`.param_count()`](Self::param_count()).
    pub fn set_params(&mut self, params: &[Scalar]) -> Result<()> {
        if params.len() != self.params.len() {
            return Err(ConfigError::ParamCount {
                expected: self.params.len(),
                found: params.len(),
            }
            .into());
        }
        for worker in self.workers.iter_mut() {
            worker.get_mut().network.load_params(params)?;
        }
        self.params = Vector::from(params.to_vec());
        Ok(())
    }
    /// Evaluates the criterion over the samples `indices` of `fold`.
    ///
    /// **Errors**
    /// `indices` must not be empty.
    pub fn value(&self, task: &dyn Task, fold: Fold, indices: &[usize]) -> Result<Evaluation> {
        ensure!(!indices.is_empty(), "no samples to evaluate in {fold}");
        self.run(task, fold, indices, Pass::Value);
        let (losses, error) = self.losses();
        Ok(self.evaluation(&losses, error))
    }
    /// Evaluates the criterion and its gradient w.r.t. the parameters over the samples
    /// `indices` of `fold`.
    ///
    /// **Errors**
    /// `indices` must not be empty.
    pub fn vgrad(
        &self,
        task: &dyn Task,
        fold: Fold,
        indices: &[usize],
    ) -> Result<(Evaluation, Vector)> {
        ensure!(!indices.is_empty(), "no samples to evaluate in {fold}");
        let mut grad = Vector::zeros(self.params.len());
        let (losses, error) = if self.criterion.two_pass() {
            self.run(task, fold, indices, Pass::Value);
            let (losses, error) = self.losses();
            let weights = self.criterion.weights(&losses);
            self.run(task, fold, indices, Pass::Weighted(&weights));
            self.sum_grads(&mut grad);
            (losses, error)
        } else {
            self.run(task, fold, indices, Pass::Gradient);
            self.sum_grads(&mut grad);
            grad /= indices.len() as Scalar;
            self.losses()
        };
        if let (Some(params), Some(grad)) = (self.params.as_slice(), grad.as_slice_mut()) {
            self.criterion.regularize(params, grad);
        }
        Ok((self.evaluation(&losses, error), grad))
    }
    fn run(&self, task: &dyn Task, fold: Fold, indices: &[usize], pass: Pass<'_>) {
        let loss = &*self.loss;
        self.pool.broadcast(|thread_id, threads| {
            let range = chunk(indices.len(), thread_id, threads);
            let mut guard = self.workers[thread_id].lock();
            let worker = &mut *guard;
            worker.reset();
            for (i, &index) in indices[range.clone()].iter().enumerate() {
                let input = task.input(fold, index);
                let target = task.target(fold, index);
                let output = worker.network.value(input);
                worker.error += loss.error(target, output);
                let weight = match pass {
                    Pass::Value => {
                        worker.losses.push(loss.value(target, output));
                        continue;
                    }
                    Pass::Gradient => 1.,
                    Pass::Weighted(weights) => weights[range.start + i],
                };
                worker
                    .losses
                    .push(loss.vgrad(target, output, &mut worker.output_grad));
                worker
                    .network
                    .gradient(&worker.output_grad, &mut worker.sample_grad);
                for (g, dg) in worker.grad.iter_mut().zip(worker.sample_grad.iter()) {
                    *g += weight * dg;
                }
            }
        });
    }
    /// The losses in sample order and the error sum of the last pass.
    fn losses(&self) -> (Vec<Scalar>, Scalar) {
        let mut losses = Vec::new();
        let mut error = 0.;
        for worker in self.workers.iter() {
            let worker = worker.lock();
            losses.extend_from_slice(&worker.losses);
            error += worker.error;
        }
        (losses, error)
    }
    fn sum_grads(&self, grad: &mut Vector) {
        for worker in self.workers.iter() {
            let worker = worker.lock();
            for (g, dg) in grad.iter_mut().zip(worker.grad.iter()) {
                *g += dg;
            }
        }
    }
    fn evaluation(&self, losses: &[Scalar], error: Scalar) -> Evaluation {
        let params = self.params.as_slice().unwrap_or_default();
        Evaluation {
            value: self.criterion.value(losses, params),
            error: error / losses.len() as Scalar,
            count: losses.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        criterion, layer, loss,
        task::MemoryTask,
        tensor::Dims,
    };
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use rand::{rngs::StdRng, SeedableRng};

    fn task(size: usize) -> MemoryTask {
        let mut rng = StdRng::seed_from_u64(0);
        let mut task = MemoryTask::new(Dims::new(1, 5, 5), Dims::flat(3));
        for _ in 0..size {
            let input = Tensor::random(task.input_dims(), &mut rng, -1., 1.);
            let target = Tensor::random(task.output_dims(), &mut rng, -1., 1.);
            task.push(Fold::train(0), input, target).unwrap();
        }
        task
    }

    fn accumulator(criterion: &str, threads: usize) -> Accumulator {
        let mut network = Network::from_description(
            &layer::registry(),
            Dims::new(1, 5, 5),
            "conv:dims=2,rows=2,cols=2;act-tanh;pool-soft;affine:dims=3",
        )
        .unwrap();
        network.random_params(&mut StdRng::seed_from_u64(1));
        let loss: Arc<dyn Loss> = loss::registry().build("cauchy").unwrap().into();
        let criterion: Arc<dyn Criterion> = criterion::registry().build(criterion).unwrap().into();
        Accumulator::new(&network, loss, criterion, threads).unwrap()
    }

    #[test]
    fn thread_invariance() {
        let task = task(23);
        let indices: Vec<usize> = (0..23).collect();
        for criterion in ["avg", "avg-l2n-reg:lambda=0.1", "avg-var-reg", "max:beta=2"] {
            let expected = accumulator(criterion, 1);
            assert_eq!(expected.threads(), 1);
            let value = expected.value(&task, Fold::train(0), &indices).unwrap();
            let (eval, grad) = expected.vgrad(&task, Fold::train(0), &indices).unwrap();
            assert_eq!(value.count, 23);
            assert_relative_eq!(value.value, eval.value, max_relative = 1e-12);
            for threads in [2, 4] {
                let accumulator = accumulator(criterion, threads);
                assert_eq!(accumulator.threads(), threads);
                let other = accumulator.value(&task, Fold::train(0), &indices).unwrap();
                assert_relative_eq!(other.value, value.value, max_relative = 1e-12);
                assert_relative_eq!(other.error, value.error, max_relative = 1e-12);
                let (other, other_grad) =
                    accumulator.vgrad(&task, Fold::train(0), &indices).unwrap();
                assert_relative_eq!(other.value, eval.value, max_relative = 1e-12);
                assert_relative_eq!(other_grad, grad, max_relative = 1e-10, epsilon = 1e-14);
            }
        }
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let h = 1e-6;
        let task = task(9);
        let indices = [0, 2, 3, 5, 8];
        for criterion in ["avg", "avg-l2n-reg:lambda=0.1", "avg-var-reg:lambda=0.5", "max:beta=3"] {
            let mut accumulator = accumulator(criterion, 2);
            let params = accumulator.params().clone();
            let (_, grad) = accumulator.vgrad(&task, Fold::train(0), &indices).unwrap();
            for i in 0..params.len() {
                let mut x = params.clone();
                x[i] += h;
                accumulator.set_params(x.as_slice().unwrap()).unwrap();
                let fp = accumulator.value(&task, Fold::train(0), &indices).unwrap().value;
                x[i] -= 2. * h;
                accumulator.set_params(x.as_slice().unwrap()).unwrap();
                let fm = accumulator.value(&task, Fold::train(0), &indices).unwrap().value;
                assert_abs_diff_eq!(grad[i], (fp - fm) / (2. * h), epsilon = 1e-7);
            }
        }
    }

    #[test]
    fn errors() {
        let task = task(2);
        let mut accumulator = accumulator("avg", 1);
        assert!(accumulator.value(&task, Fold::train(0), &[]).is_err());
        assert!(accumulator.vgrad(&task, Fold::train(0), &[]).is_err());
        assert!(accumulator.set_params(&[0.; 3]).is_err());
        let params = vec![0.; accumulator.param_count()];
        accumulator.set_params(&params).unwrap();
        assert!(accumulator.params().iter().all(|x| *x == 0.));
    }
}
