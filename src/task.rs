use crate::{
    error::ConfigError,
    tensor::{Dims, Tensor},
};
use anyhow::{ensure, Result};
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// The role of a set of samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum Protocol {
    /// Used by the optimizer.
    #[display(fmt = "train")]
    Train,
    /// Used for model selection and early stopping.
    #[display(fmt = "valid")]
    Valid,
    /// Only reported.
    #[display(fmt = "test")]
    Test,
}

/// A set of samples: one protocol of one split of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display(fmt = "{}[{}]", protocol, index)]
pub struct Fold {
    /// The split.
    pub index: usize,
    /// The role of the samples.
    pub protocol: Protocol,
}

impl Fold {
    /// The training samples of split `index`.
    pub fn train(index: usize) -> Self {
        Self {
            index,
            protocol: Protocol::Train,
        }
    }
    /// The validation samples of split `index`.
    pub fn valid(index: usize) -> Self {
        Self {
            index,
            protocol: Protocol::Valid,
        }
    }
    /// The test samples of split `index`.
    pub fn test(index: usize) -> Self {
        Self {
            index,
            protocol: Protocol::Test,
        }
    }
}

/// Indexed access to input / target pairs.
///
/// Every input has [`.input_dims()`](Self::input_dims()) and every target has
/// [`.output_dims()`](Self::output_dims()). Samples are addressed by fold and by an index less
/// than [`.size(fold)`](Self::size()).
pub trait Task: Sync {
    /// The dimensions of each input.
    fn input_dims(&self) -> Dims;
    /// The dimensions of each target.
    fn output_dims(&self) -> Dims;
    /// The number of splits.
    fn fold_count(&self) -> usize;
    /// The number of samples in `fold`.
    fn size(&self, fold: Fold) -> usize;
    /// The input of sample `index`.
    fn input(&self, fold: Fold, index: usize) -> &Tensor;
    /// The target of sample `index`.
    fn target(&self, fold: Fold, index: usize) -> &Tensor;
}

#[derive(Debug, Default, Clone)]
struct Samples {
    inputs: Vec<Tensor>,
    targets: Vec<Tensor>,
}

#[derive(Debug, Default, Clone)]
struct Split {
    train: Samples,
    valid: Samples,
    test: Samples,
}

impl Split {
    fn samples(&self, protocol: Protocol) -> &Samples {
        match protocol {
            Protocol::Train => &self.train,
            Protocol::Valid => &self.valid,
            Protocol::Test => &self.test,
        }
    }
    fn samples_mut(&mut self, protocol: Protocol) -> &mut Samples {
        match protocol {
            Protocol::Train => &mut self.train,
            Protocol::Valid => &mut self.valid,
            Protocol::Test => &mut self.test,
        }
    }
}

/// A [`Task`] holding its samples in memory.
#[derive(Debug, Clone)]
pub struct MemoryTask {
    input_dims: Dims,
    output_dims: Dims,
    splits: Vec<Split>,
}

impl MemoryTask {
    /// Creates an empty task with one split.
    pub fn new(input_dims: Dims, output_dims: Dims) -> Self {
        Self {
            input_dims,
            output_dims,
            splits: vec![Split::default()],
        }
    }
    /// Sets the number of splits.
    ///
    /// **Errors**
    /// There must be at least one split.
    pub fn with_fold_count(mut self, fold_count: usize) -> Result<Self> {
        ensure!(fold_count > 0, "a task needs at least one fold");
        self.splits.resize(fold_count, Split::default());
        Ok(self)
    }
    /// Appends a sample to `fold`.
    ///
    /// **Errors**
    /// - The fold index is out of range.
    /// - The input or target has the wrong dimensions.
    pub fn push(&mut self, fold: Fold, input: Tensor, target: Tensor) -> Result<()> {
        ensure!(
            fold.index < self.splits.len(),
            "fold {fold} out of range, fold_count = {}",
            self.splits.len()
        );
        for (expected, found) in [(self.input_dims, input.dims()), (self.output_dims, target.dims())] {
            if expected != found {
                return Err(ConfigError::ShapeMismatch { expected, found }.into());
            }
        }
        let samples = self.splits[fold.index].samples_mut(fold.protocol);
        samples.inputs.push(input);
        samples.targets.push(target);
        Ok(())
    }
}

impl Task for MemoryTask {
    fn input_dims(&self) -> Dims {
        self.input_dims
    }
    fn output_dims(&self) -> Dims {
        self.output_dims
    }
    fn fold_count(&self) -> usize {
        self.splits.len()
    }
    fn size(&self, fold: Fold) -> usize {
        self.splits
            .get(fold.index)
            .map_or(0, |x| x.samples(fold.protocol).inputs.len())
    }
    fn input(&self, fold: Fold, index: usize) -> &Tensor {
        &self.splits[fold.index].samples(fold.protocol).inputs[index]
    }
    fn target(&self, fold: Fold, index: usize) -> &Tensor {
        &self.splits[fold.index].samples(fold.protocol).targets[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_task() {
        let mut task = MemoryTask::new(Dims::new(1, 2, 2), Dims::flat(1))
            .with_fold_count(2)
            .unwrap();
        assert_eq!(task.fold_count(), 2);
        for i in 0..3 {
            let input = Tensor::from_elem(task.input_dims(), i as f64);
            task.push(Fold::train(1), input, Tensor::from_elem(Dims::flat(1), 1.))
                .unwrap();
        }
        task.push(
            Fold::test(0),
            Tensor::zeros(Dims::new(1, 2, 2)),
            Tensor::zeros(Dims::flat(1)),
        )
        .unwrap();
        assert_eq!(task.size(Fold::train(1)), 3);
        assert_eq!(task.size(Fold::valid(1)), 0);
        assert_eq!(task.size(Fold::train(0)), 0);
        assert_eq!(task.size(Fold::test(0)), 1);
        assert_eq!(task.size(Fold::test(5)), 0);
        assert_eq!(task.input(Fold::train(1), 2).as_slice(), &[2.; 4]);
        assert_eq!(task.target(Fold::train(1), 0).as_slice(), &[1.]);
    }

    #[test]
    fn push_errors() {
        let mut task = MemoryTask::new(Dims::new(1, 2, 2), Dims::flat(1));
        let input = Tensor::zeros(Dims::new(1, 2, 2));
        let target = Tensor::zeros(Dims::flat(1));
        assert!(task.push(Fold::train(1), input.clone(), target.clone()).is_err());
        let err = task
            .push(Fold::train(0), Tensor::zeros(Dims::flat(4)), target)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::ShapeMismatch { .. })
        ));
        assert!(task
            .push(Fold::train(0), input, Tensor::zeros(Dims::flat(2)))
            .is_err());
        assert!(MemoryTask::new(Dims::flat(1), Dims::flat(1))
            .with_fold_count(0)
            .is_err());
        assert_eq!(Fold::valid(3).to_string(), "valid[3]");
    }
}
