use crate::tensor::Dims;
use thiserror::Error;

/// Configuration errors.
///
/// These are detected once, while layers, networks, losses or optimizers are being set up, and
/// are never retried. Functions return them wrapped in [`anyhow::Error`], use
/// [`downcast_ref`](anyhow::Error::downcast_ref) to inspect them.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// The input of a layer is smaller than its kernel / window.
    #[error("{kind} expected input of at least {expected}, found {found}!")]
    InputTooSmall {
        /// The layer kind.
        kind: String,
        /// The minimum input dimensions.
        expected: Dims,
        /// The actual input dimensions.
        found: Dims,
    },
    /// Two shapes that must match do not.
    #[error("Shape mismatch, expected {expected} found {found}!")]
    ShapeMismatch {
        /// The required dimensions.
        expected: Dims,
        /// The actual dimensions.
        found: Dims,
    },
    /// A parameter vector does not have the expected length.
    #[error("Expected {expected} parameters, found {found}!")]
    ParamCount {
        /// The parameter count of the model.
        expected: usize,
        /// The length of the vector.
        found: usize,
    },
    /// No factory is registered for this name.
    #[error("Unknown {what} {name:?}, expected one of {known:?}!")]
    UnknownKind {
        /// What is being looked up (ie "layer").
        what: &'static str,
        /// The requested name.
        name: String,
        /// The registered names.
        known: Vec<String>,
    },
    /// A configuration value could not be parsed or is out of range.
    #[error("Invalid parameter {key:?} = {value:?}: {reason}!")]
    InvalidParameter {
        /// The parameter name.
        key: String,
        /// The offending value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(
        key: impl Into<String>,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidParameter {
            key: key.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}
