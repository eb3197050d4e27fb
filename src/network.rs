use crate::{
    error::ConfigError,
    layer::Layer,
    registry::Registry,
    tensor::{Dims, Tensor},
    Scalar, Vector,
};
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

#[cfg(test)]
mod tests;

/// A chain of layers.
///
/// The output of each layer is the input of the next. The parameter vector of the network is
/// the concatenation of the parameters of its layers, in order.
///
/// Like its layers, a network caches the intermediate results of the last
/// [`.value()`](Self::value()), which [`.gradient()`](Self::gradient()) uses.
#[derive(Debug, Clone)]
pub struct Network {
    input_dims: Dims,
    layers: Vec<Box<dyn Layer>>,
    param_count: usize,
}

#[derive(Serialize, Deserialize)]
struct NetworkFile {
    description: String,
    input_dims: Dims,
    params: Vec<Scalar>,
}

impl Network {
    /// Creates a network, configuring each layer for the output of the previous one.
    ///
    /// **Errors**
    /// Returns an error if a layer cannot be configured for its input.
    pub fn new(input_dims: Dims, mut layers: Vec<Box<dyn Layer>>) -> Result<Self> {
        let mut dims = input_dims;
        let mut param_count = 0;
        for (i, layer) in layers.iter_mut().enumerate() {
            dims = layer
                .configure(dims)
                .with_context(|| format!("layer {i} ({})", layer.describe()))?;
            param_count += layer.param_count();
            log::debug!(
                "layer {i} {}: {} -> {}, {} params",
                layer.describe(),
                layer.input_dims(),
                layer.output_dims(),
                layer.param_count(),
            );
        }
        Ok(Self {
            input_dims,
            layers,
            param_count,
        })
    }
    /// Creates a network from a `;` separated list of layer descriptions, ie
    /// `"conv:dims=8,rows=3,cols=3;act-tanh;pool-max;affine:dims=10"`.
    ///
    /// See [`Registry::build()`].
    pub fn from_description(
        registry: &Registry<Box<dyn Layer>>,
        input_dims: Dims,
        description: &str,
    ) -> Result<Self> {
        let layers = description
            .split(';')
            .map(str::trim)
            .filter(|x| !x.is_empty())
            .map(|x| registry.build(x))
            .collect::<Result<Vec<_>>>()?;
        Self::new(input_dims, layers)
    }
    /// The layer descriptions joined by `;`.
    pub fn description(&self) -> String {
        self.layers
            .iter()
            .map(|x| x.describe())
            .collect::<Vec<_>>()
            .join(";")
    }
    /// The layers.
    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }
    /// The number of layers.
    pub fn depth(&self) -> usize {
        self.layers.len()
    }
    /// The input dimensions.
    pub fn input_dims(&self) -> Dims {
        self.input_dims
    }
    /// The output dimensions.
    pub fn output_dims(&self) -> Dims {
        self.layers
            .last()
            .map_or(self.input_dims, |x| x.output_dims())
    }
    /// The number of parameters.
    pub fn param_count(&self) -> usize {
        self.param_count
    }
    /// Computes the output for `input`.
    ///
    /// A network without layers returns `input`.
    pub fn value<'a>(&'a mut self, input: &'a Tensor) -> &'a Tensor {
        debug_assert_eq!(input.dims(), self.input_dims);
        let mut output = input;
        for layer in self.layers.iter_mut() {
            output = layer.forward(output);
        }
        output
    }
    /// Back propagates `output_grad` for the last [`.value()`](Self::value()).
    ///
    /// Writes the gradient of the parameters into `param_grad`, which has length
    /// [`.param_count()`](Self::param_count()), and returns the gradient of the input.
    pub fn gradient<'a>(
        &'a mut self,
        output_grad: &'a Tensor,
        param_grad: &mut [Scalar],
    ) -> &'a Tensor {
        debug_assert_eq!(output_grad.dims(), self.output_dims());
        debug_assert_eq!(param_grad.len(), self.param_count);
        let mut grad = output_grad;
        let mut end = param_grad.len();
        for layer in self.layers.iter_mut().rev() {
            let start = end - layer.param_count();
            layer.backward_params(grad, &mut param_grad[start..end]);
            grad = layer.backward_input(grad);
            end = start;
        }
        grad
    }
    /// Sets all parameters to zero.
    pub fn zero_params(&mut self) {
        self.layers.iter_mut().for_each(|x| x.zero_params());
    }
    /// Initializes the parameters randomly.
    pub fn random_params(&mut self, rng: &mut StdRng) {
        self.layers.iter_mut().for_each(|x| x.random_params(rng));
    }
    /// The parameters.
    pub fn save_params(&self) -> Vector {
        let mut params = vec![0.; self.param_count];
        let mut offset = 0;
        for layer in self.layers.iter() {
            let count = layer.param_count();
            layer.save_params(&mut params[offset..offset + count]);
            offset += count;
        }
        Vector::from(params)
    }
    /// Sets the parameters.
    ///
    /// **Errors**
    /// `params` must have length [`.param_count()`](Self::param_count()).
    pub fn load_params(&mut self, params: &[Scalar]) -> Result<()> {
        if params.len() != self.param_count {
            return Err(ConfigError::ParamCount {
                expected: self.param_count,
                found: params.len(),
            }
            .into());
        }
        let mut offset = 0;
        for layer in self.layers.iter_mut() {
            let count = layer.param_count();
            layer.load_params(&params[offset..offset + count]);
            offset += count;
        }
        Ok(())
    }
    /// Saves the description, input dimensions and parameters to `path` as json.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = NetworkFile {
            description: self.description(),
            input_dims: self.input_dims,
            params: self.save_params().to_vec(),
        };
        let mut writer = BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        );
        serde_json::to_writer(&mut writer, &file)?;
        writer.flush()?;
        Ok(())
    }
    /// Loads a network saved with [`.save()`](Self::save()), building its layers with `registry`.
    pub fn load(path: impl AsRef<Path>, registry: &Registry<Box<dyn Layer>>) -> Result<Self> {
        let path = path.as_ref();
        let reader =
            BufReader::new(File::open(path).with_context(|| format!("opening {}", path.display()))?);
        let file: NetworkFile = serde_json::from_reader(reader)
            .with_context(|| format!("parsing {}", path.display()))?;
        let mut network = Self::from_description(registry, file.input_dims, &file.description)?;
        network.load_params(&file.params)?;
        Ok(network)
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "network: {} -> {}, {} params",
            self.input_dims,
            self.output_dims(),
            self.param_count
        )?;
        for (i, layer) in self.layers.iter().enumerate() {
            writeln!(
                f,
                "  [{i}] {}: {} -> {}, {} params",
                layer.describe(),
                layer.input_dims(),
                layer.output_dims(),
                layer.param_count()
            )?;
        }
        Ok(())
    }
}
