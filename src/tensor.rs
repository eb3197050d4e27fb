use crate::{error::ConfigError, Scalar};
use anyhow::Result;
use ndarray::{Array3, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis};
use rand::{distributions::Uniform, Rng};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// The shape of a [`Tensor`]: `dims` planes of `rows` x `cols`.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dims {
    /// Number of planes (feature maps).
    pub dims: usize,
    /// Rows per plane.
    pub rows: usize,
    /// Columns per plane.
    pub cols: usize,
}

impl Dims {
    /// Creates a new shape.
    pub const fn new(dims: usize, rows: usize, cols: usize) -> Self {
        Self { dims, rows, cols }
    }
    /// A `size x 1 x 1` shape.
    pub const fn flat(size: usize) -> Self {
        Self::new(size, 1, 1)
    }
    /// The total number of elements.
    pub fn size(&self) -> usize {
        self.dims * self.rows * self.cols
    }
    /// The number of elements in one plane.
    pub fn plane_size(&self) -> usize {
        self.rows * self.cols
    }
}

impl Display for Dims {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}x{}", self.dims, self.rows, self.cols)
    }
}

impl From<(usize, usize, usize)> for Dims {
    fn from((dims, rows, cols): (usize, usize, usize)) -> Self {
        Self::new(dims, rows, cols)
    }
}

/// A dense `dims x rows x cols` array.
///
/// The data is always stored contiguously in standard layout, so it can be viewed either as
/// `dims` planes ([`.plane()`](Self::plane())) or as one flat vector
/// ([`.as_slice()`](Self::as_slice())).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    data: Array3<Scalar>,
}

impl Default for Tensor {
    fn default() -> Self {
        Self::zeros(Dims::default())
    }
}

impl Tensor {
    /// A tensor of zeros.
    pub fn zeros(dims: Dims) -> Self {
        Self {
            data: Array3::zeros([dims.dims, dims.rows, dims.cols]),
        }
    }
    /// A tensor filled with `value`.
    pub fn from_elem(dims: Dims, value: Scalar) -> Self {
        Self {
            data: Array3::from_elem([dims.dims, dims.rows, dims.cols], value),
        }
    }
    /// Creates a tensor from a flat vector in plane, row, col order.
    ///
    /// **Errors**
    /// The length of `data` must be `dims.size()`.
    pub fn from_vec(dims: Dims, data: Vec<Scalar>) -> Result<Self> {
        if data.len() != dims.size() {
            return Err(ConfigError::ShapeMismatch {
                expected: dims,
                found: Dims::flat(data.len()),
            }
            .into());
        }
        let data = Array3::from_shape_vec([dims.dims, dims.rows, dims.cols], data)?;
        Ok(Self { data })
    }
    /// A tensor with elements sampled uniformly from `[min, max)`.
    pub fn random<R: Rng>(dims: Dims, rng: &mut R, min: Scalar, max: Scalar) -> Self {
        let dist = Uniform::new(min, max);
        let data = Array3::from_shape_simple_fn([dims.dims, dims.rows, dims.cols], || {
            rng.sample(dist)
        });
        Self { data }
    }
    /// The shape.
    pub fn dims(&self) -> Dims {
        let (dims, rows, cols) = self.data.dim();
        Dims { dims, rows, cols }
    }
    /// The number of elements.
    pub fn size(&self) -> usize {
        self.data.len()
    }
    /// Resizes to `dims`, zeroing the data if the shape changes.
    pub fn resize(&mut self, dims: Dims) {
        if self.dims() != dims {
            *self = Self::zeros(dims);
        }
    }
    /// Fills with `value`.
    pub fn fill(&mut self, value: Scalar) {
        self.data.fill(value);
    }
    /// Copies the data of `other`, which must have the same shape.
    pub fn assign(&mut self, other: &Tensor) {
        debug_assert_eq!(self.dims(), other.dims());
        self.data.assign(&other.data);
    }
    /// Plane `d` as a 2D view.
    pub fn plane(&self, d: usize) -> ArrayView2<Scalar> {
        self.data.index_axis(Axis(0), d)
    }
    /// Plane `d` as a mutable 2D view.
    pub fn plane_mut(&mut self, d: usize) -> ArrayViewMut2<Scalar> {
        self.data.index_axis_mut(Axis(0), d)
    }
    /// Plane `d` as a flat slice.
    pub fn plane_slice(&self, d: usize) -> &[Scalar] {
        let size = self.dims().plane_size();
        &self.as_slice()[d * size..(d + 1) * size]
    }
    /// Plane `d` as a flat mutable slice.
    pub fn plane_slice_mut(&mut self, d: usize) -> &mut [Scalar] {
        let size = self.dims().plane_size();
        &mut self.as_slice_mut()[d * size..(d + 1) * size]
    }
    /// All of the data as a slice.
    pub fn as_slice(&self) -> &[Scalar] {
        // Tensors are only constructed in standard layout.
        self.data.as_slice().unwrap()
    }
    /// All of the data as a mutable slice.
    pub fn as_slice_mut(&mut self) -> &mut [Scalar] {
        self.data.as_slice_mut().unwrap()
    }
    /// All of the data as a 1D view.
    pub fn vector(&self) -> ArrayView1<Scalar> {
        ArrayView1::from(self.as_slice())
    }
    /// All of the data as a mutable 1D view.
    pub fn vector_mut(&mut self) -> ArrayViewMut1<Scalar> {
        ArrayViewMut1::from(self.as_slice_mut())
    }
    /// Iterates over the elements in plane, row, col order.
    pub fn iter(&self) -> std::slice::Iter<'_, Scalar> {
        self.as_slice().iter()
    }
    /// Whether every element is finite.
    pub fn is_finite(&self) -> bool {
        self.iter().all(|x| x.is_finite())
    }
    /// The index of the largest element.
    pub fn argmax(&self) -> Option<usize> {
        let mut best: Option<(usize, Scalar)> = None;
        for (i, x) in self.iter().copied().enumerate() {
            if best.map_or(true, |(_, b)| x > b) {
                best.replace((i, x));
            }
        }
        best.map(|(i, _)| i)
    }
}

impl From<Array3<Scalar>> for Tensor {
    fn from(data: Array3<Scalar>) -> Self {
        if data.is_standard_layout() {
            Self { data }
        } else {
            Self {
                data: data.as_standard_layout().into_owned(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn planes_are_contiguous_slices() {
        let dims = Dims::new(2, 2, 3);
        let tensor = Tensor::from_vec(dims, (0..12).map(|x| x as Scalar).collect()).unwrap();
        assert_eq!(tensor.dims(), dims);
        assert_eq!(tensor.plane_slice(1), &[6., 7., 8., 9., 10., 11.]);
        assert_eq!(tensor.plane(1)[[1, 2]], 11.);
        assert_eq!(tensor.vector().len(), 12);
        assert_eq!(tensor.argmax(), Some(11));
    }

    #[test]
    fn from_vec_checks_size() {
        let err = Tensor::from_vec(Dims::new(1, 2, 2), vec![0.; 3]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn from_non_standard_layout() {
        let array = Array3::from_shape_fn([2, 3, 4], |(d, r, c)| (d * 100 + r * 10 + c) as Scalar);
        let permuted = array.clone().permuted_axes([0, 2, 1]);
        let tensor = Tensor::from(permuted);
        assert_eq!(tensor.dims(), Dims::new(2, 4, 3));
        assert_eq!(tensor.plane(1)[[3, 2]], 123.);
    }

    #[test]
    fn random_within_bounds() {
        let mut rng = StdRng::seed_from_u64(0);
        let tensor = Tensor::random(Dims::new(3, 4, 5), &mut rng, -0.5, 0.5);
        assert!(tensor.iter().all(|x| (-0.5..0.5).contains(x)));
    }
}
