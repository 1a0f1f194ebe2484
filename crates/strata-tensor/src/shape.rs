use crate::tensor_data::TensorError;

/// Ordered list of tensor dimensions.
///
/// Every dimension of a shape built with [`Shape::new`] is greater than zero
/// and the number of elements fits in `usize`. The empty shape only exists as
/// the shape of a default [`crate::TensorData`], and has a size of zero.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "Vec<usize>", into = "Vec<usize>"))]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Creates a shape from its dimensions, outermost first.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::InvalidShape`] if `dims` is empty, contains a
    /// zero, or describes more than `usize::MAX` elements.
    ///
    /// # Example
    ///
    /// ```
    /// use strata_tensor::Shape;
    ///
    /// let shape = Shape::new([2, 3, 4]).unwrap();
    /// assert_eq!(shape.rows(), 3);
    /// assert_eq!(shape.cols(), 4);
    /// assert_eq!(shape.size(), 24);
    /// ```
    pub fn new(dims: impl Into<Vec<usize>>) -> Result<Self, TensorError> {
        let dims = dims.into();
        if dims.is_empty() {
            return Err(TensorError::invalid_shape(dims, "a shape needs at least one dimension"));
        }
        if dims.contains(&0) {
            return Err(TensorError::invalid_shape(
                dims,
                "dimensions must be greater than zero",
            ));
        }
        if checked_size(&dims).is_none() {
            return Err(TensorError::invalid_shape(
                dims,
                "number of elements overflows usize",
            ));
        }
        Ok(Self { dims })
    }

    /// Number of dimensions.
    #[inline]
    pub fn dim(&self) -> usize {
        self.dims.len()
    }

    /// Returns dimension `index`, outermost first.
    pub fn at(&self, index: usize) -> Option<usize> {
        self.dims.get(index).copied()
    }

    /// Replaces dimension `index` with `value`.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::InvalidShape`] if `index` is out of range or
    /// the resulting shape is invalid. The shape is left unchanged.
    pub fn set(&mut self, index: usize, value: usize) -> Result<(), TensorError> {
        if index >= self.dims.len() {
            return Err(TensorError::invalid_shape(
                self.dims.clone(),
                format!("dimension {} out of range", index),
            ));
        }
        let mut dims = self.dims.clone();
        dims[index] = value;
        *self = Shape::new(dims)?;
        Ok(())
    }

    /// Second-to-last dimension, or 1 for shapes with fewer than two
    /// dimensions.
    pub fn rows(&self) -> usize {
        match self.dims.len() {
            0 | 1 => 1,
            n => self.dims[n - 2],
        }
    }

    /// Last dimension.
    pub fn cols(&self) -> usize {
        self.dims.last().copied().unwrap_or(0)
    }

    /// Total number of elements.
    pub fn size(&self) -> usize {
        if self.dims.is_empty() {
            0
        } else {
            self.dims.iter().product()
        }
    }

    /// Returns the shape with its last two dimensions swapped.
    pub fn transpose(&self) -> Shape {
        let mut dims = self.dims.clone();
        let n = dims.len();
        if n >= 2 {
            dims.swap(n - 1, n - 2);
        }
        Shape { dims }
    }

    /// Returns the shape left-padded with ones up to `rank` dimensions.
    pub fn expand(&self, rank: usize) -> Shape {
        let pad = rank.saturating_sub(self.dims.len());
        let dims = std::iter::repeat(1)
            .take(pad)
            .chain(self.dims.iter().copied())
            .collect();
        Shape { dims }
    }

    /// Returns the shape without its leading ones, keeping at least one
    /// dimension.
    pub fn squeeze(&self) -> Shape {
        let leading = self
            .dims
            .iter()
            .take(self.dims.len().saturating_sub(1))
            .take_while(|&&d| d == 1)
            .count();
        Shape {
            dims: self.dims[leading..].to_vec(),
        }
    }

    /// Product of the dimensions preceding the trailing `required_dim`
    /// dimensions, or 1 if there are none.
    pub fn batch_size(&self, required_dim: usize) -> usize {
        let batch_dims = self.dims.len().saturating_sub(required_dim);
        self.dims[..batch_dims].iter().product()
    }

    /// Returns the shape with an outer batch dimension when `batch > 1`.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::InvalidShape`] if the batched shape has too many
    /// elements.
    pub fn with_batch(&self, batch: usize) -> Result<Shape, TensorError> {
        if batch <= 1 {
            return Ok(self.clone());
        }
        let mut dims = Vec::with_capacity(self.dims.len() + 1);
        dims.push(batch);
        dims.extend_from_slice(&self.dims);
        Shape::new(dims)
    }

    /// Returns true if both shapes broadcast under right-aligned matching,
    /// where each dimension pair is equal or contains a one.
    pub fn is_broadcastable_with(&self, other: &Shape) -> bool {
        self.dims
            .iter()
            .rev()
            .zip(other.dims.iter().rev())
            .all(|(&a, &b)| a == b || a == 1 || b == 1)
    }

    /// Returns the shape both operands broadcast to.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::ShapeMismatch`] if the shapes are not
    /// broadcastable, and [`TensorError::InvalidShape`] if the result has too
    /// many elements.
    pub fn broadcast_with(&self, other: &Shape) -> Result<Shape, TensorError> {
        if !self.is_broadcastable_with(other) {
            return Err(TensorError::ShapeMismatch {
                expected: self.clone(),
                actual: other.clone(),
            });
        }
        let rank = self.dim().max(other.dim());
        let (lhs, rhs) = (self.expand(rank), other.expand(rank));
        let dims = lhs
            .dims
            .iter()
            .zip(&rhs.dims)
            .map(|(&a, &b)| a.max(b))
            .collect::<Vec<_>>();
        Shape::new(dims)
    }

    /// Returns the dimensions as a slice.
    #[inline]
    pub fn as_slice(&self) -> &[usize] {
        &self.dims
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.dims)
    }
}

impl TryFrom<&[usize]> for Shape {
    type Error = TensorError;

    fn try_from(dims: &[usize]) -> Result<Self, Self::Error> {
        Shape::new(dims)
    }
}

impl TryFrom<Vec<usize>> for Shape {
    type Error = TensorError;

    fn try_from(dims: Vec<usize>) -> Result<Self, Self::Error> {
        Shape::new(dims)
    }
}

impl From<Shape> for Vec<usize> {
    fn from(shape: Shape) -> Self {
        shape.dims
    }
}

fn checked_size(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}
