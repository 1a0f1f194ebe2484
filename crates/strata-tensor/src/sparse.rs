//! Compressed sparse row matrices.
//!
//! A sparse tensor stores one [`SparseMatrix`] in a single pooled chunk,
//! packed as `[nnz | values | col_indices | row_offsets]`. Counts and indices
//! are `u32` and share the 4-byte slots of the `f32` values through their bit
//! patterns. The chunk is sized for the densest matrix of its shape, so a
//! write never has to move it.

use crate::tensor_data::TensorError;

/// Shape of a packed sparse matrix inside its chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SparseLayout {
    /// Number of rows.
    pub rows: usize,
    /// Number of columns.
    pub cols: usize,
    /// Number of stored values.
    pub nnz: usize,
}

impl SparseLayout {
    /// Elements needed to pack the matrix: one header element followed by
    /// `2 * nnz + rows + 1` elements.
    #[inline]
    pub fn total_length(&self) -> usize {
        2 * self.nnz + self.rows + 2
    }

    /// Elements needed to pack any `rows x cols` matrix, or `None` if that
    /// does not fit in `usize`.
    pub fn reserved_length(rows: usize, cols: usize) -> Option<usize> {
        rows.checked_mul(cols)?
            .checked_mul(2)?
            .checked_add(rows)?
            .checked_add(2)
    }
}

/// Sparse matrix in compressed sparse row form.
///
/// Column indices are sorted and unique within each row.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseMatrix {
    rows: usize,
    cols: usize,
    values: Vec<f32>,
    col_indices: Vec<u32>,
    row_offsets: Vec<u32>,
}

impl SparseMatrix {
    /// Creates a matrix from its CSR arrays.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::InvalidSparse`] if the arrays do not form a
    /// valid CSR matrix.
    pub fn new(
        rows: usize,
        cols: usize,
        values: Vec<f32>,
        col_indices: Vec<u32>,
        row_offsets: Vec<u32>,
    ) -> Result<Self, TensorError> {
        let matrix = Self {
            rows,
            cols,
            values,
            col_indices,
            row_offsets,
        };
        matrix.validate()?;
        Ok(matrix)
    }

    /// Creates a matrix without stored values.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            values: Vec::new(),
            col_indices: Vec::new(),
            row_offsets: vec![0; rows + 1],
        }
    }

    /// Creates a matrix from `(row, col, value)` entries in any order.
    /// Duplicate positions are summed.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::InvalidSparse`] if an entry lies outside the
    /// matrix.
    ///
    /// # Example
    ///
    /// ```
    /// use strata_tensor::SparseMatrix;
    ///
    /// let triplets = [(1, 2, 5.0), (0, 0, 1.0), (1, 2, 1.0)];
    /// let m = SparseMatrix::from_triplets(2, 3, &triplets).unwrap();
    /// assert_eq!(m.nnz(), 2);
    /// assert_eq!(m.to_dense(), vec![1.0, 0.0, 0.0, 0.0, 0.0, 6.0]);
    /// ```
    pub fn from_triplets(
        rows: usize,
        cols: usize,
        triplets: &[(usize, usize, f32)],
    ) -> Result<Self, TensorError> {
        check_dims(rows, cols)?;
        if let Some(&(r, c, _)) = triplets.iter().find(|&&(r, c, _)| r >= rows || c >= cols) {
            return Err(TensorError::InvalidSparse(format!(
                "entry ({}, {}) outside a {}x{} matrix",
                r, c, rows, cols
            )));
        }

        let mut sorted = triplets.to_vec();
        sorted.sort_by_key(|&(r, c, _)| (r, c));

        let mut matrix = Self::zeros(rows, cols);
        let mut counts = vec![0u32; rows];
        let mut last = None;
        for (r, c, v) in sorted {
            if last == Some((r, c)) {
                if let Some(value) = matrix.values.last_mut() {
                    *value += v;
                }
                continue;
            }
            matrix.values.push(v);
            matrix.col_indices.push(c as u32);
            counts[r] += 1;
            last = Some((r, c));
        }
        for (r, count) in counts.into_iter().enumerate() {
            matrix.row_offsets[r + 1] = matrix.row_offsets[r] + count;
        }
        Ok(matrix)
    }

    /// Creates a matrix from row-major dense data, dropping zeros.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::LengthMismatch`] if `data` does not hold
    /// `rows * cols` elements.
    pub fn from_dense(rows: usize, cols: usize, data: &[f32]) -> Result<Self, TensorError> {
        check_dims(rows, cols)?;
        if data.len() != rows * cols {
            return Err(TensorError::LengthMismatch {
                expected: rows * cols,
                actual: data.len(),
            });
        }
        let mut matrix = Self::zeros(rows, cols);
        for (r, row) in data.chunks_exact(cols.max(1)).enumerate().take(rows) {
            for (c, &v) in row.iter().enumerate() {
                if v != 0.0 {
                    matrix.values.push(v);
                    matrix.col_indices.push(c as u32);
                }
            }
            matrix.row_offsets[r + 1] = matrix.values.len() as u32;
        }
        Ok(matrix)
    }

    /// Expands the matrix into row-major dense data.
    pub fn to_dense(&self) -> Vec<f32> {
        let mut dense = vec![0.0; self.rows * self.cols];
        for r in 0..self.rows {
            for i in self.row_range(r) {
                dense[r * self.cols + self.col_indices[i] as usize] = self.values[i];
            }
        }
        dense
    }

    /// Returns the value at `(row, col)`, or `None` outside the matrix.
    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        let range = self.row_range(row);
        let found = self.col_indices[range.clone()].binary_search(&(col as u32));
        Some(found.map_or(0.0, |i| self.values[range.start + i]))
    }

    /// Number of rows.
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of stored values.
    #[inline]
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Stored values, row by row.
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Column index of every stored value.
    pub fn col_indices(&self) -> &[u32] {
        &self.col_indices
    }

    /// Offsets of each row into `values`, `rows + 1` entries.
    pub fn row_offsets(&self) -> &[u32] {
        &self.row_offsets
    }

    /// Returns the packed layout of this matrix.
    pub fn layout(&self) -> SparseLayout {
        SparseLayout {
            rows: self.rows,
            cols: self.cols,
            nnz: self.nnz(),
        }
    }

    /// Checks the CSR invariants.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::InvalidSparse`] describing the first violation.
    pub fn validate(&self) -> Result<(), TensorError> {
        check_dims(self.rows, self.cols)?;
        let invalid = |reason: String| Err(TensorError::InvalidSparse(reason));
        if self.values.len() != self.col_indices.len() {
            return invalid(format!(
                "{} values but {} column indices",
                self.values.len(),
                self.col_indices.len()
            ));
        }
        if self.row_offsets.len() != self.rows + 1 {
            return invalid(format!(
                "{} row offsets for {} rows",
                self.row_offsets.len(),
                self.rows
            ));
        }
        if self.row_offsets[0] != 0 || self.row_offsets[self.rows] as usize != self.nnz() {
            return invalid("row offsets must start at 0 and end at nnz".to_string());
        }
        if let Some(r) = self.row_offsets.windows(2).position(|w| w[0] > w[1]) {
            return invalid(format!("row offsets decrease at row {}", r));
        }
        for r in 0..self.rows {
            let row = &self.col_indices[self.row_range(r)];
            if row.iter().any(|&c| c as usize >= self.cols) {
                return invalid(format!("column index out of range in row {}", r));
            }
            if row.windows(2).any(|w| w[0] >= w[1]) {
                return invalid(format!("column indices of row {} are not strictly increasing", r));
            }
        }
        Ok(())
    }

    /// Packs the matrix as `[nnz | values | col_indices | row_offsets]`.
    pub(crate) fn encode(&self) -> Vec<f32> {
        let mut packed = Vec::with_capacity(self.layout().total_length());
        // validated matrices end their u32 offsets at nnz
        packed.push(f32::from_bits(self.nnz() as u32));
        packed.extend_from_slice(&self.values);
        packed.extend(self.col_indices.iter().map(|&c| f32::from_bits(c)));
        packed.extend(self.row_offsets.iter().map(|&o| f32::from_bits(o)));
        packed
    }

    /// Reads the number of stored values from the first packed element.
    pub(crate) fn decode_nnz(header: f32) -> usize {
        header.to_bits() as usize
    }

    /// Unpacks a `rows x cols` matrix written by [`SparseMatrix::encode`].
    pub(crate) fn decode(rows: usize, cols: usize, packed: &[f32]) -> Result<Self, TensorError> {
        let Some((&header, body)) = packed.split_first() else {
            return Err(TensorError::LengthMismatch {
                expected: 1,
                actual: 0,
            });
        };
        let layout = SparseLayout {
            rows,
            cols,
            nnz: Self::decode_nnz(header),
        };
        if packed.len() < layout.total_length() {
            return Err(TensorError::LengthMismatch {
                expected: layout.total_length(),
                actual: packed.len(),
            });
        }
        let (values, rest) = body.split_at(layout.nnz);
        let (col_indices, rest) = rest.split_at(layout.nnz);
        let offsets = &rest[..rows + 1];
        Self::new(
            rows,
            cols,
            values.to_vec(),
            col_indices.iter().map(|v| v.to_bits()).collect(),
            offsets.iter().map(|v| v.to_bits()).collect(),
        )
    }

    fn row_range(&self, row: usize) -> std::ops::Range<usize> {
        self.row_offsets[row] as usize..self.row_offsets[row + 1] as usize
    }
}

pub(crate) fn check_dims(rows: usize, cols: usize) -> Result<(), TensorError> {
    if u32::try_from(rows).is_err() || u32::try_from(cols).is_err() {
        return Err(TensorError::InvalidSparse(format!(
            "a {}x{} matrix cannot be indexed with 32-bit offsets",
            rows, cols
        )));
    }
    Ok(())
}
