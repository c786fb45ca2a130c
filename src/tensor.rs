//! Tensor implementation
//!
//! This module provides the core `Tensor` type, an N-dimensional row-major
//! array, and [`MatrixView`], a strided, bounds-checked window over 2-D data.
//! Attention heads are column bands of a `[seq_len, hidden_dim]` matrix; the
//! view lets every per-head loop index by `(row, col)` instead of hand-computed
//! flat offsets.

use std::fmt;

use num_traits::Num;
use serde::{Deserialize, Serialize};

use crate::error::{ModalgenError, Result};

/// N-dimensional tensor stored in row-major order
///
/// # Examples
///
/// ```
/// use modalgen::Tensor;
///
/// // Create a 2×3 tensor
/// let t = Tensor::from_vec(vec![2, 3], vec![
///     1.0, 2.0, 3.0,
///     4.0, 5.0, 6.0,
/// ]).unwrap();
///
/// assert_eq!(t.shape(), &[2, 3]);
/// assert_eq!(t.ndim(), 2);
/// assert_eq!(t.size(), 6);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor<T: Num> {
    /// Flattened data in row-major order
    data: Vec<T>,
    /// Shape of the tensor
    shape: Vec<usize>,
}

impl<T: Num + Clone> Tensor<T> {
    /// Create a new tensor from a vector and shape
    ///
    /// # Arguments
    ///
    /// * `shape` - Dimensions of the tensor
    /// * `data` - Flattened data in row-major order
    ///
    /// # Errors
    ///
    /// Returns `Err` if:
    /// - Shape is empty
    /// - Data size doesn't match shape
    /// - Shape contains zero
    pub fn from_vec(shape: Vec<usize>, data: Vec<T>) -> Result<Self> {
        if shape.is_empty() {
            return Err(ModalgenError::InvalidShape {
                reason: "Shape cannot be empty".to_string(),
            });
        }

        if shape.contains(&0) {
            return Err(ModalgenError::InvalidShape {
                reason: "Shape dimensions cannot be zero".to_string(),
            });
        }

        let expected_size = shape.iter().product();

        if data.len() != expected_size {
            return Err(ModalgenError::DataShapeMismatch {
                data_size: data.len(),
                shape: shape.clone(),
                expected: expected_size,
            });
        }

        Ok(Self { data, shape })
    }

    /// Create a zero-filled tensor
    ///
    /// # Errors
    ///
    /// Returns `Err` if the shape is empty or contains zero
    pub fn zeros(shape: Vec<usize>) -> Result<Self> {
        let size = shape.iter().product();
        Self::from_vec(shape, vec![T::zero(); size])
    }

    /// Get the shape of the tensor
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the number of dimensions
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Get the total number of elements
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Get a reference to the underlying data
    #[must_use]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Consume the tensor and return its data
    #[must_use]
    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Number of rows when viewed as a matrix (all leading dims folded)
    #[must_use]
    pub fn rows(&self) -> usize {
        self.data.len() / self.cols()
    }

    /// Size of the last dimension
    #[must_use]
    pub fn cols(&self) -> usize {
        self.shape[self.shape.len() - 1]
    }
}

impl Tensor<f32> {
    /// Borrow the tensor as a `[rows, cols]` matrix view
    #[must_use]
    pub fn view(&self) -> MatrixView<'_> {
        MatrixView {
            data: &self.data,
            rows: self.rows(),
            cols: self.cols(),
            row_stride: self.cols(),
            col_offset: 0,
        }
    }
}

impl<T: Num + Clone + fmt::Display> fmt::Display for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape={:?}, data=[", self.shape)?;
        for (i, val) in self.data.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{val}")?;
        }
        write!(f, "])")
    }
}

/// Strided, read-only view over a row-major `f32` matrix
///
/// A view covers `rows × cols` elements starting at column `col_offset` of
/// every row; consecutive rows are `row_stride` elements apart. Construction
/// validates that the whole window lies inside the backing slice, so `row`
/// and `get` never read out of bounds.
#[derive(Debug, Clone, Copy)]
pub struct MatrixView<'a> {
    data: &'a [f32],
    rows: usize,
    cols: usize,
    row_stride: usize,
    col_offset: usize,
}

impl<'a> MatrixView<'a> {
    /// View a contiguous `[rows, cols]` slice
    ///
    /// # Errors
    ///
    /// Returns `InvalidDimension` when `cols` is zero and
    /// `DataShapeMismatch` when the slice length is not `rows * cols`.
    pub fn new(data: &'a [f32], rows: usize, cols: usize) -> Result<Self> {
        if cols == 0 {
            return Err(ModalgenError::InvalidDimension {
                reason: "matrix view needs at least one column".to_string(),
            });
        }
        if data.len() != rows * cols {
            return Err(ModalgenError::DataShapeMismatch {
                data_size: data.len(),
                shape: vec![rows, cols],
                expected: rows * cols,
            });
        }
        Ok(Self {
            data,
            rows,
            cols,
            row_stride: cols,
            col_offset: 0,
        })
    }

    /// Number of rows in the view
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns in the view
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Narrow the view to columns `[start, start + width)`
    ///
    /// Used to select one attention head out of a concatenated projection.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDimension` when the band is empty or exceeds the view.
    pub fn column_band(&self, start: usize, width: usize) -> Result<Self> {
        if width == 0 || start + width > self.cols {
            return Err(ModalgenError::InvalidDimension {
                reason: format!(
                    "column band [{start}, {}) outside view of width {}",
                    start + width,
                    self.cols
                ),
            });
        }
        Ok(Self {
            data: self.data,
            rows: self.rows,
            cols: width,
            row_stride: self.row_stride,
            col_offset: self.col_offset + start,
        })
    }

    /// Borrow one row of the view
    ///
    /// # Panics
    ///
    /// Panics if `row >= self.rows()`.
    #[must_use]
    pub fn row(&self, row: usize) -> &'a [f32] {
        assert!(row < self.rows, "row {row} out of bounds for {} rows", self.rows);
        let start = row * self.row_stride + self.col_offset;
        &self.data[start..start + self.cols]
    }

    /// Element at `(row, col)`, or `None` when out of bounds
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        self.data
            .get(row * self.row_stride + self.col_offset + col)
            .copied()
    }

    /// Iterate over the rows of the view
    pub fn iter_rows(&self) -> impl Iterator<Item = &'a [f32]> + '_ {
        (0..self.rows).map(move |r| self.row(r))
    }

    /// Copy the view into a contiguous row-major vector
    #[must_use]
    pub fn to_vec(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.rows * self.cols);
        for row in self.iter_rows() {
            out.extend_from_slice(row);
        }
        out
    }
}
