//! Boolean attention masks
//!
//! `mask[q][k] == true` means query `q` may attend to key `k`.

use serde::{Deserialize, Serialize};

use crate::error::{ModalgenError, Result};

/// `[rows, cols]` grid of allowed query/key pairs
///
/// `rows` is the query length and `cols` the key length. They need not be
/// equal (cross-attention). Once a mask is handed to an attention call it is
/// only ever borrowed immutably.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttentionMask {
    rows: usize,
    cols: usize,
    grid: Vec<bool>,
}

impl AttentionMask {
    /// Create an all-true mask
    ///
    /// # Errors
    ///
    /// Returns `InvalidDimension` if `rows` or `cols` is zero
    pub fn new(rows: usize, cols: usize) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(ModalgenError::InvalidDimension {
                reason: format!("attention mask must be non-empty, got {rows}x{cols}"),
            });
        }
        Ok(Self {
            rows,
            cols,
            grid: vec![true; rows * cols],
        })
    }

    /// Create an `n × n` causal mask
    ///
    /// # Errors
    ///
    /// Returns `InvalidDimension` if `n` is zero
    pub fn causal(n: usize) -> Result<Self> {
        let mut mask = Self::new(n, n)?;
        mask.set_causal();
        Ok(mask)
    }

    /// Make the mask lower-triangular: `mask[i][j] = (j <= i)`
    ///
    /// Applied verbatim over the grid, so on a non-square mask the diagonal
    /// starts at `(0, 0)`.
    pub fn set_causal(&mut self) -> &mut Self {
        for i in 0..self.rows {
            for j in 0..self.cols {
                self.grid[i * self.cols + j] = j <= i;
            }
        }
        self
    }

    /// Block the given key columns for every query
    ///
    /// # Errors
    ///
    /// Returns `InvalidDimension` if a position is not a valid column; the
    /// mask is left unchanged in that case.
    pub fn set_padding(&mut self, positions: &[usize]) -> Result<&mut Self> {
        if let Some(&bad) = positions.iter().find(|&&p| p >= self.cols) {
            return Err(ModalgenError::InvalidDimension {
                reason: format!("padding position {bad} outside {} key columns", self.cols),
            });
        }
        for i in 0..self.rows {
            for &j in positions {
                self.grid[i * self.cols + j] = false;
            }
        }
        Ok(self)
    }

    /// Set a single entry
    ///
    /// # Errors
    ///
    /// Returns `InvalidDimension` if the index is out of bounds
    pub fn set(&mut self, row: usize, col: usize, allowed: bool) -> Result<()> {
        self.check_index(row, col)?;
        self.grid[row * self.cols + col] = allowed;
        Ok(())
    }

    /// Whether query `row` may attend to key `col`
    ///
    /// # Errors
    ///
    /// Returns `InvalidDimension` if the index is out of bounds
    pub fn allows(&self, row: usize, col: usize) -> Result<bool> {
        self.check_index(row, col)?;
        Ok(self.grid[row * self.cols + col])
    }

    /// Borrow one query row of the grid
    ///
    /// # Panics
    ///
    /// Panics if `row >= self.rows()`.
    #[must_use]
    pub fn row(&self, row: usize) -> &[bool] {
        &self.grid[row * self.cols..(row + 1) * self.cols]
    }

    /// Swap the query and key axes
    #[must_use]
    pub fn transpose(&self) -> Self {
        let mut grid = vec![true; self.grid.len()];
        for i in 0..self.rows {
            for j in 0..self.cols {
                grid[j * self.rows + i] = self.grid[i * self.cols + j];
            }
        }
        Self {
            rows: self.cols,
            cols: self.rows,
            grid,
        }
    }

    /// Query length
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Key length
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Fail unless the mask covers exactly a `[rows, cols]` score grid
    pub(crate) fn check_shape(&self, rows: usize, cols: usize) -> Result<()> {
        if self.rows != rows {
            return Err(ModalgenError::mismatch("attention mask rows", rows, self.rows));
        }
        if self.cols != cols {
            return Err(ModalgenError::mismatch("attention mask cols", cols, self.cols));
        }
        Ok(())
    }

    fn check_index(&self, row: usize, col: usize) -> Result<()> {
        if row >= self.rows || col >= self.cols {
            return Err(ModalgenError::InvalidDimension {
                reason: format!(
                    "mask index ({row}, {col}) out of bounds for {}x{}",
                    self.rows, self.cols
                ),
            });
        }
        Ok(())
    }
}
