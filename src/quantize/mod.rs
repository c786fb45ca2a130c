//! Low-bit weight quantization with scale and zero-point
//!
//! Weights are stored as unsigned integer levels packed into bytes:
//! - `Four`: 2 levels per byte, level range `0..=15`
//! - `Eight`: 1 level per byte, level range `0..=255`
//!
//! ## Dequantization
//!
//! ```text
//! value[i][j] = (level(i, j) - zero_point) * scale
//! ```
//!
//! ## 4-bit Layout
//!
//! Element `n = i * cols + j` is stored in byte `n / 2`. Even elements use the
//! high nibble, odd elements the low nibble. When `rows * cols` is odd the
//! final low nibble is padding and must be zero. Unpacking depends only on the
//! flat element index, never on the row stride, so any `rows × cols` split of
//! the same bytes yields the same sequence of levels.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{ModalgenError, Result};
use crate::tensor::Tensor;

/// Rows per rayon task when dequantizing a full matrix
const DEQUANT_ROW_CHUNK: usize = 16;

/// Supported quantization bit widths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitWidth {
    /// 4-bit levels, two per byte
    Four,
    /// 8-bit levels, one per byte
    Eight,
}

impl BitWidth {
    /// Number of bits per level
    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            Self::Four => 4,
            Self::Eight => 8,
        }
    }

    /// Largest representable level
    #[must_use]
    pub fn max_level(self) -> u8 {
        match self {
            Self::Four => 15,
            Self::Eight => 255,
        }
    }

    /// Number of bytes needed to pack `count` levels: `ceil(count * bits / 8)`
    #[must_use]
    pub fn packed_len(self, count: usize) -> usize {
        (count * usize::from(self.bits())).div_ceil(8)
    }
}

impl TryFrom<u8> for BitWidth {
    type Error = ModalgenError;

    fn try_from(bits: u8) -> Result<Self> {
        match bits {
            4 => Ok(Self::Four),
            8 => Ok(Self::Eight),
            other => Err(ModalgenError::InvalidQuantization {
                reason: format!("unsupported bit width {other}; expected 4 or 8"),
            }),
        }
    }
}

/// Immutable quantized weight matrix
///
/// Construction validates every invariant, so a `QuantizedMatrix` in hand is
/// always safe to dequantize.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedMatrix {
    rows: usize,
    cols: usize,
    bit_width: BitWidth,
    data: Vec<u8>,
    scale: f32,
    zero_point: f32,
}

impl QuantizedMatrix {
    /// Wrap already-packed levels
    ///
    /// # Errors
    ///
    /// - `InvalidDimension` if `rows` or `cols` is zero
    /// - `InvalidQuantization` if `scale` is not a positive finite number,
    ///   `zero_point` is not finite, `data` has the wrong length, or the
    ///   4-bit padding nibble is non-zero
    pub fn new(
        rows: usize,
        cols: usize,
        bit_width: BitWidth,
        data: Vec<u8>,
        scale: f32,
        zero_point: f32,
    ) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(ModalgenError::InvalidDimension {
                reason: format!("quantized matrix must be non-empty, got {rows}x{cols}"),
            });
        }
        validate_params(scale, zero_point)?;

        let count = rows * cols;
        let expected = bit_width.packed_len(count);
        if data.len() != expected {
            return Err(ModalgenError::InvalidQuantization {
                reason: format!(
                    "{rows}x{cols} at {} bits needs {expected} packed bytes, got {}",
                    bit_width.bits(),
                    data.len()
                ),
            });
        }
        if bit_width == BitWidth::Four && count % 2 == 1 && data[expected - 1] & 0x0F != 0 {
            return Err(ModalgenError::InvalidQuantization {
                reason: "4-bit padding nibble must be zero".to_string(),
            });
        }

        trace!(rows, cols, bits = bit_width.bits(), scale, zero_point, "quantized matrix");

        Ok(Self {
            rows,
            cols,
            bit_width,
            data,
            scale,
            zero_point,
        })
    }

    /// Wrap packed levels with a raw bit width read from a model header
    ///
    /// # Errors
    ///
    /// Returns `InvalidQuantization` for bit widths other than 4 and 8, plus
    /// every error of [`QuantizedMatrix::new`].
    pub fn from_raw(
        rows: usize,
        cols: usize,
        bits: u8,
        data: Vec<u8>,
        scale: f32,
        zero_point: f32,
    ) -> Result<Self> {
        Self::new(rows, cols, BitWidth::try_from(bits)?, data, scale, zero_point)
    }

    /// Quantize `values` with min/max calibration
    ///
    /// The calibrated range always contains zero so that zero weights (and
    /// zero biases folded into weights) are exact.
    ///
    /// # Errors
    ///
    /// Returns `DataShapeMismatch` if `values.len() != rows * cols`, or an
    /// error from [`QuantizedMatrix::new`].
    pub fn quantize(values: &[f32], rows: usize, cols: usize, bit_width: BitWidth) -> Result<Self> {
        let (min, max) = values
            .iter()
            .copied()
            .fold((0.0f32, 0.0f32), |(lo, hi), v| (lo.min(v), hi.max(v)));
        let range = max - min;
        let scale = if range > f32::EPSILON {
            range / f32::from(bit_width.max_level())
        } else {
            1.0
        };
        let zero_point = (-min / scale)
            .round()
            .clamp(0.0, f32::from(bit_width.max_level()));
        Self::quantize_with_params(values, rows, cols, bit_width, scale, zero_point)
    }

    /// Quantize `values` at a fixed scale and zero-point
    ///
    /// `level = clamp(round(value / scale + zero_point), 0, max_level)`.
    /// Re-quantizing the output of [`QuantizedMatrix::dequantize`] with the
    /// same parameters reproduces the original packed bytes.
    ///
    /// # Errors
    ///
    /// Returns `DataShapeMismatch` if `values.len() != rows * cols`, or an
    /// error from [`QuantizedMatrix::new`].
    pub fn quantize_with_params(
        values: &[f32],
        rows: usize,
        cols: usize,
        bit_width: BitWidth,
        scale: f32,
        zero_point: f32,
    ) -> Result<Self> {
        if values.len() != rows * cols {
            return Err(ModalgenError::DataShapeMismatch {
                data_size: values.len(),
                shape: vec![rows, cols],
                expected: rows * cols,
            });
        }
        validate_params(scale, zero_point)?;

        let max_level = f32::from(bit_width.max_level());
        let levels: Vec<u8> = values
            .iter()
            .map(|&v| (v / scale + zero_point).round().clamp(0.0, max_level) as u8)
            .collect();

        Self::new(rows, cols, bit_width, pack_levels(&levels, bit_width), scale, zero_point)
    }

    /// Number of rows
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Quantization bit width
    #[must_use]
    pub fn bit_width(&self) -> BitWidth {
        self.bit_width
    }

    /// Packed level bytes
    #[must_use]
    pub fn packed_data(&self) -> &[u8] {
        &self.data
    }

    /// Dequantization scale
    #[must_use]
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Dequantization zero-point
    #[must_use]
    pub fn zero_point(&self) -> f32 {
        self.zero_point
    }

    /// Size of the packed weights in bytes
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.data.len()
    }

    /// Raw level at `(row, col)`
    ///
    /// # Errors
    ///
    /// Returns `InvalidDimension` if the index is out of bounds.
    pub fn level(&self, row: usize, col: usize) -> Result<u8> {
        if row >= self.rows || col >= self.cols {
            return Err(ModalgenError::InvalidDimension {
                reason: format!(
                    "index ({row}, {col}) out of bounds for {}x{} matrix",
                    self.rows, self.cols
                ),
            });
        }
        Ok(self.level_at(row * self.cols + col))
    }

    /// Dequantized value at `(row, col)`
    ///
    /// # Errors
    ///
    /// Returns `InvalidDimension` if the index is out of bounds.
    pub fn get(&self, row: usize, col: usize) -> Result<f32> {
        Ok(self.decode(self.level(row, col)?))
    }

    /// Dequantize a single row
    ///
    /// # Errors
    ///
    /// Returns `InvalidDimension` if `row` is out of bounds.
    pub fn dequantize_row(&self, row: usize) -> Result<Vec<f32>> {
        if row >= self.rows {
            return Err(ModalgenError::InvalidDimension {
                reason: format!("row {row} out of bounds for {} rows", self.rows),
            });
        }
        let mut out = vec![0.0; self.cols];
        self.dequantize_row_into(row, &mut out);
        Ok(out)
    }

    /// Dequantize the whole matrix into a `[rows, cols]` tensor
    ///
    /// Rows are decoded in parallel; each element is computed independently,
    /// so the result is identical to a sequential decode.
    ///
    /// # Errors
    ///
    /// Infallible for a validated matrix; the `Result` carries tensor
    /// construction errors.
    pub fn dequantize(&self) -> Result<Tensor<f32>> {
        let mut out = vec![0.0f32; self.rows * self.cols];
        out.par_chunks_mut(self.cols * DEQUANT_ROW_CHUNK)
            .enumerate()
            .for_each(|(chunk_idx, chunk)| {
                for (r, row_out) in chunk.chunks_mut(self.cols).enumerate() {
                    self.dequantize_row_into(chunk_idx * DEQUANT_ROW_CHUNK + r, row_out);
                }
            });
        Tensor::from_vec(vec![self.rows, self.cols], out)
    }

    fn dequantize_row_into(&self, row: usize, out: &mut [f32]) {
        let base = row * self.cols;
        for (j, slot) in out.iter_mut().enumerate() {
            *slot = self.decode(self.level_at(base + j));
        }
    }

    #[inline]
    fn level_at(&self, flat: usize) -> u8 {
        match self.bit_width {
            BitWidth::Eight => self.data[flat],
            BitWidth::Four => {
                let byte = self.data[flat / 2];
                if flat % 2 == 0 {
                    byte >> 4
                } else {
                    byte & 0x0F
                }
            },
        }
    }

    #[inline]
    fn decode(&self, level: u8) -> f32 {
        (f32::from(level) - self.zero_point) * self.scale
    }
}

/// Pack unsigned levels into bytes at the given bit width
///
/// Levels above the width's maximum are masked to the low bits.
#[must_use]
pub fn pack_levels(levels: &[u8], bit_width: BitWidth) -> Vec<u8> {
    match bit_width {
        BitWidth::Eight => levels.to_vec(),
        BitWidth::Four => levels
            .chunks(2)
            .map(|pair| {
                let hi = pair[0] & 0x0F;
                let lo = pair.get(1).map_or(0, |v| v & 0x0F);
                (hi << 4) | lo
            })
            .collect(),
    }
}

/// Unpack `count` levels from packed bytes
///
/// # Errors
///
/// Returns `InvalidQuantization` if `data` is shorter than `count` levels need.
pub fn unpack_levels(data: &[u8], count: usize, bit_width: BitWidth) -> Result<Vec<u8>> {
    let needed = bit_width.packed_len(count);
    if data.len() < needed {
        return Err(ModalgenError::InvalidQuantization {
            reason: format!("{count} levels need {needed} bytes, got {}", data.len()),
        });
    }
    Ok(match bit_width {
        BitWidth::Eight => data[..count].to_vec(),
        BitWidth::Four => (0..count)
            .map(|n| {
                let byte = data[n / 2];
                if n % 2 == 0 {
                    byte >> 4
                } else {
                    byte & 0x0F
                }
            })
            .collect(),
    })
}

fn validate_params(scale: f32, zero_point: f32) -> Result<()> {
    if !(scale.is_finite() && scale > 0.0) {
        return Err(ModalgenError::InvalidQuantization {
            reason: format!("scale must be positive and finite, got {scale}"),
        });
    }
    if !zero_point.is_finite() {
        return Err(ModalgenError::InvalidQuantization {
            reason: format!("zero_point must be finite, got {zero_point}"),
        });
    }
    Ok(())
}
