//! Neural network layers for the attention stack
//!
//! Implements the building blocks the attention core is assembled from:
//! - Numerically stable softmax
//! - Layer normalization
//! - Quantized linear projection
//! - Attention masks (causal, padding)
//! - Multi-head scaled dot-product attention with per-call scratch buffers
//!
//! ## Example
//!
//! ```rust,ignore
//! use modalgen::layers::{AttentionConfig, MultiHeadAttention};
//!
//! let config = AttentionConfig::new(4, 16).with_causal_mask(true);
//! let attention = MultiHeadAttention::new(config, weights)?;
//! let output = attention.forward_self(&input, None)?;
//! ```

use tracing::trace;

use crate::{
    error::{ModalgenError, Result},
    quantize::QuantizedMatrix,
    tensor::Tensor,
};

mod attention;
pub use attention::{
    attend, AttentionConfig, AttentionWeights, MultiHeadAttention, MASKED_SCORE,
};
mod mask;
pub use mask::AttentionMask;
mod scratch;
pub use scratch::{ScratchBuffers, ScratchGuard, ScratchPool};

/// Apply softmax activation function
///
/// Softmax: `y[i] = exp(x[i]) / sum(exp(x[j]))` for all j
///
/// Applies softmax normalization along the last dimension. Uses numerically stable
/// implementation with max subtraction to prevent overflow.
///
/// # Errors
///
/// Returns error if input is empty
pub fn softmax(input: &Tensor<f32>) -> Result<Tensor<f32>> {
    let data = input.data();
    if data.is_empty() {
        return Err(ModalgenError::InvalidShape {
            reason: "Cannot apply softmax to empty tensor".to_string(),
        });
    }

    let last_dim = input.cols();
    let mut output = data.to_vec();
    for group in output.chunks_mut(last_dim) {
        softmax_in_place(group);
    }

    Tensor::from_vec(input.shape().to_vec(), output)
}

/// Softmax over one row, in place
///
/// The row max is subtracted before exponentiating. An empty row is left
/// untouched.
pub fn softmax_in_place(row: &mut [f32]) {
    if row.is_empty() {
        return;
    }

    let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);

    let mut sum_exp = 0.0;
    for x in row.iter_mut() {
        *x = (*x - max_val).exp();
        sum_exp += *x;
    }

    // sum_exp >= 1 because the max element contributes exp(0)
    let inv = 1.0 / sum_exp;
    for x in row.iter_mut() {
        *x *= inv;
    }
}

/// Layer normalization
///
/// Normalizes activations across the feature dimension using:
/// ```text
/// y = (x - mean(x)) / sqrt(variance(x) + eps) * gamma + beta
/// ```
///
/// # References
///
/// Layer Normalization: <https://arxiv.org/abs/1607.06450>
#[derive(Debug, Clone, PartialEq)]
pub struct LayerNorm {
    /// Normalized shape (feature dimension)
    normalized_shape: usize,
    /// Epsilon for numerical stability
    eps: f32,
    /// Scale parameter (gamma)
    weight: Vec<f32>,
    /// Shift parameter (beta)
    bias: Vec<f32>,
}

impl LayerNorm {
    /// Create a layer norm with gamma = 1 and beta = 0
    ///
    /// # Errors
    ///
    /// Returns error if `normalized_shape` is zero
    pub fn new(normalized_shape: usize, eps: f32) -> Result<Self> {
        if normalized_shape == 0 {
            return Err(ModalgenError::InvalidDimension {
                reason: "normalized_shape must be > 0".to_string(),
            });
        }

        Ok(Self {
            normalized_shape,
            eps,
            weight: vec![1.0; normalized_shape],
            bias: vec![0.0; normalized_shape],
        })
    }

    /// Create a layer norm with loaded gamma and beta
    ///
    /// # Errors
    ///
    /// Returns error if gamma is empty or gamma and beta differ in length
    pub fn from_params(gamma: Vec<f32>, beta: Vec<f32>, eps: f32) -> Result<Self> {
        if gamma.is_empty() {
            return Err(ModalgenError::InvalidDimension {
                reason: "layer norm gamma must be non-empty".to_string(),
            });
        }
        if gamma.len() != beta.len() {
            return Err(ModalgenError::mismatch(
                "layer norm beta",
                gamma.len(),
                beta.len(),
            ));
        }
        Ok(Self {
            normalized_shape: gamma.len(),
            eps,
            weight: gamma,
            bias: beta,
        })
    }

    /// Forward pass through layer normalization
    ///
    /// # Errors
    ///
    /// Returns error if the last dimension doesn't match `normalized_shape`
    pub fn forward(&self, input: &Tensor<f32>) -> Result<Tensor<f32>> {
        let last_dim = input.cols();
        if last_dim != self.normalized_shape {
            return Err(ModalgenError::mismatch(
                "layer norm input",
                self.normalized_shape,
                last_dim,
            ));
        }

        let mut output = input.data().to_vec();
        for group in output.chunks_mut(self.normalized_shape) {
            self.normalize_row(group);
        }

        debug_assert!(
            output.iter().all(|&x| x.is_finite()),
            "LayerNorm produced NaN or Inf values - check input distribution"
        );

        Tensor::from_vec(input.shape().to_vec(), output)
    }

    /// Normalize one row in place
    pub(crate) fn normalize_row(&self, row: &mut [f32]) {
        #[allow(clippy::cast_precision_loss)]
        let n = self.normalized_shape as f32;
        let mean: f32 = row.iter().sum::<f32>() / n;
        let variance: f32 = row
            .iter()
            .map(|&x| {
                let diff = x - mean;
                diff * diff
            })
            .sum::<f32>()
            / n;
        let inv_std = 1.0 / (variance + self.eps).sqrt();

        for (i, x) in row.iter_mut().enumerate() {
            *x = (*x - mean) * inv_std * self.weight[i] + self.bias[i];
        }
    }

    /// Get the normalized shape
    #[must_use]
    pub fn normalized_shape(&self) -> usize {
        self.normalized_shape
    }

    /// Get epsilon value
    #[must_use]
    pub fn eps(&self) -> f32 {
        self.eps
    }
}

/// Linear projection with quantized weights
///
/// Applies `y = x * dequant(W) + b` where `W` is `[in_features, out_features]`.
/// The weight matrix is dequantized once per forward call and dropped when
/// the call returns.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedLinear {
    /// Weight matrix `[in_features, out_features]`
    weight: QuantizedMatrix,
    /// Bias vector `[out_features]`
    bias: Vec<f32>,
}

impl QuantizedLinear {
    /// Create a projection from a quantized weight matrix and bias
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` if `bias.len() != weight.cols()`
    pub fn new(weight: QuantizedMatrix, bias: Vec<f32>) -> Result<Self> {
        if bias.len() != weight.cols() {
            return Err(ModalgenError::mismatch(
                "linear bias",
                weight.cols(),
                bias.len(),
            ));
        }
        Ok(Self { weight, bias })
    }

    /// Create a projection with a zero bias
    #[must_use]
    pub fn without_bias(weight: QuantizedMatrix) -> Self {
        let bias = vec![0.0; weight.cols()];
        Self { weight, bias }
    }

    /// Project `[seq_len, in_features]` to `[seq_len, out_features]`
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` when the input width differs from
    /// `in_features`.
    pub fn forward(&self, input: &Tensor<f32>) -> Result<Tensor<f32>> {
        let in_features = self.in_features();
        let out_features = self.out_features();
        if input.cols() != in_features {
            return Err(ModalgenError::mismatch(
                "linear projection input",
                in_features,
                input.cols(),
            ));
        }

        let weight = self.weight.dequantize()?;
        let w = weight.data();
        let seq_len = input.rows();
        trace!(seq_len, in_features, out_features, "quantized linear");

        let mut output = Vec::with_capacity(seq_len * out_features);
        for row in input.data().chunks(in_features) {
            let mut acc = self.bias.clone();
            for (k, &x) in row.iter().enumerate() {
                let w_row = &w[k * out_features..(k + 1) * out_features];
                for (a, &wv) in acc.iter_mut().zip(w_row) {
                    *a += x * wv;
                }
            }
            output.extend_from_slice(&acc);
        }

        Tensor::from_vec(vec![seq_len, out_features], output)
    }

    /// Input feature count (weight rows)
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.weight.rows()
    }

    /// Output feature count (weight columns)
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.weight.cols()
    }

    /// The quantized weight matrix
    #[must_use]
    pub fn weight(&self) -> &QuantizedMatrix {
        &self.weight
    }

    /// The bias vector
    #[must_use]
    pub fn bias(&self) -> &[f32] {
        &self.bias
    }

    /// Packed weight bytes plus `f32` bias bytes
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.weight.memory_bytes() + self.bias.len() * std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests;
