//! Multi-head scaled dot-product attention
//!
//! Contains:
//! - [`attend`]: the projection-free attention core
//! - [`AttentionConfig`]: head layout and optional post-processing
//! - [`AttentionWeights`]: quantized Q/K/V/O projections and layer-norm params
//! - [`MultiHeadAttention`]: projections + core + output projection,
//!   residual, and layer norm
//!
//! ```text
//! Attention(Q, K, V) = softmax(Q @ K.T / sqrt(d_k) + mask) @ V
//! ```
//!
//! # References
//!
//! "Attention is All You Need" - Vaswani et al., 2017

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{ModalgenError, Result},
    tensor::{MatrixView, Tensor},
};

use super::{
    softmax_in_place, AttentionMask, LayerNorm, QuantizedLinear, ScratchBuffers, ScratchPool,
};

/// Score written in place of a masked query/key pair
///
/// A finite sentinel rather than `-inf`: a fully masked row still softmaxes
/// to a uniform distribution instead of `NaN`.
pub const MASKED_SCORE: f32 = -1e9;

/// Head layout and post-processing switches for one attention module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    /// Number of attention heads
    pub num_heads: usize,
    /// Dimension of each head
    pub head_dim: usize,
    /// Longest query or key sequence one call may process
    pub max_sequence_length: usize,
    /// Apply a causal mask in [`MultiHeadAttention::forward_self`] when no
    /// mask is given
    pub causal_mask: bool,
    /// Apply layer normalization after the output projection
    pub use_layer_norm: bool,
    /// Add the query input back before layer normalization
    pub use_residual: bool,
    /// Variance epsilon for layer normalization
    pub layer_norm_eps: f32,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            num_heads: 4,
            head_dim: 64,
            max_sequence_length: 512,
            causal_mask: false,
            use_layer_norm: false,
            use_residual: false,
            layer_norm_eps: 1e-6,
        }
    }
}

impl AttentionConfig {
    /// Create a config with the given head layout and default switches
    #[must_use]
    pub fn new(num_heads: usize, head_dim: usize) -> Self {
        Self {
            num_heads,
            head_dim,
            ..Self::default()
        }
    }

    /// Set the maximum sequence length
    #[must_use]
    pub fn with_max_sequence_length(mut self, len: usize) -> Self {
        self.max_sequence_length = len;
        self
    }

    /// Enable or disable the default causal mask
    #[must_use]
    pub fn with_causal_mask(mut self, causal: bool) -> Self {
        self.causal_mask = causal;
        self
    }

    /// Enable or disable layer normalization
    #[must_use]
    pub fn with_layer_norm(mut self, enabled: bool) -> Self {
        self.use_layer_norm = enabled;
        self
    }

    /// Enable or disable the residual connection
    #[must_use]
    pub fn with_residual(mut self, enabled: bool) -> Self {
        self.use_residual = enabled;
        self
    }

    /// Set the layer norm epsilon
    #[must_use]
    pub fn with_layer_norm_eps(mut self, eps: f32) -> Self {
        self.layer_norm_eps = eps;
        self
    }

    /// Hidden dimension: `num_heads * head_dim`
    #[must_use]
    pub fn hidden_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Check that every field is usable
    ///
    /// # Errors
    ///
    /// Returns `InvalidDimension` for zero heads, head size, or sequence
    /// length, or a non-positive epsilon.
    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 || self.head_dim == 0 {
            return Err(ModalgenError::InvalidDimension {
                reason: format!(
                    "num_heads ({}) and head_dim ({}) must be > 0",
                    self.num_heads, self.head_dim
                ),
            });
        }
        if self.max_sequence_length == 0 {
            return Err(ModalgenError::InvalidDimension {
                reason: "max_sequence_length must be > 0".to_string(),
            });
        }
        if !(self.layer_norm_eps.is_finite() && self.layer_norm_eps > 0.0) {
            return Err(ModalgenError::InvalidDimension {
                reason: format!("layer_norm_eps must be > 0, got {}", self.layer_norm_eps),
            });
        }
        Ok(())
    }
}

/// Quantized projection weights for one attention module
///
/// All four projections are `[hidden_dim, hidden_dim]`. Weights are
/// immutable after construction and may be shared across threads.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionWeights {
    /// Query projection
    pub query: QuantizedLinear,
    /// Key projection
    pub key: QuantizedLinear,
    /// Value projection
    pub value: QuantizedLinear,
    /// Output projection
    pub output: QuantizedLinear,
    /// Layer-norm scale, `[hidden_dim]`
    pub layer_norm_gamma: Option<Vec<f32>>,
    /// Layer-norm shift, `[hidden_dim]`
    pub layer_norm_beta: Option<Vec<f32>>,
}

impl AttentionWeights {
    /// Bundle the four projections without layer-norm parameters
    #[must_use]
    pub fn new(
        query: QuantizedLinear,
        key: QuantizedLinear,
        value: QuantizedLinear,
        output: QuantizedLinear,
    ) -> Self {
        Self {
            query,
            key,
            value,
            output,
            layer_norm_gamma: None,
            layer_norm_beta: None,
        }
    }

    /// Attach loaded layer-norm gamma and beta
    #[must_use]
    pub fn with_layer_norm(mut self, gamma: Vec<f32>, beta: Vec<f32>) -> Self {
        self.layer_norm_gamma = Some(gamma);
        self.layer_norm_beta = Some(beta);
        self
    }

    /// Hidden dimension implied by the query projection
    #[must_use]
    pub fn hidden_dim(&self) -> usize {
        self.query.in_features()
    }

    /// Check every projection is `[hidden_dim, hidden_dim]`
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` naming the first projection that disagrees.
    pub fn validate(&self, hidden_dim: usize) -> Result<()> {
        for (name, proj) in [
            ("query", &self.query),
            ("key", &self.key),
            ("value", &self.value),
            ("output", &self.output),
        ] {
            if proj.in_features() != hidden_dim {
                return Err(ModalgenError::mismatch(
                    format!("{name} projection rows"),
                    hidden_dim,
                    proj.in_features(),
                ));
            }
            if proj.out_features() != hidden_dim {
                return Err(ModalgenError::mismatch(
                    format!("{name} projection cols"),
                    hidden_dim,
                    proj.out_features(),
                ));
            }
        }
        for (name, param) in [
            ("layer norm gamma", &self.layer_norm_gamma),
            ("layer norm beta", &self.layer_norm_beta),
        ] {
            if let Some(p) = param {
                if p.len() != hidden_dim {
                    return Err(ModalgenError::mismatch(name, hidden_dim, p.len()));
                }
            }
        }
        Ok(())
    }

    /// Bytes held by packed weights, biases, and layer-norm params
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        let ln = self.layer_norm_gamma.as_ref().map_or(0, Vec::len)
            + self.layer_norm_beta.as_ref().map_or(0, Vec::len);
        self.query.memory_bytes()
            + self.key.memory_bytes()
            + self.value.memory_bytes()
            + self.output.memory_bytes()
            + ln * std::mem::size_of::<f32>()
    }
}

/// Compute multi-head scaled dot-product attention
///
/// `query` is `[Q, D]`, `key` and `value` are `[K, D]`; `D` is split into
/// `num_heads` bands of `head_dim` columns. Where `mask[q][k]` is false the
/// score is replaced by [`MASKED_SCORE`]. Heads are computed in parallel;
/// each head runs the same sequential arithmetic it would run alone, so the
/// result does not depend on the thread count.
///
/// # Errors
///
/// - `InvalidDimension` if `num_heads`, `head_dim`, or `Q` is zero
/// - `EmptyAttentionContext` if `K` is zero
/// - `DimensionMismatch` if `num_heads * head_dim != D`, the key/value
///   shapes disagree, or the mask is not `[Q, K]`
pub fn attend(
    query: MatrixView<'_>,
    key: MatrixView<'_>,
    value: MatrixView<'_>,
    num_heads: usize,
    head_dim: usize,
    mask: Option<&AttentionMask>,
) -> Result<Tensor<f32>> {
    let mut scratch = ScratchBuffers::default();
    attend_with_scratch(query, key, value, num_heads, head_dim, mask, &mut scratch)
}

pub(crate) fn attend_with_scratch(
    query: MatrixView<'_>,
    key: MatrixView<'_>,
    value: MatrixView<'_>,
    num_heads: usize,
    head_dim: usize,
    mask: Option<&AttentionMask>,
    scratch: &mut ScratchBuffers,
) -> Result<Tensor<f32>> {
    if num_heads == 0 || head_dim == 0 {
        return Err(ModalgenError::InvalidDimension {
            reason: format!("num_heads ({num_heads}) and head_dim ({head_dim}) must be > 0"),
        });
    }
    let q_len = query.rows();
    let k_len = key.rows();
    let hidden = query.cols();
    if q_len == 0 {
        return Err(ModalgenError::InvalidDimension {
            reason: "query sequence length must be > 0".to_string(),
        });
    }
    if k_len == 0 {
        return Err(ModalgenError::EmptyAttentionContext);
    }
    if num_heads * head_dim != hidden {
        return Err(ModalgenError::mismatch(
            "num_heads * head_dim vs query width",
            hidden,
            num_heads * head_dim,
        ));
    }
    if key.cols() != hidden {
        return Err(ModalgenError::mismatch("key width", hidden, key.cols()));
    }
    if value.cols() != hidden {
        return Err(ModalgenError::mismatch("value width", hidden, value.cols()));
    }
    if value.rows() != k_len {
        return Err(ModalgenError::mismatch("value length", k_len, value.rows()));
    }
    if let Some(m) = mask {
        m.check_shape(q_len, k_len)?;
    }

    let heads = (0..num_heads)
        .map(|h| {
            let start = h * head_dim;
            Ok((
                query.column_band(start, head_dim)?,
                key.column_band(start, head_dim)?,
                value.column_band(start, head_dim)?,
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    #[allow(clippy::cast_precision_loss)]
    let scale = 1.0 / (head_dim as f32).sqrt();

    scratch.prepare(num_heads * q_len * k_len, num_heads * q_len * head_dim);
    let ScratchBuffers {
        scores,
        head_outputs,
    } = scratch;

    scores
        .par_chunks_mut(q_len * k_len)
        .zip(head_outputs.par_chunks_mut(q_len * head_dim))
        .zip(heads.par_iter())
        .for_each(|((head_scores, head_out), &(q_h, k_h, v_h))| {
            attend_head(q_h, k_h, v_h, scale, mask, head_scores, head_out);
        });

    // Merge heads back into [Q, D]
    let mut output = vec![0.0f32; q_len * hidden];
    for (h, head_out) in head_outputs.chunks(q_len * head_dim).enumerate() {
        for (q, src) in head_out.chunks(head_dim).enumerate() {
            let dst = q * hidden + h * head_dim;
            output[dst..dst + head_dim].copy_from_slice(src);
        }
    }

    debug_assert!(
        output.iter().all(|&x| x.is_finite()),
        "Attention produced NaN or Inf values - check input scaling"
    );

    Tensor::from_vec(vec![q_len, hidden], output)
}

/// One head: scores, mask, softmax, weighted sum
fn attend_head(
    query: MatrixView<'_>,
    key: MatrixView<'_>,
    value: MatrixView<'_>,
    scale: f32,
    mask: Option<&AttentionMask>,
    scores: &mut [f32],
    out: &mut [f32],
) {
    let k_len = key.rows();
    let head_dim = query.cols();

    for (q, (row_scores, out_row)) in scores
        .chunks_mut(k_len)
        .zip(out.chunks_mut(head_dim))
        .enumerate()
    {
        let q_row = query.row(q);
        let mask_row = mask.map(|m| m.row(q));

        for (k, score) in row_scores.iter_mut().enumerate() {
            let allowed = mask_row.map_or(true, |r| r[k]);
            *score = if allowed {
                dot(q_row, key.row(k)) * scale
            } else {
                MASKED_SCORE
            };
        }

        softmax_in_place(row_scores);

        out_row.fill(0.0);
        for (k, &weight) in row_scores.iter().enumerate() {
            for (o, &v) in out_row.iter_mut().zip(value.row(k)) {
                *o += weight * v;
            }
        }
    }
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Multi-head attention with quantized projections
///
/// Forward pass:
/// 1. Project query input with W_q and key/value inputs with W_k / W_v
/// 2. Run [`attend`] over `num_heads` heads
/// 3. Apply the output projection W_o
/// 4. Optionally add the query input (residual)
/// 5. Optionally apply layer normalization
///
/// The module holds no per-call state: scratch buffers come from an internal
/// pool, one set per in-flight call, so `&MultiHeadAttention` can be shared
/// across threads.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    config: AttentionConfig,
    weights: AttentionWeights,
    layer_norm: Option<LayerNorm>,
    scratch: ScratchPool,
}

impl MultiHeadAttention {
    /// Create an attention module
    ///
    /// When layer norm is enabled and the weights carry no gamma/beta, the
    /// identity affine transform (gamma = 1, beta = 0) is used.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the weights do not match
    /// `config.hidden_dim()`.
    pub fn new(config: AttentionConfig, weights: AttentionWeights) -> Result<Self> {
        config.validate()?;
        let hidden = config.hidden_dim();
        weights.validate(hidden)?;

        let layer_norm = if config.use_layer_norm {
            let gamma = weights
                .layer_norm_gamma
                .clone()
                .unwrap_or_else(|| vec![1.0; hidden]);
            let beta = weights
                .layer_norm_beta
                .clone()
                .unwrap_or_else(|| vec![0.0; hidden]);
            Some(LayerNorm::from_params(gamma, beta, config.layer_norm_eps)?)
        } else {
            None
        };

        Ok(Self {
            config,
            weights,
            layer_norm,
            scratch: ScratchPool::default(),
        })
    }

    /// Self-attention over `input`
    ///
    /// With `causal_mask` set and no explicit mask, each position only sees
    /// itself and earlier positions.
    ///
    /// # Errors
    ///
    /// See [`MultiHeadAttention::forward_qkv`].
    pub fn forward_self(
        &self,
        input: &Tensor<f32>,
        mask: Option<&AttentionMask>,
    ) -> Result<Tensor<f32>> {
        let default_mask;
        let mask = match mask {
            Some(m) => Some(m),
            None if self.config.causal_mask => {
                default_mask = AttentionMask::causal(input.rows())?;
                Some(&default_mask)
            },
            None => None,
        };
        self.forward_qkv(input, input, input, mask)
    }

    /// Attend from `query_input` over `key_value_input`
    ///
    /// Cross-attention: only `mask` is applied, never the default causal
    /// mask, whatever the sequence lengths.
    ///
    /// # Errors
    ///
    /// See [`MultiHeadAttention::forward_qkv`].
    pub fn forward(
        &self,
        query_input: &Tensor<f32>,
        key_value_input: &Tensor<f32>,
        mask: Option<&AttentionMask>,
    ) -> Result<Tensor<f32>> {
        self.forward_qkv(query_input, key_value_input, key_value_input, mask)
    }

    /// Attend with separate key and value inputs
    ///
    /// # Errors
    ///
    /// - `ResourceExhausted` if either sequence exceeds `max_sequence_length`
    /// - `DimensionMismatch` if an input width is not `hidden_dim`, the key
    ///   and value lengths differ, or the mask shape is wrong
    pub fn forward_qkv(
        &self,
        query_input: &Tensor<f32>,
        key_input: &Tensor<f32>,
        value_input: &Tensor<f32>,
        mask: Option<&AttentionMask>,
    ) -> Result<Tensor<f32>> {
        let q_len = query_input.rows();
        let k_len = key_input.rows();
        let limit = self.config.max_sequence_length;
        for len in [q_len, k_len] {
            if len > limit {
                return Err(ModalgenError::ResourceExhausted {
                    resource: "attention sequence length".to_string(),
                    requested: len,
                    limit,
                });
            }
        }

        debug!(
            q_len,
            k_len,
            num_heads = self.config.num_heads,
            head_dim = self.config.head_dim,
            masked = mask.is_some(),
            "multi-head attention forward"
        );

        let q = self.weights.query.forward(query_input)?;
        let k = self.weights.key.forward(key_input)?;
        let v = self.weights.value.forward(value_input)?;

        let context = {
            let mut scratch = self.scratch.checkout();
            attend_with_scratch(
                q.view(),
                k.view(),
                v.view(),
                self.config.num_heads,
                self.config.head_dim,
                mask,
                &mut scratch,
            )?
        };

        let projected = self.weights.output.forward(&context)?;
        let mut out = projected.into_data();

        if self.config.use_residual {
            for (o, &x) in out.iter_mut().zip(query_input.data()) {
                *o += x;
            }
        }

        if let Some(ln) = &self.layer_norm {
            for row in out.chunks_mut(self.config.hidden_dim()) {
                ln.normalize_row(row);
            }
        }

        Tensor::from_vec(vec![q_len, self.config.hidden_dim()], out)
    }

    /// Attention configuration
    #[must_use]
    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    /// Projection weights
    #[must_use]
    pub fn weights(&self) -> &AttentionWeights {
        &self.weights
    }

    /// Number of heads
    #[must_use]
    pub fn num_heads(&self) -> usize {
        self.config.num_heads
    }

    /// Dimension of each head
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.config.head_dim
    }

    /// Hidden dimension
    #[must_use]
    pub fn hidden_dim(&self) -> usize {
        self.config.hidden_dim()
    }

    /// Bytes of weights held by this module
    #[must_use]
    pub fn weight_memory_bytes(&self) -> usize {
        self.weights.memory_bytes()
    }

    /// Worst-case bytes of activations for one call at `max_sequence_length`
    ///
    /// Three projections of `[max_len, hidden]` plus the score grid and the
    /// per-head outputs.
    #[must_use]
    pub fn activation_memory_bytes(&self) -> usize {
        let n = self.config.max_sequence_length;
        let hidden = self.config.hidden_dim();
        let floats = 3 * n * hidden + self.config.num_heads * n * n + n * hidden;
        floats * std::mem::size_of::<f32>()
    }

    /// Idle scratch buffer sets in this module's pool
    #[must_use]
    pub fn idle_scratch_sets(&self) -> usize {
        self.scratch.available()
    }
}
