//! Cross-modal fusion
//!
//! Fuses two feature sequences (e.g. text tokens and image patches) by
//! letting each attend over the other through one shared attention module:
//!
//! ```text
//! out_a = Attention(A, B, B)
//! out_b = Attention(B, A, A)
//! ```
//!
//! Also provides a temporal variant that attends over a ring buffer of prior
//! hidden states, and a hierarchical variant that blends attention at several
//! granularities.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{ModalgenError, Result},
    layers::{AttentionConfig, AttentionMask, AttentionWeights, MultiHeadAttention},
    tensor::Tensor,
};

/// Weight and activation footprint of a fusion module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    /// Bytes of packed weights, biases, and layer-norm params
    pub weight_bytes: usize,
    /// Worst-case bytes of activations for one attention call
    pub activation_bytes: usize,
}

impl MemoryUsage {
    /// Sum of weight and activation bytes
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.weight_bytes + self.activation_bytes
    }
}

/// Bidirectional cross-modal attention with shared weights
#[derive(Debug, Clone)]
pub struct CrossModalFusion {
    attention: MultiHeadAttention,
}

impl CrossModalFusion {
    /// Wrap an attention module
    #[must_use]
    pub fn new(attention: MultiHeadAttention) -> Self {
        Self { attention }
    }

    /// Build the shared attention module from config and weights
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the weights disagree
    /// with it.
    pub fn from_parts(config: AttentionConfig, weights: AttentionWeights) -> Result<Self> {
        Ok(Self::new(MultiHeadAttention::new(config, weights)?))
    }

    /// Let `a` attend over `b` and `b` attend over `a`
    ///
    /// `mask`, if given, is `[len_a, len_b]` and applies to the A→B
    /// direction; its transpose is used for B→A. Returns `(out_a, out_b)`
    /// shaped like `a` and `b`.
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` if either input width is not the hidden
    /// dimension or the mask shape is wrong. If either direction fails the
    /// first error is returned and no output is produced.
    pub fn fuse_bidirectional(
        &self,
        a: &Tensor<f32>,
        b: &Tensor<f32>,
        mask: Option<&AttentionMask>,
    ) -> Result<(Tensor<f32>, Tensor<f32>)> {
        self.check_width("modality A features", a)?;
        self.check_width("modality B features", b)?;

        debug!(len_a = a.rows(), len_b = b.rows(), masked = mask.is_some(), "fusing A -> B");
        let out_a = self.attention.forward(a, b, mask)?;

        let transposed = mask.map(AttentionMask::transpose);
        debug!(len_a = a.rows(), len_b = b.rows(), "fusing B -> A");
        let out_b = self.attention.forward(b, a, transposed.as_ref())?;

        Ok((out_a, out_b))
    }

    /// Attend from `current` over prior context states followed by
    /// `modality` features
    ///
    /// The key/value sequence is `[context (oldest→newest); modality]`. The
    /// context is only read; updating it is the caller's job.
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` if any width differs from the hidden
    /// dimension.
    pub fn attend_temporal(
        &self,
        current: &Tensor<f32>,
        context: &TemporalContext,
        modality: &Tensor<f32>,
    ) -> Result<Tensor<f32>> {
        let hidden = self.attention.hidden_dim();
        self.check_width("current features", current)?;
        self.check_width("modality features", modality)?;
        if context.hidden_dim() != hidden {
            return Err(ModalgenError::mismatch(
                "temporal context width",
                hidden,
                context.hidden_dim(),
            ));
        }

        let mut memory = Vec::with_capacity((context.len() + modality.rows()) * hidden);
        for (_, state) in context.iter() {
            memory.extend_from_slice(state);
        }
        memory.extend_from_slice(modality.data());
        let kv_len = context.len() + modality.rows();
        let kv = Tensor::from_vec(vec![kv_len, hidden], memory)?;

        debug!(
            q_len = current.rows(),
            context_len = context.len(),
            modality_len = modality.rows(),
            "temporal attention"
        );
        self.attention.forward(current, &kv, None)
    }

    /// Attend at several granularities and blend the results
    ///
    /// Each level is a `(query, key)` pair; its output is
    /// `Attention(query, key, key)`. All queries must have the same length.
    /// Outputs are summed with `level_weights` normalized to sum to 1
    /// (uniform when `None`).
    ///
    /// # Errors
    ///
    /// - `InvalidDimension` if there are no levels or the weights are
    ///   negative, non-finite, or sum to zero
    /// - `DimensionMismatch` if the weight count, a width, or a query length
    ///   disagrees
    pub fn fuse_hierarchical(
        &self,
        levels: &[(Tensor<f32>, Tensor<f32>)],
        level_weights: Option<&[f32]>,
    ) -> Result<Tensor<f32>> {
        let Some((first_query, _)) = levels.first() else {
            return Err(ModalgenError::InvalidDimension {
                reason: "hierarchical fusion needs at least one level".to_string(),
            });
        };
        let weights = normalized_level_weights(levels.len(), level_weights)?;
        let q_len = first_query.rows();
        let hidden = self.attention.hidden_dim();

        let mut fused = vec![0.0f32; q_len * hidden];
        for (i, ((query, key), w)) in levels.iter().zip(&weights).enumerate() {
            if query.rows() != q_len {
                return Err(ModalgenError::mismatch(
                    format!("level {i} query length"),
                    q_len,
                    query.rows(),
                ));
            }
            self.check_width("level query", query)?;
            self.check_width("level key", key)?;

            debug!(level = i, k_len = key.rows(), weight = *w, "hierarchical level");
            let out = self.attention.forward(query, key, None)?;
            for (f, &o) in fused.iter_mut().zip(out.data()) {
                *f += w * o;
            }
        }

        Tensor::from_vec(vec![q_len, hidden], fused)
    }

    /// Weight and per-call activation bytes
    #[must_use]
    pub fn memory_usage(&self) -> MemoryUsage {
        MemoryUsage {
            weight_bytes: self.attention.weight_memory_bytes(),
            activation_bytes: self.attention.activation_memory_bytes(),
        }
    }

    /// The shared attention module
    #[must_use]
    pub fn attention(&self) -> &MultiHeadAttention {
        &self.attention
    }

    fn check_width(&self, what: &str, t: &Tensor<f32>) -> Result<()> {
        let hidden = self.attention.hidden_dim();
        if t.cols() != hidden {
            return Err(ModalgenError::mismatch(what, hidden, t.cols()));
        }
        Ok(())
    }
}

fn normalized_level_weights(count: usize, level_weights: Option<&[f32]>) -> Result<Vec<f32>> {
    let Some(weights) = level_weights else {
        return Ok(vec![1.0 / count as f32; count]);
    };
    if weights.len() != count {
        return Err(ModalgenError::mismatch("level weights", count, weights.len()));
    }
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(ModalgenError::InvalidDimension {
            reason: "level weights must be finite and non-negative".to_string(),
        });
    }
    let sum: f32 = weights.iter().sum();
    if sum <= 0.0 {
        return Err(ModalgenError::InvalidDimension {
            reason: "level weights must not all be zero".to_string(),
        });
    }
    Ok(weights.iter().map(|w| w / sum).collect())
}

/// Ring buffer of prior hidden states for temporal attention
///
/// Holds up to `max_length` states of width `hidden_dim`, each tagged with
/// the position it was produced at. Once full, each update overwrites the
/// oldest state.
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalContext {
    max_length: usize,
    hidden_dim: usize,
    states: Vec<f32>,
    positions: Vec<usize>,
    /// Slot the next update writes to
    next: usize,
    len: usize,
}

impl TemporalContext {
    /// Create an empty context
    ///
    /// # Errors
    ///
    /// Returns `InvalidDimension` if either size is zero.
    pub fn new(max_length: usize, hidden_dim: usize) -> Result<Self> {
        if max_length == 0 || hidden_dim == 0 {
            return Err(ModalgenError::InvalidDimension {
                reason: format!(
                    "temporal context needs max_length ({max_length}) and \
                     hidden_dim ({hidden_dim}) > 0"
                ),
            });
        }
        Ok(Self {
            max_length,
            hidden_dim,
            states: vec![0.0; max_length * hidden_dim],
            positions: vec![0; max_length],
            next: 0,
            len: 0,
        })
    }

    /// Record the hidden state produced at `position`
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` if `hidden.len() != hidden_dim`.
    pub fn update(&mut self, hidden: &[f32], position: usize) -> Result<()> {
        if hidden.len() != self.hidden_dim {
            return Err(ModalgenError::mismatch(
                "temporal state width",
                self.hidden_dim,
                hidden.len(),
            ));
        }
        let slot = self.next;
        self.states[slot * self.hidden_dim..(slot + 1) * self.hidden_dim].copy_from_slice(hidden);
        self.positions[slot] = position;
        self.next = (slot + 1) % self.max_length;
        self.len = (self.len + 1).min(self.max_length);
        Ok(())
    }

    /// `(position, state)` pairs from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = (usize, &[f32])> + '_ {
        let start = if self.len < self.max_length { 0 } else { self.next };
        (0..self.len).map(move |i| {
            let slot = (start + i) % self.max_length;
            (
                self.positions[slot],
                &self.states[slot * self.hidden_dim..(slot + 1) * self.hidden_dim],
            )
        })
    }

    /// Positions from oldest to newest
    #[must_use]
    pub fn positions(&self) -> Vec<usize> {
        self.iter().map(|(p, _)| p).collect()
    }

    /// Drop every stored state
    pub fn clear(&mut self) {
        self.next = 0;
        self.len = 0;
    }

    /// Number of stored states
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no state has been stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Capacity in states
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Width of each state
    #[must_use]
    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }
}

#[cfg(test)]
#[path = "fusion_tests.rs"]
mod tests;
