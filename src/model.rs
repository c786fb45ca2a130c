//! Attention-stack language model
//!
//! A minimal decoder built only from the pieces in [`crate::layers`]:
//!
//! ```text
//! tokens → embedding rows → N × causal self-attention → LM head → logits
//! ```
//!
//! All weights are quantized. The model is immutable after construction and
//! `Send + Sync`, so one instance can serve concurrent generations.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{ModalgenError, Result},
    generate::GenerativeModel,
    layers::{AttentionConfig, AttentionMask, AttentionWeights, MultiHeadAttention, QuantizedLinear},
    quantize::QuantizedMatrix,
    tensor::Tensor,
};

/// Shape of an [`AttentionStack`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size
    pub vocab_size: usize,
    /// Number of attention layers
    pub num_layers: usize,
    /// Per-layer attention config; its `max_sequence_length` is the context
    /// window
    pub attention: AttentionConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 256,
            num_layers: 2,
            attention: AttentionConfig::default(),
        }
    }
}

impl ModelConfig {
    /// Create a config
    #[must_use]
    pub fn new(vocab_size: usize, num_layers: usize, attention: AttentionConfig) -> Self {
        Self {
            vocab_size,
            num_layers,
            attention,
        }
    }

    /// Hidden dimension
    #[must_use]
    pub fn hidden_dim(&self) -> usize {
        self.attention.hidden_dim()
    }

    /// Load a config from JSON and validate it
    ///
    /// # Errors
    ///
    /// Returns `InvalidDimension` if the JSON is malformed or the config is
    /// invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| ModalgenError::InvalidDimension {
            reason: format!("invalid model config JSON: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field is usable
    ///
    /// # Errors
    ///
    /// Returns `InvalidDimension` for an empty vocabulary or no layers, or
    /// the attention config's own error.
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(ModalgenError::InvalidDimension {
                reason: "vocab_size must be > 0".to_string(),
            });
        }
        if self.num_layers == 0 {
            return Err(ModalgenError::InvalidDimension {
                reason: "num_layers must be > 0".to_string(),
            });
        }
        self.attention.validate()
    }
}

/// Decoder made of causal self-attention layers over quantized weights
#[derive(Debug, Clone)]
pub struct AttentionStack {
    config: ModelConfig,
    /// `[vocab_size, hidden_dim]`
    embedding: QuantizedMatrix,
    layers: Vec<MultiHeadAttention>,
    /// `[hidden_dim, vocab_size]`
    lm_head: QuantizedLinear,
}

impl AttentionStack {
    /// Assemble a model from decoded weights
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or any weight shape
    /// disagrees with it.
    pub fn new(
        config: ModelConfig,
        embedding: QuantizedMatrix,
        layer_weights: Vec<AttentionWeights>,
        lm_head: QuantizedLinear,
    ) -> Result<Self> {
        config.validate()?;
        let hidden = config.hidden_dim();

        if embedding.rows() != config.vocab_size {
            return Err(ModalgenError::mismatch(
                "embedding rows",
                config.vocab_size,
                embedding.rows(),
            ));
        }
        if embedding.cols() != hidden {
            return Err(ModalgenError::mismatch("embedding cols", hidden, embedding.cols()));
        }
        if layer_weights.len() != config.num_layers {
            return Err(ModalgenError::mismatch(
                "attention layers",
                config.num_layers,
                layer_weights.len(),
            ));
        }
        if lm_head.in_features() != hidden {
            return Err(ModalgenError::mismatch("lm head rows", hidden, lm_head.in_features()));
        }
        if lm_head.out_features() != config.vocab_size {
            return Err(ModalgenError::mismatch(
                "lm head cols",
                config.vocab_size,
                lm_head.out_features(),
            ));
        }

        let layers = layer_weights
            .into_iter()
            .map(|w| MultiHeadAttention::new(config.attention.clone(), w))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            embedding,
            layers,
            lm_head,
        })
    }

    /// Hidden states after the last layer, `[seq_len, hidden_dim]`
    ///
    /// # Errors
    ///
    /// - `InvalidDimension` for an empty sequence or an id outside the
    ///   vocabulary
    /// - `ResourceExhausted` if the sequence exceeds the context window
    pub fn hidden_states(&self, tokens: &[u32]) -> Result<Tensor<f32>> {
        if tokens.is_empty() {
            return Err(ModalgenError::InvalidDimension {
                reason: "token sequence must be non-empty".to_string(),
            });
        }
        let limit = self.context_length();
        if tokens.len() > limit {
            return Err(ModalgenError::ResourceExhausted {
                resource: "model context window".to_string(),
                requested: tokens.len(),
                limit,
            });
        }

        let hidden = self.config.hidden_dim();
        let mut x = Vec::with_capacity(tokens.len() * hidden);
        for &t in tokens {
            let id = t as usize;
            if id >= self.config.vocab_size {
                return Err(ModalgenError::InvalidDimension {
                    reason: format!(
                        "token id {t} outside vocabulary of {}",
                        self.config.vocab_size
                    ),
                });
            }
            x.extend(self.embedding.dequantize_row(id)?);
        }
        let mut x = Tensor::from_vec(vec![tokens.len(), hidden], x)?;

        let mask = AttentionMask::causal(tokens.len())?;
        for layer in &self.layers {
            x = layer.forward_self(&x, Some(&mask))?;
        }
        Ok(x)
    }

    /// Model configuration
    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Attention layers
    #[must_use]
    pub fn layers(&self) -> &[MultiHeadAttention] {
        &self.layers
    }

    /// Bytes of all weights
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.embedding.memory_bytes()
            + self.lm_head.memory_bytes()
            + self
                .layers
                .iter()
                .map(MultiHeadAttention::weight_memory_bytes)
                .sum::<usize>()
    }
}

impl GenerativeModel for AttentionStack {
    fn forward(&self, tokens: &[u32]) -> Result<Vec<f32>> {
        let states = self.hidden_states(tokens)?;
        let hidden = self.config.hidden_dim();
        let last = &states.data()[(tokens.len() - 1) * hidden..];
        debug!(seq_len = tokens.len(), "lm head over last position");

        let last = Tensor::from_vec(vec![1, hidden], last.to_vec())?;
        Ok(self.lm_head.forward(&last)?.into_data())
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn context_length(&self) -> usize {
        self.config.attention.max_sequence_length
    }
}

#[cfg(test)]
#[path = "model_tests.rs"]
mod tests;
