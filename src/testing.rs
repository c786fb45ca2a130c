//! Deterministic fixtures for tests and benches
//!
//! Weight and activation generators that need no RNG crate: every value is a
//! pure function of the seed, so fixtures are identical across runs and
//! platforms.
//!
//! ```rust
//! use modalgen::testing::SyntheticWeightGenerator;
//!
//! let gen = SyntheticWeightGenerator::new(42);
//! let values = gen.generate_f32(64);
//! assert_eq!(values.len(), 64);
//! assert_eq!(values, SyntheticWeightGenerator::new(42).generate_f32(64));
//! ```

use crate::{
    error::Result,
    layers::{AttentionConfig, AttentionWeights, MultiHeadAttention, QuantizedLinear},
    model::{AttentionStack, ModelConfig},
    quantize::{BitWidth, QuantizedMatrix},
};

/// Seeded generator for synthetic activations and weights
#[derive(Debug, Clone, Copy)]
pub struct SyntheticWeightGenerator {
    seed: u32,
}

impl SyntheticWeightGenerator {
    /// Create a generator with a seed
    #[must_use]
    pub fn new(seed: u32) -> Self {
        Self { seed }
    }

    /// `len` values uniformly spread over `[-1, 1)`
    #[must_use]
    pub fn generate_f32(&self, len: usize) -> Vec<f32> {
        let mut state = self.seed.wrapping_mul(2_654_435_761).wrapping_add(1);
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 8) as f32 / (1u32 << 23) as f32 - 1.0
            })
            .collect()
    }

    /// A `[rows, cols]` matrix quantized from synthetic values
    ///
    /// # Errors
    ///
    /// Returns an error if `rows` or `cols` is zero.
    pub fn quantized_matrix(
        &self,
        rows: usize,
        cols: usize,
        bit_width: BitWidth,
    ) -> Result<QuantizedMatrix> {
        QuantizedMatrix::quantize(&self.generate_f32(rows * cols), rows, cols, bit_width)
    }
}

/// `n × n` identity matrix at scale 1 and zero point 0
///
/// # Errors
///
/// Returns an error if `n` is zero.
pub fn identity_matrix(n: usize, bit_width: BitWidth) -> Result<QuantizedMatrix> {
    let mut levels = vec![0u8; n * n];
    for i in 0..n {
        levels[i * n + i] = 1;
    }
    let data = crate::quantize::pack_levels(&levels, bit_width);
    QuantizedMatrix::new(n, n, bit_width, data, 1.0, 0.0)
}

/// Identity projection with a zero bias
///
/// # Errors
///
/// Returns an error if `n` is zero.
pub fn identity_linear(n: usize) -> Result<QuantizedLinear> {
    Ok(QuantizedLinear::without_bias(identity_matrix(n, BitWidth::Eight)?))
}

/// Attention module whose four projections are the identity
///
/// With identity projections the module reduces to [`crate::layers::attend`]
/// followed by the configured residual and layer norm.
///
/// # Errors
///
/// Returns an error if the config is invalid.
pub fn identity_attention(config: AttentionConfig) -> Result<MultiHeadAttention> {
    let hidden = config.hidden_dim();
    let weights = AttentionWeights::new(
        identity_linear(hidden)?,
        identity_linear(hidden)?,
        identity_linear(hidden)?,
        identity_linear(hidden)?,
    );
    MultiHeadAttention::new(config, weights)
}

/// Synthetic 4-bit projection weights for one attention module
///
/// # Errors
///
/// Returns an error if `hidden` is zero.
pub fn synthetic_attention_weights(hidden: usize, seed: u32) -> Result<AttentionWeights> {
    let proj = |offset: u32| -> Result<QuantizedLinear> {
        let gen = SyntheticWeightGenerator::new(seed.wrapping_add(offset));
        Ok(QuantizedLinear::without_bias(gen.quantized_matrix(
            hidden,
            hidden,
            BitWidth::Four,
        )?))
    };
    Ok(AttentionWeights::new(proj(0)?, proj(1)?, proj(2)?, proj(3)?))
}

/// Attention module with synthetic 4-bit projections
///
/// # Errors
///
/// Returns an error if the config is invalid.
pub fn synthetic_attention(config: AttentionConfig, seed: u32) -> Result<MultiHeadAttention> {
    let weights = synthetic_attention_weights(config.hidden_dim(), seed)?;
    MultiHeadAttention::new(config, weights)
}

/// Attention-stack model with synthetic weights
///
/// Embedding and LM head are 8-bit, attention projections 4-bit.
///
/// # Errors
///
/// Returns an error if the config is invalid.
pub fn synthetic_model(config: ModelConfig, seed: u32) -> Result<AttentionStack> {
    let hidden = config.hidden_dim();
    let vocab = config.vocab_size;
    let embedding =
        SyntheticWeightGenerator::new(seed).quantized_matrix(vocab, hidden, BitWidth::Eight)?;
    let lm_head = QuantizedLinear::without_bias(
        SyntheticWeightGenerator::new(seed.wrapping_add(1)).quantized_matrix(
            hidden,
            vocab,
            BitWidth::Eight,
        )?,
    );
    let layers = (0..config.num_layers)
        .map(|i| synthetic_attention_weights(hidden, seed.wrapping_add(16 * (i as u32 + 1))))
        .collect::<Result<Vec<_>>>()?;
    AttentionStack::new(config, embedding, layers, lm_head)
}
