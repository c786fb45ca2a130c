//! Token sampling and autoregressive generation
//!
//! Sampling policies convert next-position logits into one token id:
//! - Greedy: argmax, first maximum on ties
//! - Temperature: scale, softmax, sample proportionally
//! - Top-K: keep the K most probable tokens, renormalize, sample
//! - Top-P (nucleus): keep the smallest high-probability prefix whose mass
//!   reaches P, renormalize, sample
//!
//! Randomness comes from [`SamplingRng`], a 32-bit LCG, so identical
//! (model, prompt, params, seed) always produce identical output.
//!
//! ## Example
//!
//! ```rust,ignore
//! use modalgen::generate::{generate, GenerationParams};
//!
//! let params = GenerationParams::top_k(40)
//!     .with_temperature(0.8)
//!     .with_max_tokens(64)
//!     .with_prompt_tokens(vec![1, 2, 3])
//!     .with_seed(42);
//! let output = generate(&model, &params, None)?;
//! ```

use serde::{Deserialize, Serialize};

use crate::{
    error::{ModalgenError, Result},
    layers::softmax,
    tensor::Tensor,
};

mod decode;
pub use decode::{
    generate, generate_text, DecodeState, GenerationFailure, GenerationOutput, GenerationState,
    GenerativeModel, StopReason, StreamControl, Tokenizer,
};

/// Sampling policy for choosing the next token
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SamplingMethod {
    /// Always pick the most likely token
    Greedy,
    /// Sample from the full temperature-scaled distribution
    Temperature,
    /// Sample from the `k` most likely tokens
    TopK {
        /// Number of candidates kept
        k: usize,
    },
    /// Sample from the smallest set whose probability mass reaches `p`
    TopP {
        /// Cumulative probability threshold in `(0, 1]`
        p: f32,
    },
}

/// Preset adjustments applied to params before decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStyle {
    /// Leave params unchanged
    #[default]
    Neutral,
    /// Low temperature, greedy
    Formal,
    /// High temperature, nucleus sampling
    Creative,
    /// Short output, top-k sampling
    Concise,
    /// Long output, nucleus sampling
    Descriptive,
}

/// Parameters for one generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Maximum number of tokens to generate (prompt excluded)
    pub max_tokens: usize,
    /// Sampling policy
    pub sampling_method: SamplingMethod,
    /// Logit temperature; ignored by greedy sampling
    pub temperature: f32,
    /// Prompt token ids; must be non-empty
    pub prompt_tokens: Vec<u32>,
    /// RNG seed; 0 is mapped to 1
    pub seed: u32,
    /// Token id that ends generation when emitted
    pub eos_token_id: Option<u32>,
    /// Style preset applied by [`GenerationParams::styled`]
    pub style: GenerationStyle,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 100,
            sampling_method: SamplingMethod::Greedy,
            temperature: 1.0,
            prompt_tokens: Vec::new(),
            seed: 42,
            eos_token_id: None,
            style: GenerationStyle::Neutral,
        }
    }
}

impl GenerationParams {
    /// Greedy decoding params
    #[must_use]
    pub fn greedy() -> Self {
        Self::default()
    }

    /// Temperature sampling params
    #[must_use]
    pub fn temperature(temperature: f32) -> Self {
        Self {
            sampling_method: SamplingMethod::Temperature,
            temperature,
            ..Self::default()
        }
    }

    /// Top-k sampling params
    #[must_use]
    pub fn top_k(k: usize) -> Self {
        Self {
            sampling_method: SamplingMethod::TopK { k },
            ..Self::default()
        }
    }

    /// Top-p sampling params
    #[must_use]
    pub fn top_p(p: f32) -> Self {
        Self {
            sampling_method: SamplingMethod::TopP { p },
            ..Self::default()
        }
    }

    /// Set the token budget
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the prompt
    #[must_use]
    pub fn with_prompt_tokens(mut self, prompt_tokens: Vec<u32>) -> Self {
        self.prompt_tokens = prompt_tokens;
        self
    }

    /// Set the seed
    #[must_use]
    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = seed;
        self
    }

    /// Set the end-of-sequence token
    #[must_use]
    pub fn with_eos_token_id(mut self, eos_token_id: u32) -> Self {
        self.eos_token_id = Some(eos_token_id);
        self
    }

    /// Set the style preset
    #[must_use]
    pub fn with_style(mut self, style: GenerationStyle) -> Self {
        self.style = style;
        self
    }

    /// Load params from JSON
    ///
    /// Missing fields take their defaults; the result is validated.
    ///
    /// # Errors
    ///
    /// Returns `SamplingConfiguration` if the JSON is malformed or the params
    /// are invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        let params: Self =
            serde_json::from_str(json).map_err(|e| ModalgenError::SamplingConfiguration {
                reason: format!("invalid generation params JSON: {e}"),
            })?;
        params.validate()?;
        Ok(params)
    }

    /// Check every field is usable
    ///
    /// # Errors
    ///
    /// Returns `SamplingConfiguration` for a zero token budget, an empty
    /// prompt, a non-positive temperature, `k < 1`, or `p` outside `(0, 1]`.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| Err(ModalgenError::SamplingConfiguration { reason });

        if self.max_tokens == 0 {
            return fail("max_tokens must be >= 1".to_string());
        }
        if self.prompt_tokens.is_empty() {
            return fail("prompt_tokens must be non-empty".to_string());
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return fail(format!("temperature must be > 0, got {}", self.temperature));
        }
        match self.sampling_method {
            SamplingMethod::TopK { k } if k < 1 => fail(format!("top_k must be >= 1, got {k}")),
            SamplingMethod::TopP { p } if !(p > 0.0 && p <= 1.0) => {
                fail(format!("top_p must be in (0, 1], got {p}"))
            },
            _ => Ok(()),
        }
    }

    /// Copy of these params with the style preset applied
    ///
    /// - `Formal`: temperature 0.5, greedy
    /// - `Creative`: temperature 1.2, top-p 0.95
    /// - `Concise`: at most 20 tokens, temperature 0.6, top-k 5
    /// - `Descriptive`: at least 100 tokens, temperature 0.9, top-p 0.9
    /// - `Neutral`: unchanged
    #[must_use]
    pub fn styled(&self) -> Self {
        let mut params = self.clone();
        match self.style {
            GenerationStyle::Neutral => {},
            GenerationStyle::Formal => {
                params.temperature = 0.5;
                params.sampling_method = SamplingMethod::Greedy;
            },
            GenerationStyle::Creative => {
                params.temperature = 1.2;
                params.sampling_method = SamplingMethod::TopP { p: 0.95 };
            },
            GenerationStyle::Concise => {
                params.max_tokens = params.max_tokens.min(20);
                params.temperature = 0.6;
                params.sampling_method = SamplingMethod::TopK { k: 5 };
            },
            GenerationStyle::Descriptive => {
                params.max_tokens = params.max_tokens.max(100);
                params.temperature = 0.9;
                params.sampling_method = SamplingMethod::TopP { p: 0.9 };
            },
        }
        params
    }
}

/// Reproducible pseudo-random source for sampling
///
/// `state = state * 1664525 + 1013904223 (mod 2^32)`; each draw is
/// `(state & 0x7FFF_FFFF) / 0x7FFF_FFFF`, a value in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingRng {
    state: u32,
}

impl SamplingRng {
    /// Seed the generator; seed 0 is mapped to 1
    #[must_use]
    pub fn new(seed: u32) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Advance and return the next value in `[0, 1]`
    pub fn next_f32(&mut self) -> f32 {
        self.state = self
            .state
            .wrapping_mul(1_664_525)
            .wrapping_add(1_013_904_223);
        (f64::from(self.state & 0x7FFF_FFFF) / f64::from(0x7FFF_FFFF_u32)) as f32
    }

    /// Current internal state
    #[must_use]
    pub fn state(&self) -> u32 {
        self.state
    }
}

/// Divide logits by `temperature`
///
/// # Errors
///
/// Returns `SamplingConfiguration` if `temperature` is not positive.
pub fn apply_temperature(logits: &Tensor<f32>, temperature: f32) -> Result<Tensor<f32>> {
    if !(temperature.is_finite() && temperature > 0.0) {
        return Err(ModalgenError::SamplingConfiguration {
            reason: format!("temperature must be > 0, got {temperature}"),
        });
    }
    let scaled = logits.data().iter().map(|&x| x / temperature).collect();
    Tensor::from_vec(logits.shape().to_vec(), scaled)
}

/// Index of the largest logit, first one on ties
///
/// # Errors
///
/// Returns `InvalidShape` if `logits` is empty.
pub fn sample_greedy(logits: &Tensor<f32>) -> Result<usize> {
    let data = logits.data();
    if data.is_empty() {
        return Err(ModalgenError::InvalidShape {
            reason: "Logits cannot be empty".to_string(),
        });
    }
    let mut best = 0;
    for (i, &x) in data.iter().enumerate().skip(1) {
        if x > data[best] {
            best = i;
        }
    }
    Ok(best)
}

/// Pick from `indices` with weight `probs`, walking them in the given order
///
/// `probs` need not sum to 1; the draw is scaled by their total. Falls back
/// to the last index when rounding leaves the draw above the total.
///
/// # Errors
///
/// Returns `InvalidShape` if `probs` is empty or `DimensionMismatch` if
/// `indices` has a different length.
pub fn sample_from_distribution(
    probs: &[f32],
    indices: &[usize],
    rng_value: f32,
) -> Result<usize> {
    if probs.is_empty() {
        return Err(ModalgenError::InvalidShape {
            reason: "Cannot sample from an empty distribution".to_string(),
        });
    }
    if indices.len() != probs.len() {
        return Err(ModalgenError::mismatch(
            "distribution indices",
            probs.len(),
            indices.len(),
        ));
    }

    let total: f32 = probs.iter().sum();
    let target = rng_value * total;
    let mut cumsum = 0.0;
    for (&p, &idx) in probs.iter().zip(indices) {
        cumsum += p;
        if target < cumsum {
            return Ok(idx);
        }
    }
    Ok(indices[indices.len() - 1])
}

/// Sample from the full distribution of already temperature-scaled logits
///
/// # Errors
///
/// Returns `InvalidShape` if `logits` is empty.
pub fn sample_temperature(logits: &Tensor<f32>, rng_value: f32) -> Result<usize> {
    let probs = softmax(logits)?;
    let indices: Vec<usize> = (0..probs.size()).collect();
    sample_from_distribution(probs.data(), &indices, rng_value)
}

/// Sample among the `k` most likely tokens
///
/// With `k >= vocab` this is plain temperature sampling over the full
/// distribution in index order. Candidates are ranked by probability, ties
/// broken by lower index, so `k == 1` always returns the greedy choice.
///
/// # Errors
///
/// Returns `InvalidShape` if `logits` is empty or `SamplingConfiguration` if
/// `k` is zero.
pub fn sample_top_k(logits: &Tensor<f32>, k: usize, rng_value: f32) -> Result<usize> {
    if k == 0 {
        return Err(ModalgenError::SamplingConfiguration {
            reason: "top_k must be >= 1".to_string(),
        });
    }
    let n = logits.data().len();
    if k >= n {
        return sample_temperature(logits, rng_value);
    }
    if k == 1 {
        return sample_greedy(logits);
    }

    let probs = softmax(logits)?;
    let ranked = rank_descending(probs.data());
    let (indices, kept): (Vec<usize>, Vec<f32>) = ranked.into_iter().take(k).unzip();
    sample_from_distribution(&kept, &indices, rng_value)
}

/// Sample from the smallest high-probability prefix with mass `>= p`
///
/// With `p >= 1` this is plain temperature sampling over the full
/// distribution in index order. If rounding keeps the cumulative mass below
/// `p`, the whole ranked distribution is used.
///
/// # Errors
///
/// Returns `InvalidShape` if `logits` is empty or `SamplingConfiguration` if
/// `p` is outside `(0, 1]`.
pub fn sample_top_p(logits: &Tensor<f32>, p: f32, rng_value: f32) -> Result<usize> {
    if !(p > 0.0 && p <= 1.0) {
        return Err(ModalgenError::SamplingConfiguration {
            reason: format!("top_p must be in (0, 1], got {p}"),
        });
    }
    if p >= 1.0 {
        return sample_temperature(logits, rng_value);
    }

    let probs = softmax(logits)?;
    let ranked = rank_descending(probs.data());

    let mut cumsum = 0.0;
    let mut cutoff = ranked.len();
    for (i, (_, prob)) in ranked.iter().enumerate() {
        cumsum += prob;
        if cumsum >= p {
            cutoff = i + 1;
            break;
        }
    }

    let (indices, kept): (Vec<usize>, Vec<f32>) = ranked.into_iter().take(cutoff).unzip();
    sample_from_distribution(&kept, &indices, rng_value)
}

/// `(index, prob)` sorted by descending probability, stable on ties
fn rank_descending(probs: &[f32]) -> Vec<(usize, f32)> {
    let mut ranked: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked
}

/// Choose the next token according to `params`
///
/// Greedy ignores temperature and `rng_value`; every other method divides
/// logits by the temperature first.
///
/// # Errors
///
/// Returns an error if the logits are empty or the params are invalid.
pub fn sample_token(
    logits: &Tensor<f32>,
    params: &GenerationParams,
    rng_value: f32,
) -> Result<usize> {
    let t = params.temperature;
    match params.sampling_method {
        SamplingMethod::Greedy => sample_greedy(logits),
        SamplingMethod::Temperature => {
            sample_temperature(&apply_temperature(logits, t)?, rng_value)
        },
        SamplingMethod::TopK { k } => sample_top_k(&apply_temperature(logits, t)?, k, rng_value),
        SamplingMethod::TopP { p } => sample_top_p(&apply_temperature(logits, t)?, p, rng_value),
    }
}
