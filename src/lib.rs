//! # Modalgen
//!
//! On-device autoregressive sequence generation over quantized attention,
//! with cross-modal fusion of two input streams.
//!
//! ## Features
//!
//! - **Quantized weights**: 4-bit and 8-bit affine-quantized matrices,
//!   dequantized on demand
//! - **Multi-head attention**: scaled dot-product attention with causal and
//!   padding masks, heads computed in parallel
//! - **Cross-modal fusion**: bidirectional, temporal, and hierarchical
//!   attention between two modalities with shared weights
//! - **Decoding**: greedy, temperature, top-k, and top-p sampling with a
//!   reproducible seeded RNG, streaming callbacks, and partial results on
//!   failure
//!
//! ## Example
//!
//! ```rust
//! use modalgen::Tensor;
//!
//! let a = Tensor::from_vec(vec![2, 3], vec![
//!     1.0, 2.0, 3.0,
//!     4.0, 5.0, 6.0,
//! ]).unwrap();
//!
//! assert_eq!(a.shape(), &[2, 3]);
//! assert_eq!(a.ndim(), 2);
//! assert_eq!(a.size(), 6);
//! ```
//!
//! ## Generation
//!
//! ```rust,ignore
//! use modalgen::generate::{generate, GenerationParams, StreamControl};
//!
//! let params = GenerationParams::top_p(0.9)
//!     .with_prompt_tokens(prompt)
//!     .with_max_tokens(32)
//!     .with_eos_token_id(eos);
//! let mut on_token = |id: u32, _is_final: bool| {
//!     print!("{}", tokenizer.decode(&[id]));
//!     StreamControl::Continue
//! };
//! let output = generate(&model, &params, Some(&mut on_token))?;
//! ```
//!
//! ## Logging
//!
//! Components emit `tracing` events (`warn!`/`debug!`/`trace!`) with structured
//! fields. The crate never installs a subscriber.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)] // usize -> f32 for scaling factors
#![allow(clippy::cast_possible_truncation)] // f64 -> f32 for RNG draws
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)] // Not all methods need #[must_use]
#![allow(clippy::doc_markdown)] // Allow technical terms without backticks
#![allow(clippy::uninlined_format_args)] // Prefer explicit format args
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::float_cmp)] // Allow float comparisons in tests
#![allow(clippy::manual_range_contains)]

pub mod error;
/// Cross-modal fusion
///
/// Bidirectional attention between two modalities with one shared module,
/// plus temporal (ring-buffer context) and hierarchical (multi-granularity)
/// variants.
pub mod fusion;
pub mod generate;
pub mod layers;
/// Attention-stack language model implementing [`generate::GenerativeModel`]
pub mod model;
pub mod quantize;
pub mod tensor;
/// Deterministic fixtures for tests and benches
pub mod testing;

// Re-exports for convenience
pub use error::{ModalgenError, Result};
pub use tensor::Tensor;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
