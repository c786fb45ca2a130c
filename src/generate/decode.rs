//! Autoregressive decoding loop
//!
//! ```text
//! Ready → Decoding → Stopped(reason)
//! ```
//!
//! Each step runs one forward pass over the token history (truncated to the
//! model's context window), samples one id, appends it, reports it to the
//! optional stream callback, then checks the stop conditions in order:
//! callback stop, end-of-sequence id, token budget.

use thiserror::Error;
use tracing::{debug, warn};

use super::{sample_token, GenerationParams, SamplingMethod, SamplingRng};
use crate::{
    error::{ModalgenError, Result},
    tensor::Tensor,
};

/// Model that produces next-token logits
///
/// Implementations are read-only during generation, so one model can serve
/// many concurrent generations when it is `Sync`.
pub trait GenerativeModel {
    /// Logits for the token following `tokens`
    ///
    /// Returns one logit per vocabulary entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the forward pass fails.
    fn forward(&self, tokens: &[u32]) -> Result<Vec<f32>>;

    /// Vocabulary size
    fn vocab_size(&self) -> usize;

    /// Longest token history one forward pass accepts
    fn context_length(&self) -> usize {
        usize::MAX
    }
}

/// Text ↔ token id conversion supplied by the caller
pub trait Tokenizer {
    /// Encode text to token ids
    fn encode(&self, text: &str) -> Vec<u32>;

    /// Decode token ids to text
    fn decode(&self, tokens: &[u32]) -> String;

    /// Vocabulary size
    fn vocab_size(&self) -> usize;

    /// End-of-sequence token, if the vocabulary has one
    fn eos_token_id(&self) -> Option<u32>;
}

/// Stream callback verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    /// Keep decoding
    Continue,
    /// Stop after the token just reported
    Stop,
}

/// Why decoding stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `max_tokens` tokens were generated
    ReachedTokenBudget,
    /// The end-of-sequence id was emitted
    EmittedStopToken,
    /// The stream callback returned [`StreamControl::Stop`]
    CallbackRequestedStop,
    /// A size limit was exceeded
    ResourceExhausted,
    /// Any other failure
    Error,
}

impl StopReason {
    /// Stop reason for a failed step
    #[must_use]
    pub fn from_error(error: &ModalgenError) -> Self {
        match error {
            ModalgenError::ResourceExhausted { .. } => Self::ResourceExhausted,
            _ => Self::Error,
        }
    }
}

/// Lifecycle of one generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// Created, no forward pass run yet
    Ready,
    /// At least one step taken
    Decoding,
    /// Finished
    Stopped(StopReason),
}

/// Successful generation result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutput {
    /// Generated ids, prompt excluded; includes the end-of-sequence id when
    /// one was emitted
    pub tokens: Vec<u32>,
    /// Why decoding stopped
    pub stop_reason: StopReason,
}

/// Failed generation with the tokens produced before the failure
#[derive(Debug, Clone, PartialEq, Error)]
#[error("generation failed after {} tokens: {}", .partial.len(), .error)]
pub struct GenerationFailure {
    /// Ids generated before the failing step, prompt excluded
    pub partial: Vec<u32>,
    /// The first error encountered
    #[source]
    pub error: ModalgenError,
}

impl GenerationFailure {
    fn before_start(error: ModalgenError) -> Self {
        Self {
            partial: Vec::new(),
            error,
        }
    }

    /// Stop reason implied by the error
    #[must_use]
    pub fn stop_reason(&self) -> StopReason {
        StopReason::from_error(&self.error)
    }
}

/// Per-call decoding state
///
/// Owns the token history (prompt followed by generated ids) and the RNG.
/// Created for one generation and dropped when it ends.
#[derive(Debug, Clone)]
pub struct GenerationState {
    tokens: Vec<u32>,
    prompt_len: usize,
    rng: SamplingRng,
    state: DecodeState,
}

impl GenerationState {
    /// Start a generation from `params.prompt_tokens` and `params.seed`
    #[must_use]
    pub fn new(params: &GenerationParams) -> Self {
        Self {
            tokens: params.prompt_tokens.clone(),
            prompt_len: params.prompt_tokens.len(),
            rng: SamplingRng::new(params.seed),
            state: DecodeState::Ready,
        }
    }

    /// Run one decoding step
    ///
    /// `callback` receives the new id and whether it is the last one.
    /// Returns the stop reason once decoding is finished, `None` while it
    /// should continue. Calling `step` after a stop is a no-op that returns
    /// the same reason.
    ///
    /// # Errors
    ///
    /// Returns the forward-pass or sampling error; the state moves to
    /// `Stopped` and the history keeps every token appended so far.
    pub fn step<M: GenerativeModel + ?Sized>(
        &mut self,
        model: &M,
        params: &GenerationParams,
        callback: &mut dyn FnMut(u32, bool) -> StreamControl,
    ) -> Result<Option<StopReason>> {
        if let DecodeState::Stopped(reason) = self.state {
            return Ok(Some(reason));
        }
        self.state = DecodeState::Decoding;

        match self.advance(model, params, callback) {
            Ok(Some(reason)) => {
                self.state = DecodeState::Stopped(reason);
                debug!(?reason, generated = self.generated().len(), "decoding stopped");
                Ok(Some(reason))
            },
            Ok(None) => Ok(None),
            Err(e) => {
                let reason = StopReason::from_error(&e);
                self.state = DecodeState::Stopped(reason);
                warn!(?reason, error = %e, generated = self.generated().len(), "decoding failed");
                Err(e)
            },
        }
    }

    fn advance<M: GenerativeModel + ?Sized>(
        &mut self,
        model: &M,
        params: &GenerationParams,
        callback: &mut dyn FnMut(u32, bool) -> StreamControl,
    ) -> Result<Option<StopReason>> {
        let window = self.context_window(model.context_length());
        let context_len = window.len();
        let logits = model.forward(window)?;
        let vocab = model.vocab_size();
        if logits.len() != vocab {
            return Err(ModalgenError::mismatch("model logits", vocab, logits.len()));
        }
        let logits = Tensor::from_vec(vec![vocab], logits)?;

        let rng_value = match params.sampling_method {
            SamplingMethod::Greedy => 0.0,
            _ => self.rng.next_f32(),
        };
        let index = sample_token(&logits, params, rng_value)?;
        let token = u32::try_from(index)
            .map_err(|_| ModalgenError::Inference(format!("token index {index} overflows u32")))?;
        self.tokens.push(token);

        let generated = self.generated().len();
        let is_eos = params.eos_token_id == Some(token);
        let budget_reached = generated >= params.max_tokens;
        debug!(step = generated, token, context_len, "decoded token");

        if callback(token, is_eos || budget_reached) == StreamControl::Stop {
            return Ok(Some(StopReason::CallbackRequestedStop));
        }
        if is_eos {
            return Ok(Some(StopReason::EmittedStopToken));
        }
        if budget_reached {
            return Ok(Some(StopReason::ReachedTokenBudget));
        }
        Ok(None)
    }

    /// Most recent `limit` tokens of the history
    fn context_window(&self, limit: usize) -> &[u32] {
        let start = self.tokens.len().saturating_sub(limit);
        &self.tokens[start..]
    }

    /// Full history: prompt followed by generated ids
    #[must_use]
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Generated ids only
    #[must_use]
    pub fn generated(&self) -> &[u32] {
        &self.tokens[self.prompt_len..]
    }

    /// Position of the next token in the history
    #[must_use]
    pub fn position(&self) -> usize {
        self.tokens.len()
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Current RNG state
    #[must_use]
    pub fn rng_state(&self) -> u32 {
        self.rng.state()
    }

    fn into_generated(mut self) -> Vec<u32> {
        self.tokens.split_off(self.prompt_len)
    }
}

/// Generate tokens from `params.prompt_tokens` until a stop condition
///
/// The style preset in `params` is applied first, then the params are
/// validated. The optional callback receives each new id and whether it is
/// the last one; returning [`StreamControl::Stop`] ends decoding after that
/// token.
///
/// # Errors
///
/// Returns a [`GenerationFailure`] holding the first error and every id
/// generated before it.
pub fn generate<M: GenerativeModel + ?Sized>(
    model: &M,
    params: &GenerationParams,
    callback: Option<&mut dyn FnMut(u32, bool) -> StreamControl>,
) -> std::result::Result<GenerationOutput, GenerationFailure> {
    let params = params.styled();
    params.validate().map_err(GenerationFailure::before_start)?;

    debug!(
        prompt_len = params.prompt_tokens.len(),
        max_tokens = params.max_tokens,
        method = ?params.sampling_method,
        seed = params.seed,
        "starting generation"
    );

    let mut keep_going = |_: u32, _: bool| StreamControl::Continue;
    let callback: &mut dyn FnMut(u32, bool) -> StreamControl = match callback {
        Some(cb) => cb,
        None => &mut keep_going,
    };

    let mut state = GenerationState::new(&params);
    loop {
        match state.step(model, &params, &mut *callback) {
            Ok(Some(stop_reason)) => {
                return Ok(GenerationOutput {
                    tokens: state.into_generated(),
                    stop_reason,
                });
            },
            Ok(None) => {},
            Err(error) => {
                return Err(GenerationFailure {
                    partial: state.into_generated(),
                    error,
                });
            },
        }
    }
}

/// Generate text from a text prompt
///
/// Encodes `prompt` with `tokenizer`, uses the tokenizer's end-of-sequence
/// id when `params` has none, and decodes the generated ids with the
/// end-of-sequence id removed.
///
/// # Errors
///
/// Returns a [`GenerationFailure`] if the tokenizer and model vocabularies
/// differ or generation fails.
pub fn generate_text<M: GenerativeModel + ?Sized, T: Tokenizer + ?Sized>(
    model: &M,
    tokenizer: &T,
    prompt: &str,
    params: &GenerationParams,
    callback: Option<&mut dyn FnMut(u32, bool) -> StreamControl>,
) -> std::result::Result<String, GenerationFailure> {
    if tokenizer.vocab_size() != model.vocab_size() {
        return Err(GenerationFailure::before_start(ModalgenError::mismatch(
            "tokenizer vocabulary",
            model.vocab_size(),
            tokenizer.vocab_size(),
        )));
    }

    let mut params = params.clone();
    params.prompt_tokens = tokenizer.encode(prompt);
    if params.eos_token_id.is_none() {
        params.eos_token_id = tokenizer.eos_token_id();
    }

    let output = generate(model, &params, callback)?;
    let text_tokens: Vec<u32> = output
        .tokens
        .into_iter()
        .filter(|&t| Some(t) != params.eos_token_id)
        .collect();
    Ok(tokenizer.decode(&text_tokens))
}

#[cfg(test)]
#[path = "decode_tests.rs"]
mod tests;
