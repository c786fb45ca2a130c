use std::cell::{Cell, RefCell};

use super::*;

/// Always predicts `(last + 1) % vocab` with a strong margin
struct CountingModel {
    vocab: usize,
    context: usize,
    windows: RefCell<Vec<Vec<u32>>>,
}

impl CountingModel {
    fn new(vocab: usize) -> Self {
        Self {
            vocab,
            context: usize::MAX,
            windows: RefCell::new(Vec::new()),
        }
    }
}

impl GenerativeModel for CountingModel {
    fn forward(&self, tokens: &[u32]) -> Result<Vec<f32>> {
        self.windows.borrow_mut().push(tokens.to_vec());
        let last = *tokens.last().expect("test") as usize;
        let mut logits = vec![0.0; self.vocab];
        logits[(last + 1) % self.vocab] = 10.0;
        Ok(logits)
    }

    fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn context_length(&self) -> usize {
        self.context
    }
}

/// Uniform logits, fails on the given call
struct FlakyModel {
    vocab: usize,
    fail_on_call: usize,
    calls: Cell<usize>,
    error: ModalgenError,
}

impl GenerativeModel for FlakyModel {
    fn forward(&self, _tokens: &[u32]) -> Result<Vec<f32>> {
        let call = self.calls.get() + 1;
        self.calls.set(call);
        if call == self.fail_on_call {
            return Err(self.error.clone());
        }
        Ok(vec![0.0; self.vocab])
    }

    fn vocab_size(&self) -> usize {
        self.vocab
    }
}

fn params(prompt: Vec<u32>) -> GenerationParams {
    GenerationParams::greedy().with_prompt_tokens(prompt)
}

#[test]
fn test_greedy_reaches_budget() {
    let model = CountingModel::new(10);
    let out = generate(&model, &params(vec![0]).with_max_tokens(4), None).expect("test");
    assert_eq!(out.tokens, vec![1, 2, 3, 4]);
    assert_eq!(out.stop_reason, StopReason::ReachedTokenBudget);
}

#[test]
fn test_eos_stops_and_is_included() {
    let model = CountingModel::new(10);
    let p = params(vec![0]).with_max_tokens(20).with_eos_token_id(3);
    let out = generate(&model, &p, None).expect("test");
    assert_eq!(out.tokens, vec![1, 2, 3]);
    assert_eq!(out.stop_reason, StopReason::EmittedStopToken);
}

#[test]
fn test_callback_sees_tokens_and_final_flag() {
    let model = CountingModel::new(10);
    let mut seen = Vec::new();
    let mut cb = |token: u32, is_final: bool| {
        seen.push((token, is_final));
        StreamControl::Continue
    };
    let out = generate(&model, &params(vec![5]).with_max_tokens(3), Some(&mut cb)).expect("test");
    assert_eq!(out.tokens, vec![6, 7, 8]);
    assert_eq!(seen, vec![(6, false), (7, false), (8, true)]);
}

#[test]
fn test_callback_stop() {
    let model = CountingModel::new(10);
    let mut count = 0;
    let mut cb = |_: u32, _: bool| {
        count += 1;
        if count == 2 {
            StreamControl::Stop
        } else {
            StreamControl::Continue
        }
    };
    let out = generate(&model, &params(vec![0]).with_max_tokens(10), Some(&mut cb)).expect("test");
    assert_eq!(out.tokens, vec![1, 2]);
    assert_eq!(out.stop_reason, StopReason::CallbackRequestedStop);
}

#[test]
fn test_callback_stop_takes_precedence_over_eos() {
    let model = CountingModel::new(10);
    let mut cb = |_: u32, _: bool| StreamControl::Stop;
    let p = params(vec![0]).with_eos_token_id(1);
    let out = generate(&model, &p, Some(&mut cb)).expect("test");
    assert_eq!(out.tokens, vec![1]);
    assert_eq!(out.stop_reason, StopReason::CallbackRequestedStop);
}

#[test]
fn test_context_window_keeps_most_recent() {
    let mut model = CountingModel::new(10);
    model.context = 3;
    generate(&model, &params(vec![0, 1, 2, 3, 4]).with_max_tokens(2), None).expect("test");
    let windows = model.windows.borrow();
    assert_eq!(windows[0], vec![2, 3, 4]);
    assert_eq!(windows[1], vec![3, 4, 5]);
}

#[test]
fn test_failure_returns_partial_sequence() {
    let model = FlakyModel {
        vocab: 4,
        fail_on_call: 3,
        calls: Cell::new(0),
        error: ModalgenError::Inference("boom".to_string()),
    };
    let err = generate(&model, &params(vec![1]).with_max_tokens(10), None).unwrap_err();
    assert_eq!(err.partial, vec![0, 0]);
    assert_eq!(err.error, ModalgenError::Inference("boom".to_string()));
    assert_eq!(err.stop_reason(), StopReason::Error);
    assert!(err.to_string().contains("after 2 tokens"));
}

#[test]
fn test_resource_exhaustion_reason() {
    let model = FlakyModel {
        vocab: 4,
        fail_on_call: 1,
        calls: Cell::new(0),
        error: ModalgenError::ResourceExhausted {
            resource: "attention sequence length".to_string(),
            requested: 9,
            limit: 8,
        },
    };
    let err = generate(&model, &params(vec![1]), None).unwrap_err();
    assert!(err.partial.is_empty());
    assert_eq!(err.stop_reason(), StopReason::ResourceExhausted);
}

#[test]
fn test_invalid_params_fail_before_forward() {
    let model = CountingModel::new(4);
    let err = generate(&model, &params(vec![]), None).unwrap_err();
    assert!(matches!(err.error, ModalgenError::SamplingConfiguration { .. }));
    assert!(model.windows.borrow().is_empty());
}

#[test]
fn test_wrong_logit_count_is_error() {
    struct Short;
    impl GenerativeModel for Short {
        fn forward(&self, _tokens: &[u32]) -> Result<Vec<f32>> {
            Ok(vec![0.0; 3])
        }
        fn vocab_size(&self) -> usize {
            4
        }
    }
    let err = generate(&Short, &params(vec![0]), None).unwrap_err();
    assert!(matches!(err.error, ModalgenError::DimensionMismatch { .. }));
}

#[test]
fn test_state_machine_transitions() {
    let model = CountingModel::new(10);
    let p = params(vec![0]).with_max_tokens(2);
    let mut state = GenerationState::new(&p);
    let mut cb = |_: u32, _: bool| StreamControl::Continue;
    assert_eq!(state.state(), DecodeState::Ready);

    assert_eq!(state.step(&model, &p, &mut cb).expect("test"), None);
    assert_eq!(state.state(), DecodeState::Decoding);
    assert_eq!(state.position(), 2);

    let reason = state.step(&model, &p, &mut cb).expect("test");
    assert_eq!(reason, Some(StopReason::ReachedTokenBudget));
    assert_eq!(state.state(), DecodeState::Stopped(StopReason::ReachedTokenBudget));
    assert_eq!(state.tokens(), &[0, 1, 2]);
    assert_eq!(state.generated(), &[1, 2]);

    // stepping a stopped state changes nothing
    assert_eq!(state.step(&model, &p, &mut cb).expect("test"), reason);
    assert_eq!(state.tokens(), &[0, 1, 2]);
}

#[test]
fn test_greedy_does_not_advance_rng() {
    let model = CountingModel::new(10);
    let p = params(vec![0]).with_seed(5);
    let mut state = GenerationState::new(&p);
    let before = state.rng_state();
    state
        .step(&model, &p, &mut |_, _| StreamControl::Continue)
        .expect("test");
    assert_eq!(state.rng_state(), before);
}

#[test]
fn test_seeded_sampling_reproducible() {
    let model = FlakyModel {
        vocab: 8,
        fail_on_call: usize::MAX,
        calls: Cell::new(0),
        error: ModalgenError::Inference(String::new()),
    };
    let p = GenerationParams::temperature(1.0)
        .with_prompt_tokens(vec![0])
        .with_max_tokens(16)
        .with_seed(1234);
    let a = generate(&model, &p, None).expect("test");
    let b = generate(&model, &p, None).expect("test");
    assert_eq!(a, b);

    let differs = (1..20u32).any(|seed| {
        generate(&model, &p.clone().with_seed(seed), None)
            .expect("test")
            .tokens
            != a.tokens
    });
    assert!(differs);
}

/// One character per token over a fixed alphabet
struct CharTokenizer;

const ALPHABET: &[u8] = b"abcdefghi$";

impl Tokenizer for CharTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.bytes()
            .filter_map(|b| ALPHABET.iter().position(|&a| a == b))
            .map(|i| i as u32)
            .collect()
    }

    fn decode(&self, tokens: &[u32]) -> String {
        tokens
            .iter()
            .map(|&t| ALPHABET[t as usize] as char)
            .collect()
    }

    fn vocab_size(&self) -> usize {
        ALPHABET.len()
    }

    fn eos_token_id(&self) -> Option<u32> {
        Some(9)
    }
}

#[test]
fn test_generate_text_uses_tokenizer_eos() {
    let model = CountingModel::new(10);
    let text = generate_text(&model, &CharTokenizer, "g", &params(vec![]), None).expect("test");
    // g -> h -> i -> $ (eos, dropped)
    assert_eq!(text, "hi");
}

#[test]
fn test_generate_text_vocab_mismatch() {
    let model = CountingModel::new(5);
    let err = generate_text(&model, &CharTokenizer, "a", &params(vec![]), None).unwrap_err();
    assert!(matches!(err.error, ModalgenError::DimensionMismatch { .. }));
}
