//! Benchmark suite for sampling and autoregressive decoding
//!
//! Measures end-to-end generation latency per sampling method.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use modalgen::generate::{generate, sample_token, GenerationParams};
use modalgen::layers::AttentionConfig;
use modalgen::model::{AttentionStack, ModelConfig};
use modalgen::testing::{synthetic_model, SyntheticWeightGenerator};
use modalgen::Tensor;

fn create_test_model() -> AttentionStack {
    let config = ModelConfig::new(
        100,
        2,
        AttentionConfig::new(2, 16).with_max_sequence_length(64),
    );
    synthetic_model(config, 42).unwrap()
}

fn benchmark_sample_token(c: &mut Criterion) {
    let logits = Tensor::from_vec(
        vec![32_000],
        SyntheticWeightGenerator::new(3)
            .generate_f32(32_000)
            .into_iter()
            .map(|x| x * 8.0)
            .collect(),
    )
    .unwrap();
    let mut group = c.benchmark_group("sample_token_32k");

    let methods = [
        ("greedy", GenerationParams::greedy()),
        ("temperature", GenerationParams::temperature(0.8)),
        ("top_k_40", GenerationParams::top_k(40)),
        ("top_p_0.9", GenerationParams::top_p(0.9)),
    ];
    for (name, params) in &methods {
        group.bench_with_input(BenchmarkId::from_parameter(name), params, |b, params| {
            b.iter(|| black_box(sample_token(black_box(&logits), params, 0.37).unwrap()));
        });
    }

    group.finish();
}

fn benchmark_generation(c: &mut Criterion) {
    let model = create_test_model();
    let mut group = c.benchmark_group("generation_8_tokens");

    let methods = [
        ("greedy", GenerationParams::greedy()),
        ("top_k", GenerationParams::top_k(5)),
        ("top_p", GenerationParams::top_p(0.9)),
    ];
    for (name, base) in &methods {
        let params = base
            .clone()
            .with_prompt_tokens(vec![1, 5, 10])
            .with_max_tokens(8)
            .with_seed(42);
        group.bench_with_input(BenchmarkId::from_parameter(name), &params, |b, params| {
            b.iter(|| black_box(generate(&model, black_box(params), None).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_sample_token, benchmark_generation);
criterion_main!(benches);
