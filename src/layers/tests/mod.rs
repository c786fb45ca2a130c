//! Unit tests for the layers module

mod mask;

use crate::testing::SyntheticWeightGenerator;

use super::QuantizedLinear;

pub(super) fn identity_linear(n: usize) -> QuantizedLinear {
    crate::testing::identity_linear(n).expect("test")
}

pub(super) fn activations(len: usize, seed: u32) -> Vec<f32> {
    SyntheticWeightGenerator::new(seed).generate_f32(len)
}
