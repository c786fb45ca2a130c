use super::*;
use crate::layers::attend;
use crate::testing::{identity_attention, synthetic_attention, SyntheticWeightGenerator};

fn fusion(num_heads: usize, head_dim: usize) -> CrossModalFusion {
    let config = AttentionConfig::new(num_heads, head_dim);
    CrossModalFusion::new(synthetic_attention(config, 3).expect("test"))
}

fn features(rows: usize, cols: usize, seed: u32) -> Tensor<f32> {
    Tensor::from_vec(
        vec![rows, cols],
        SyntheticWeightGenerator::new(seed).generate_f32(rows * cols),
    )
    .expect("test")
}

#[test]
fn test_bidirectional_shapes() {
    let f = fusion(2, 4);
    let a = features(3, 8, 1);
    let b = features(5, 8, 2);
    let (out_a, out_b) = f.fuse_bidirectional(&a, &b, None).expect("test");
    assert_eq!(out_a.shape(), &[3, 8]);
    assert_eq!(out_b.shape(), &[5, 8]);
}

#[test]
fn test_bidirectional_swap_symmetry() {
    let f = fusion(2, 4);
    let a = features(3, 8, 1);
    let b = features(5, 8, 2);
    let (ab_a, ab_b) = f.fuse_bidirectional(&a, &b, None).expect("test");
    let (ba_b, ba_a) = f.fuse_bidirectional(&b, &a, None).expect("test");
    assert_eq!(ab_a.data(), ba_a.data());
    assert_eq!(ab_b.data(), ba_b.data());
}

#[test]
fn test_bidirectional_mask_is_transposed_for_reverse() {
    let f = fusion(1, 4);
    let a = features(2, 4, 5);
    let b = features(3, 4, 6);
    let mut mask = AttentionMask::new(2, 3).expect("test");
    mask.set_padding(&[1]).expect("test");

    let (out_a, out_b) = f.fuse_bidirectional(&a, &b, Some(&mask)).expect("test");
    let expected_a = f.attention().forward(&a, &b, Some(&mask)).expect("test");
    let expected_b = f
        .attention()
        .forward(&b, &a, Some(&mask.transpose()))
        .expect("test");
    assert_eq!(out_a.data(), expected_a.data());
    assert_eq!(out_b.data(), expected_b.data());
}

#[test]
fn test_equal_lengths_never_get_causal_mask() {
    let config = AttentionConfig::new(1, 2).with_causal_mask(true);
    let f = CrossModalFusion::new(identity_attention(config).expect("test"));
    let a = Tensor::from_vec(vec![2, 2], vec![1.0, 0.0, 0.0, 1.0]).expect("test");
    let b = Tensor::from_vec(vec![2, 2], vec![5.0, 0.0, 0.0, 5.0]).expect("test");

    let (out_a, out_b) = f.fuse_bidirectional(&a, &b, None).expect("test");
    // A row 0 sees both rows of B
    assert!(out_a.data()[1] > 0.1, "row 0 = {:?}", &out_a.data()[..2]);
    let expected_a = attend(a.view(), b.view(), b.view(), 1, 2, None).expect("test");
    let expected_b = attend(b.view(), a.view(), a.view(), 1, 2, None).expect("test");
    assert_eq!(out_a.data(), expected_a.data());
    assert_eq!(out_b.data(), expected_b.data());

    // same for the other cross-modal paths
    let context = TemporalContext::new(2, 2).expect("test");
    let temporal = f.attend_temporal(&a, &context, &b).expect("test");
    assert_eq!(temporal.data(), expected_a.data());
    let hierarchical = f.fuse_hierarchical(&[(a.clone(), b.clone())], None).expect("test");
    assert_eq!(hierarchical.data(), expected_a.data());
}

#[test]
fn test_bidirectional_width_mismatch() {
    let f = fusion(2, 4);
    let a = features(3, 8, 1);
    let b = features(5, 6, 2);
    assert!(matches!(
        f.fuse_bidirectional(&a, &b, None),
        Err(ModalgenError::DimensionMismatch { expected: 8, actual: 6, .. })
    ));
}

#[test]
fn test_bidirectional_bad_mask_fails_whole_call() {
    let f = fusion(1, 4);
    let a = features(2, 4, 1);
    let b = features(3, 4, 2);
    let mask = AttentionMask::new(3, 2).expect("test");
    assert!(f.fuse_bidirectional(&a, &b, Some(&mask)).is_err());
}

#[test]
fn test_temporal_context_ring_order() {
    let mut ctx = TemporalContext::new(3, 2).expect("test");
    assert!(ctx.is_empty());
    for p in 0..5 {
        ctx.update(&[p as f32, -(p as f32)], p).expect("test");
    }
    assert_eq!(ctx.len(), 3);
    assert_eq!(ctx.positions(), vec![2, 3, 4]);
    let states: Vec<f32> = ctx.iter().flat_map(|(_, s)| s.to_vec()).collect();
    assert_eq!(states, vec![2.0, -2.0, 3.0, -3.0, 4.0, -4.0]);

    ctx.clear();
    assert!(ctx.is_empty());
    assert_eq!(ctx.iter().count(), 0);
}

#[test]
fn test_temporal_context_partial_fill_order() {
    let mut ctx = TemporalContext::new(4, 1).expect("test");
    ctx.update(&[1.0], 10).expect("test");
    ctx.update(&[2.0], 11).expect("test");
    assert_eq!(ctx.positions(), vec![10, 11]);
}

#[test]
fn test_temporal_context_errors() {
    assert!(TemporalContext::new(0, 4).is_err());
    assert!(TemporalContext::new(4, 0).is_err());
    let mut ctx = TemporalContext::new(2, 4).expect("test");
    assert!(matches!(
        ctx.update(&[0.0; 3], 0),
        Err(ModalgenError::DimensionMismatch { .. })
    ));
    assert!(ctx.is_empty());
}

#[test]
fn test_attend_temporal_concatenates_context_then_modality() {
    let f = CrossModalFusion::new(identity_attention(AttentionConfig::new(1, 2)).expect("test"));
    let current = features(1, 2, 1);
    let modality = features(2, 2, 2);
    let mut ctx = TemporalContext::new(2, 2).expect("test");

    let empty = f.attend_temporal(&current, &ctx, &modality).expect("test");
    let direct = f.attention().forward(&current, &modality, None).expect("test");
    assert_eq!(empty.data(), direct.data());

    ctx.update(&[0.5, 0.5], 0).expect("test");
    ctx.update(&[-0.5, 0.25], 1).expect("test");
    let out = f.attend_temporal(&current, &ctx, &modality).expect("test");

    let mut kv = vec![0.5, 0.5, -0.5, 0.25];
    kv.extend_from_slice(modality.data());
    let kv = Tensor::from_vec(vec![4, 2], kv).expect("test");
    let expected = f.attention().forward(&current, &kv, None).expect("test");
    assert_eq!(out.data(), expected.data());
}

#[test]
fn test_attend_temporal_context_width_checked() {
    let f = fusion(1, 2);
    let ctx = TemporalContext::new(2, 3).expect("test");
    let x = features(1, 2, 1);
    assert!(matches!(
        f.attend_temporal(&x, &ctx, &x),
        Err(ModalgenError::DimensionMismatch { .. })
    ));
}

#[test]
fn test_hierarchical_single_level_is_plain_attention() {
    let f = fusion(2, 2);
    let q = features(3, 4, 1);
    let k = features(6, 4, 2);
    let levels = vec![(q.clone(), k.clone())];
    let out = f.fuse_hierarchical(&levels, None).expect("test");
    let expected = f.attention().forward(&q, &k, None).expect("test");
    for (a, b) in out.data().iter().zip(expected.data()) {
        assert!((a - b).abs() < 1e-6);
    }
}

#[test]
fn test_hierarchical_weights_normalized() {
    let f = fusion(1, 4);
    let q = features(2, 4, 1);
    let coarse = features(3, 4, 2);
    let fine = features(8, 4, 3);
    let levels = vec![(q.clone(), coarse.clone()), (q.clone(), fine.clone())];

    let weighted = f.fuse_hierarchical(&levels, Some(&[3.0, 1.0])).expect("test");
    let c = f.attention().forward(&q, &coarse, None).expect("test");
    let fi = f.attention().forward(&q, &fine, None).expect("test");
    for ((w, a), b) in weighted.data().iter().zip(c.data()).zip(fi.data()) {
        assert!((w - (0.75 * a + 0.25 * b)).abs() < 1e-5);
    }

    let uniform = f.fuse_hierarchical(&levels, None).expect("test");
    let doubled = f.fuse_hierarchical(&levels, Some(&[2.0, 2.0])).expect("test");
    for (a, b) in uniform.data().iter().zip(doubled.data()) {
        assert!((a - b).abs() < 1e-6);
    }
}

#[test]
fn test_hierarchical_errors() {
    let f = fusion(1, 4);
    let q = features(2, 4, 1);
    let k = features(3, 4, 2);

    assert!(matches!(
        f.fuse_hierarchical(&[], None),
        Err(ModalgenError::InvalidDimension { .. })
    ));
    let levels = vec![(q.clone(), k.clone())];
    assert!(matches!(
        f.fuse_hierarchical(&levels, Some(&[1.0, 1.0])),
        Err(ModalgenError::DimensionMismatch { .. })
    ));
    assert!(f.fuse_hierarchical(&levels, Some(&[-1.0])).is_err());
    assert!(f.fuse_hierarchical(&levels, Some(&[0.0])).is_err());

    let ragged = vec![(q, k.clone()), (features(3, 4, 4), k)];
    assert!(matches!(
        f.fuse_hierarchical(&ragged, None),
        Err(ModalgenError::DimensionMismatch { .. })
    ));
}

#[test]
fn test_memory_usage() {
    let f = fusion(2, 4);
    let usage = f.memory_usage();
    assert_eq!(usage.weight_bytes, f.attention().weight_memory_bytes());
    assert!(usage.activation_bytes > 0);
    assert_eq!(usage.total_bytes(), usage.weight_bytes + usage.activation_bytes);
}
