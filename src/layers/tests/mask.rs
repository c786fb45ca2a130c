use crate::error::ModalgenError;
use crate::layers::*;

#[test]
fn test_causal_mask_lower_triangular() {
    let mask = AttentionMask::causal(5).expect("test");
    for i in 0..5 {
        for j in 0..5 {
            assert_eq!(mask.allows(i, j).expect("test"), j <= i, "({i}, {j})");
        }
    }
}

#[test]
fn test_set_causal_non_square() {
    let mut mask = AttentionMask::new(2, 4).expect("test");
    mask.set_causal();
    assert_eq!(mask.row(0), &[true, false, false, false]);
    assert_eq!(mask.row(1), &[true, true, false, false]);
}

#[test]
fn test_padding_blocks_columns() {
    let mut mask = AttentionMask::new(3, 4).expect("test");
    mask.set_padding(&[1, 3]).expect("test");
    for i in 0..3 {
        assert_eq!(mask.row(i), &[true, false, true, false]);
    }
}

#[test]
fn test_padding_out_of_range_leaves_mask_unchanged() {
    let mut mask = AttentionMask::causal(3).expect("test");
    let before = mask.clone();
    let err = mask.set_padding(&[0, 3]).unwrap_err();
    assert!(matches!(err, ModalgenError::InvalidDimension { .. }));
    assert_eq!(mask, before);
}

#[test]
fn test_causal_then_padding_composes() {
    let mut mask = AttentionMask::new(3, 3).expect("test");
    mask.set_causal().set_padding(&[0]).expect("test");
    assert_eq!(mask.row(2), &[false, true, true]);
    assert_eq!(mask.row(0), &[false, false, false]);
}

#[test]
fn test_transpose() {
    let mut mask = AttentionMask::new(2, 3).expect("test");
    mask.set(0, 2, false).expect("test");
    let t = mask.transpose();
    assert_eq!((t.rows(), t.cols()), (3, 2));
    assert!(!t.allows(2, 0).expect("test"));
    assert!(t.allows(2, 1).expect("test"));
    assert_eq!(t.transpose(), mask);
}

#[test]
fn test_mask_bounds() {
    assert!(AttentionMask::new(0, 3).is_err());
    let mut mask = AttentionMask::new(2, 2).expect("test");
    assert!(mask.set(2, 0, false).is_err());
    assert!(mask.allows(0, 2).is_err());
}

#[test]
fn test_mask_serde_roundtrip() {
    let mask = AttentionMask::causal(3).expect("test");
    let json = serde_json::to_string(&mask).expect("test");
    let back: AttentionMask = serde_json::from_str(&json).expect("test");
    assert_eq!(back, mask);
}
