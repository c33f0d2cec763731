use pgm_transport::sqn::{range_inclusive, Sqn};

#[test]
fn test_signed_difference_ordering() {
    assert!(Sqn(0).lt(Sqn(1)));
    assert!(Sqn(1).gt(Sqn(0)));
    assert!(Sqn(0).lte(Sqn(0)));
    assert!(Sqn(0).gte(Sqn(0)));
    assert!(!Sqn(0).lt(Sqn(0)));
}

#[test]
fn test_ordering_across_wrap() {
    // The comparison is the sign of the 32-bit difference, not magnitude.
    assert!(Sqn(u32::MAX).lt(Sqn(0)));
    assert!(Sqn(0).gt(Sqn(u32::MAX)));
    assert!(Sqn(u32::MAX - 10).lt(Sqn(5)));
    assert!(Sqn(0x7fff_ffff).gt(Sqn(0)));
    // Exactly half the space apart: the difference is negative.
    assert!(Sqn(0x8000_0000).lt(Sqn(0)));
}

#[test]
fn test_wrapping_arithmetic() {
    assert_eq!(Sqn(u32::MAX).next(), Sqn(0));
    assert_eq!(Sqn(0).prev(), Sqn(u32::MAX));
    assert_eq!(Sqn(u32::MAX).wrapping_add(2), Sqn(1));
    assert_eq!(Sqn(1).wrapping_sub(Sqn(u32::MAX)), 2);
}

#[test]
fn test_range_inclusive_wraps() {
    let seq: Vec<Sqn> = range_inclusive(Sqn(u32::MAX - 1), Sqn(1)).collect();
    assert_eq!(seq, vec![Sqn(u32::MAX - 1), Sqn(u32::MAX), Sqn(0), Sqn(1)]);
    let single: Vec<Sqn> = range_inclusive(Sqn(7), Sqn(7)).collect();
    assert_eq!(single, vec![Sqn(7)]);
}
