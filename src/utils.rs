/// Round `x` up to a multiple of `align`, which must be a power of two.
/// Returns `None` on overflow.
#[inline]
pub const fn checked_round_up(x: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    match x.checked_add(align - 1) {
        Some(x) => Some(x & !(align - 1)),
        None => None,
    }
}

/// Round `x` up to a multiple of `align`, which must be a power of two.
///
/// `x` must be small enough not to overflow.
#[inline]
pub const fn round_up(x: usize, align: usize) -> usize {
    (x + (align - 1)) & !(align - 1)
}

#[inline]
pub const fn max(x: usize, y: usize) -> usize {
    if x > y {
        x
    } else {
        y
    }
}
