//! Size-class mapper. The core implementation of `Heap`'s bucket placement.
//!
//! A size `s` belongs to first-level class `fl = floor(log2(s))` and to one
//! of `SLLEN` equal-width second-level slots that subdivide
//! `2^fl..2^(fl + 1)`. Insertion rounds down ([`map_floor`]); allocation
//! rounds up ([`map_ceil`]) so that every block in the returned list is large
//! enough.
use super::{FLLEN, SLI, SLLEN, USIZE_BITS};

/// Find the free block list to store a free block of the specified size.
#[inline]
pub(super) fn map_floor(size: usize) -> Option<(usize, usize)> {
    debug_assert!(size >= SLLEN);
    let fl = USIZE_BITS - 1 - size.leading_zeros();
    let sl = size >> (fl - SLI);

    // The most significant one of `size` should be at `sl[SLI]`
    debug_assert!((sl >> SLI) == 1);

    // `fl` must be in a valid range
    if fl as usize >= FLLEN {
        return None;
    }

    Some((fl as usize, sl & (SLLEN - 1)))
}

/// Find the first free block list whose every item is at least as large
/// as the specified size.
#[inline]
pub(super) fn map_ceil(size: usize) -> Option<(usize, usize)> {
    debug_assert!(size >= SLLEN);
    let mut fl = USIZE_BITS - 1 - size.leading_zeros();
    let shift = fl - SLI;
    let mut sl = size >> shift;

    // Round up unless `size` is exactly the lower bound of a list
    sl += (sl << shift != size) as usize;

    debug_assert!((sl >> SLI) == 0b01 || (sl >> SLI) == 0b10);

    // if sl[SLI + 1] { fl += 1; sl = 0; }
    fl += (sl >> (SLI + 1)) as u32;

    if fl as usize >= FLLEN {
        return None;
    }

    Some((fl as usize, sl & (SLLEN - 1)))
}
