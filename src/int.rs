//! Bitmap integers used by the free-list directory.
use core::{fmt, ops};

/// An unsigned integer type usable as a directory bitmap.
pub(crate) trait BinInteger:
    Copy
    + Eq
    + fmt::Debug
    + ops::BitAnd<Output = Self>
    + ops::BitOr<Output = Self>
    + ops::Not<Output = Self>
    + ops::Shl<u32, Output = Self>
    + ops::Shr<u32, Output = Self>
{
    const ZERO: Self;
    const ONE: Self;
    const BITS: u32;

    fn trailing_zeros(self) -> u32;

    #[inline]
    fn get_bit(self, i: u32) -> bool {
        debug_assert!(i < Self::BITS);
        (self >> i) & Self::ONE != Self::ZERO
    }

    #[inline]
    fn set_bit(&mut self, i: u32) {
        debug_assert!(i < Self::BITS);
        *self = *self | (Self::ONE << i);
    }

    #[inline]
    fn clear_bit(&mut self, i: u32) {
        debug_assert!(i < Self::BITS);
        *self = *self & !(Self::ONE << i);
    }

    /// Find the lowest set bit at or above `start`. Returns `Self::BITS` if
    /// there's no such bit.
    #[inline]
    fn bit_scan_forward(self, start: u32) -> u32 {
        if start >= Self::BITS {
            Self::BITS
        } else {
            ((self >> start) << start).trailing_zeros()
        }
    }
}

macro_rules! impl_bin_integer {
    ($($ty:ty),*) => {$(
        impl BinInteger for $ty {
            const ZERO: Self = 0;
            const ONE: Self = 1;
            const BITS: u32 = <$ty>::BITS;

            #[inline]
            fn trailing_zeros(self) -> u32 {
                <$ty>::trailing_zeros(self)
            }
        }
    )*};
}

impl_bin_integer!(u8, u32);
