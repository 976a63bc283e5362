//! This crate implements a constant-time, good-fit dynamic memory allocator
//! in the TLSF (Two-Level Segregated Fit) family¹.
//!
//!  - **Allocation and deallocation operations are guaranteed to complete in
//!    constant time.** Free blocks are filed under a two-level size class
//!    directory whose bitmaps are searched with a single bit scan per level.
//!
//!  - **Bounded fragmentation.** Each power-of-two size range is split into
//!    four slots. A request is served from the first slot whose every block
//!    is large enough ("good fit"), which wastes about 1/32 of the allocated
//!    size on average.
//!
//!  - **The memory is provided by an application.** Arenas are registered
//!    explicitly with [`Heap::expand`]. The allocator never asks anyone for
//!    more memory, which keeps it usable on bare metal.
//!
//!  - **This crate supports `#![no_std]`.**
//!
//!  - **Not thread-safe.** Every operation takes `&mut self`. Wrap the heap
//!    in a lock of your choice to share it.
//!
//! <sub>¹ M. Masmano, I. Ripoll, A. Crespo and J. Real, "TLSF: a new dynamic
//! memory allocator for real-time systems," *Proceedings. 16th Euromicro
//! Conference on Real-Time Systems*, 2004. ECRTS 2004., Catania, Italy, 2004,
//! pp. 79-88, doi: 10.1109/EMRTS.2004.1311009.</sub>
//!
//! # Examples
//!
//! ```rust
//! use gfheap::Heap;
//! use std::mem::MaybeUninit;
//!
//! #[repr(align(16))]
//! struct Arena([MaybeUninit<u8>; 4096]);
//!
//! let mut arena = Arena([MaybeUninit::uninit(); 4096]);
//!
//! // Payloads are aligned to 8 bytes. `'pool` (elided here) is the arena's
//! // lifetime.
//! let mut heap: Heap<'_, 8> = Heap::new();
//! heap.expand(&mut arena.0);
//!
//! let ptr = heap.allocate(100).unwrap();
//! unsafe {
//!     ptr.as_ptr().write_bytes(0xab, 100);
//!
//!     // Grows in place if the next block is free, moves otherwise
//!     let ptr = heap.reallocate(Some(ptr), 200).unwrap();
//!     assert_eq!(*ptr.as_ptr().add(99), 0xab);
//!
//!     heap.deallocate(Some(ptr));
//! }
//!
//! assert_eq!(heap.verify(), Ok(()));
//! assert_eq!(heap.stats().free_blocks, 1);
//! ```
//!
//! # Details
//!
//! ## Block Layout
//!
//!  - Every block starts with a word holding its size. The two low bits are
//!    flags: whether the block is free, and whether the block *physically
//!    preceding* it is free.
//!
//!  - A free block stores its free list links after the size word and a
//!    pointer to itself in its last word. When the following block is
//!    deallocated, it reads that pointer to find and absorb its free
//!    predecessor without scanning.
//!
//!  - The end of each arena is capped by a zero-size sentinel block, which is
//!    never free. This keeps coalescing and in-place growth inside the arena.
//!
//! ## Misuse Detection
//!
//! Double frees, use after free, and corrupted boundary tags are caught by
//! assertions in debug builds. Enable the `strict` feature to keep them in
//! release builds. [`Heap::verify`] checks the whole directory on demand.
//!
#![no_std]

cfg_if::cfg_if! {
    if #[cfg(any(debug_assertions, feature = "strict"))] {
        // Checks an assumption that only a misbehaving caller can break
        macro_rules! misuse_assert {
            ($($tt:tt)*) => { assert!($($tt)*) };
        }
    } else {
        // Compiled out without `debug_assertions` or `strict`
        macro_rules! misuse_assert {
            ($($tt:tt)*) => { debug_assert!($($tt)*) };
        }
    }
}

mod heap;
mod int;
mod utils;

pub use self::heap::{Heap, HeapStats, VerifyError, FLLEN, SLLEN};

#[cfg(test)]
extern crate std;
