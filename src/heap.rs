//! The allocator core
use const_default::ConstDefault;
use core::{
    debug_assert, debug_assert_eq,
    hint::unreachable_unchecked,
    marker::PhantomData,
    mem::{self, MaybeUninit},
    ptr::NonNull,
};

use crate::{int::BinInteger, utils};

mod block;
mod map;
mod verify;

pub use self::verify::{HeapStats, VerifyError};

use self::block::{
    block_at_offset, block_for_payload, next_phys_block, payload_for_block, prev_phys_block,
    write_footer, BlockHdr, FreeBlockHdr, FREE_BLOCK_MIN_LEN, SIZE_FREE, SIZE_PREV_FREE,
    SIZE_SIZE_MASK,
};
use self::map::{map_ceil, map_floor};

/// The number of first-level size classes.
pub const FLLEN: usize = 32;
/// The number of second-level slots in each first-level class.
pub const SLLEN: usize = 4;

/// `SLLEN.log2()`
const SLI: u32 = SLLEN.trailing_zeros();

const USIZE_BITS: u32 = usize::BITS;

type FLBitmap = u32;
type SLBitmap = u8;

#[doc = svgbobdoc::transform!(
/// The heap (top-level) data structure.
///
/// # Data Structure Overview
///
/// <center>
/// ```svgbob
///   First level
///                                                                   FLLEN = 32
///                          ,-----+-----+-----+-----+-----+-----+-----+-----,
///          listmap: u32 =  | ... |  0  |  0  |  1  |  0  |  0  |  0  | ... |
///                          +-----+-----+-----+-----+-----+-----+-----+-----+
///                min size  |     | 2¹¹ | 2¹⁰ |  2⁹ |  2⁸ |  2⁷ |  2⁶ |     |
///                          '-----+-----+-----+--+--+-----+-----+-----+-----'
///                                               |
/// ╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶|╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶
///   Second Level                                |
///                                               v                  SLLEN = 4
///                                         ,-----+-----+-----+-----,
///                "slotmaps[9]: u8" =      |  0  |  1  |  0  |  0  |
///                                         +-----+-----+-----+-----+
///                    min size 2⁹(1+n/4)   |  3  |  2  |  1  |  0  |
///                                         +-----+-----+-----+-----+
///                             first_free  |     |  O  |     |     |
///                                         '-----+--|--+-----+-----'
///                                                  |
///                                                  |  size = 768..896
///                                                  |
/// ╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶|╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶
///   Free blocks                                    |
///                                                  |
///             ,------------------------------------'
///             | ,----+---+---+---------+--,    ,----+---+---+---------+--,
///             '-+>size| O | O |         |O |----+>size| O |   |         |O |
///               +----+-|-+---+---------+|-+    +----+---+---+---------+|-+
///               ^      |                |      ^                       |
///               |      '----------------+------'                       |
///               '-----------------------'      ^-----------------------'
///                   800 bytes   footer             832 bytes   footer
/// ```
/// </center>
///
/// # Properties
///
/// Every block is aligned to [`Self::GRANULARITY`] bytes, which is also the
/// length of the header preceding each allocation. The payload is therefore
/// aligned to `ALIGN` bytes, which must be 4, 8, or 16.
///
/// Free blocks are filed under `(floor(log2(size)), slot)` where the four
/// slots split each power-of-two range into quarters. An allocation is
/// served from the first non-empty list whose every block is large enough,
/// so the search never walks a list. The wasted space is bounded by a
/// quarter of the class width.
///
/// The maximum block size is [`Self::MAX_BLOCK_SIZE`].
///
)]
#[derive(Debug)]
pub struct Heap<'pool, const ALIGN: usize = 8> {
    listmap: FLBitmap,
    slotmaps: [SLBitmap; FLLEN],
    first_free: [[Option<NonNull<FreeBlockHdr>>; SLLEN]; FLLEN],
    _phantom: PhantomData<&'pool mut ()>,
}

// Safety: All memory block headers directly or indirectly referenced by a
//         particular instance of `Heap` are logically owned by that `Heap` and
//         have no interior mutability, so these are safe.
unsafe impl<const ALIGN: usize> Send for Heap<'_, ALIGN> {}

unsafe impl<const ALIGN: usize> Sync for Heap<'_, ALIGN> {}

impl<const ALIGN: usize> Default for Heap<'_, ALIGN> {
    fn default() -> Self {
        Self::INIT
    }
}

impl<const ALIGN: usize> ConstDefault for Heap<'_, ALIGN> {
    const DEFAULT: Self = Self::INIT;
}

impl<'pool, const ALIGN: usize> Heap<'pool, ALIGN> {
    /// An empty heap.
    pub const INIT: Self = Self {
        listmap: FLBitmap::ZERO,
        slotmaps: [SLBitmap::ZERO; FLLEN],
        first_free: [[None; SLLEN]; FLLEN],
        _phantom: {
            let () = Self::VALID;
            PhantomData
        },
    };

    /// Evaluates successfully if the parameters are valid.
    const VALID: () = assert!(
        ALIGN == 4 || ALIGN == 8 || ALIGN == 16,
        "`ALIGN` must be 4, 8, or 16"
    );

    /// The block alignment and the length of a used block's header.
    pub const GRANULARITY: usize = utils::max(ALIGN, mem::size_of::<usize>());

    /// The size of the smallest block, which must hold a free block's
    /// header, list links, and footer.
    pub const MIN_BLOCK_SIZE: usize = utils::round_up(FREE_BLOCK_MIN_LEN, Self::GRANULARITY);

    /// The size of the largest block representable by the size classes.
    pub const MAX_BLOCK_SIZE: usize = match 1usize.checked_shl(FLLEN as u32) {
        Some(x) => x - Self::GRANULARITY,
        None => usize::MAX & !(Self::GRANULARITY - 1),
    };

    /// The length of the smallest arena [`Self::expand`] accepts.
    pub const MIN_ARENA_SIZE: usize = Self::MIN_BLOCK_SIZE + Self::GRANULARITY;

    /// Construct an empty heap.
    ///
    /// `ALIGN` must be 4, 8, or 16:
    ///
    /// ```rust,compile_fail
    /// use gfheap::Heap;
    ///
    /// let heap: Heap<'_, 3> = Heap::new();
    /// ```
    #[inline]
    pub const fn new() -> Self {
        Self::INIT
    }

    /// Calculate the size of a block able to hold `size` bytes of payload.
    #[inline]
    fn needed_size(size: usize) -> Option<usize> {
        let needed = size.checked_add(Self::GRANULARITY)?;
        utils::checked_round_up(utils::max(needed, Self::MIN_BLOCK_SIZE), Self::GRANULARITY)
    }

    /// Insert the specified free block to the corresponding free block list.
    ///
    /// Updates `FreeBlockHdr::{prev_free, next_free}`.
    ///
    /// # Safety
    ///
    ///  - `*block.as_ptr()` must be owned by `self`.
    ///  - `size` must have a corresponding free list, which does not currently
    ///    contain `block`.
    ///
    unsafe fn link_free_block(&mut self, mut block: NonNull<FreeBlockHdr>, size: usize) {
        let (fl, sl) = map_floor(size).unwrap_or_else(|| unreachable_unchecked());
        let first_free = &mut self.first_free[fl][sl];
        let next_free = mem::replace(first_free, Some(block));
        block.as_mut().next_free = next_free;
        block.as_mut().prev_free = None;

        if let Some(mut next_free) = next_free {
            next_free.as_mut().prev_free = Some(block);
        }

        self.listmap.set_bit(fl as u32);
        self.slotmaps[fl].set_bit(sl as u32);
    }

    /// Remove the specified free block from the corresponding free block list.
    ///
    /// # Safety
    ///
    ///  - `size` must represent the specified free block's size.
    ///  - The free block must be currently included in a free block list.
    ///
    unsafe fn unlink_free_block(&mut self, mut block: NonNull<FreeBlockHdr>, size: usize) {
        let next_free = block.as_mut().next_free;
        let prev_free = block.as_mut().prev_free;

        if let Some(mut next_free) = next_free {
            next_free.as_mut().prev_free = prev_free;
        }

        if let Some(mut prev_free) = prev_free {
            prev_free.as_mut().next_free = next_free;
        } else {
            let (fl, sl) = map_floor(size).unwrap_or_else(|| unreachable_unchecked());
            let first_free = &mut self.first_free[fl][sl];

            debug_assert_eq!(*first_free, Some(block));
            *first_free = next_free;

            if next_free.is_none() {
                // The free list is now empty - update the bitmap
                self.slotmaps[fl].clear_bit(sl as u32);
                if self.slotmaps[fl] == SLBitmap::ZERO {
                    self.listmap.clear_bit(fl as u32);
                }
            }
        }
    }

    /// Register a new arena specified by a slice pointer.
    ///
    /// The last [`Self::GRANULARITY`] bytes of the arena hold a sentinel
    /// block, which keeps coalescing from crossing the arena's end. The rest
    /// becomes a single free block.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in constant time.
    ///
    /// # Safety
    ///
    /// The memory block will be considered owned by `self`. The memory block
    /// must outlive `self` and must not overlap any other arena.
    ///
    /// # Panics
    ///
    /// This method panics unless all of the following hold:
    ///
    ///  - The arena starts at a [`Self::GRANULARITY`]-byte boundary.
    ///  - Its length is a multiple of [`Self::GRANULARITY`].
    ///  - Its length is at least [`Self::MIN_ARENA_SIZE`] and at most
    ///    `MAX_BLOCK_SIZE + GRANULARITY`.
    ///
    pub unsafe fn expand_ptr(&mut self, arena: NonNull<[u8]>) {
        let len = arena.len();
        let start = arena.cast::<u8>();

        assert!(
            start.as_ptr() as usize % Self::GRANULARITY == 0,
            "arena {:p} is not aligned to {} bytes",
            start,
            Self::GRANULARITY
        );
        assert!(
            len % Self::GRANULARITY == 0,
            "arena length {} is not a multiple of {}",
            len,
            Self::GRANULARITY
        );
        assert!(
            len >= Self::MIN_ARENA_SIZE,
            "arena length {} is smaller than {}",
            len,
            Self::MIN_ARENA_SIZE
        );
        assert!(
            len - Self::GRANULARITY <= Self::MAX_BLOCK_SIZE,
            "arena length {} exceeds the maximum block size",
            len
        );

        let root = start.cast::<BlockHdr>();
        let root_size = len - Self::GRANULARITY;

        // Carve out the sentinel. Its predecessor, the root block, is free.
        let sentinel = block_at_offset(root, root_size);
        (*sentinel.as_ptr()).size = SIZE_PREV_FREE;

        (*root.as_ptr()).size = root_size | SIZE_FREE;
        write_footer(root);
        self.link_free_block(root.cast(), root_size);

        log::trace!(
            "expand: arena {:p}..{:p}, free block of {} bytes",
            start,
            start.as_ptr().add(len),
            root_size
        );
    }

    /// Register a new arena specified by a slice.
    ///
    /// # Examples
    ///
    /// ```
    /// use gfheap::Heap;
    /// use std::mem::MaybeUninit;
    ///
    /// #[repr(align(16))]
    /// struct Arena([MaybeUninit<u8>; 1024]);
    ///
    /// let mut arena = Arena([MaybeUninit::uninit(); 1024]);
    /// let mut heap: Heap<'_, 8> = Heap::new();
    /// heap.expand(&mut arena.0);
    /// assert!(heap.allocate(512).is_some());
    /// ```
    ///
    /// The registered arena must outlive `self`:
    ///
    /// ```rust,compile_fail
    /// use gfheap::Heap;
    /// use std::mem::MaybeUninit;
    ///
    /// #[repr(align(16))]
    /// struct Arena([MaybeUninit<u8>; 1024]);
    ///
    /// let mut heap: Heap<'_, 8> = Heap::new();
    /// let mut arena = Arena([MaybeUninit::uninit(); 1024]);
    /// heap.expand(&mut arena.0);
    /// drop(arena); // dropping the arena first is not allowed
    /// drop(heap);
    /// ```
    ///
    /// # Panics
    ///
    /// See [`Self::expand_ptr`].
    #[inline]
    pub fn expand(&mut self, arena: &'pool mut [MaybeUninit<u8>]) {
        // Safety: `arena` is a mutable reference, which guarantees the absence
        // of aliasing references. Being `'pool` means it will outlive `self`.
        unsafe {
            self.expand_ptr(NonNull::new_unchecked(
                arena as *mut [MaybeUninit<u8>] as *mut [u8],
            ))
        };
    }

    /// Calculate the minimum length of an arena that a fresh heap needs to
    /// serve an allocation of `size` bytes. Returns `None` if no arena can.
    ///
    /// The root block then has exactly the needed size. It's filed under the
    /// list [`Self::allocate`] falls back to when no list guarantees a fit.
    pub fn arena_size_to_contain_allocation(size: usize) -> Option<usize> {
        let block_size = Self::needed_size(size)?;
        debug_assert_eq!(block_size % Self::GRANULARITY, 0);

        if block_size > Self::MAX_BLOCK_SIZE {
            return None;
        }

        block_size.checked_add(Self::GRANULARITY)
    }

    /// Attempt to allocate a block of memory holding at least `size` bytes.
    ///
    /// Returns the starting address of the allocated memory block on success;
    /// `None` otherwise. The address is aligned to `ALIGN` bytes.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in constant time.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let Some(needed) = Self::needed_size(size) else {
            log::trace!("allocate({}): size overflow", size);
            return None;
        };

        // Safety: Every block in the directory is owned by `self`
        unsafe {
            let Some(block) = self.search_free_block(needed) else {
                log::trace!("allocate({}): no free block of {} bytes", size, needed);
                return None;
            };

            let block_size = block.as_ref().common.size & SIZE_SIZE_MASK;
            debug_assert!((block.as_ref().common.size & SIZE_FREE) != 0);
            debug_assert!(block_size >= needed);

            self.unlink_free_block(block, block_size);

            let block = block.cast::<BlockHdr>();
            self.use_free_block(block, needed);

            Some(payload_for_block(block, Self::GRANULARITY))
        }
    }

    /// Like [`Self::allocate`], but the first `size` bytes of the returned
    /// memory block are zero-filled.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in linear time (`O(size)`).
    pub fn allocate_zeroed(&mut self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.allocate(size)?;
        // Safety: The payload is at least `size` bytes long
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Some(ptr)
    }

    /// Find a free block of at least `min_size` bytes.
    ///
    /// # Safety
    ///
    /// The directory must be consistent.
    #[inline]
    unsafe fn search_free_block(&self, min_size: usize) -> Option<NonNull<FreeBlockHdr>> {
        if let Some((fl, sl)) = self.search_suitable_free_block_list_for_allocation(min_size) {
            let block = self.first_free[fl][sl];
            debug_assert!(block.is_some());
            return block;
        }

        // No list guarantees a fit. The list `min_size` itself would be
        // filed under may still start with a large enough block.
        let (fl, sl) = map_floor(min_size)?;
        let block = self.first_free[fl][sl]?;
        if (block.as_ref().common.size & SIZE_SIZE_MASK) >= min_size {
            Some(block)
        } else {
            None
        }
    }

    /// Search for a non-empty free block list for allocation.
    #[inline]
    fn search_suitable_free_block_list_for_allocation(
        &self,
        min_size: usize,
    ) -> Option<(usize, usize)> {
        let (mut fl, mut sl) = map_ceil(min_size)?;

        // Search in range `(fl, sl..SLLEN)`
        sl = self.slotmaps[fl].bit_scan_forward(sl as u32) as usize;
        if sl < SLLEN {
            debug_assert!(self.slotmaps[fl].get_bit(sl as u32));

            return Some((fl, sl));
        }

        // Search in range `(fl + 1.., ..)`
        fl = self.listmap.bit_scan_forward(fl as u32 + 1) as usize;
        if fl < FLLEN {
            debug_assert!(self.listmap.get_bit(fl as u32));

            sl = self.slotmaps[fl].trailing_zeros() as usize;
            if sl >= SLLEN {
                debug_assert!(false);
                unsafe { unreachable_unchecked() };
            }

            debug_assert!(self.slotmaps[fl].get_bit(sl as u32));
            Some((fl, sl))
        } else {
            None
        }
    }

    /// Turn an unlinked free block into a used block of `needed` bytes,
    /// returning the excess to the directory if it can form a block.
    ///
    /// # Safety
    ///
    /// `block` must be a free block owned by `self`, already removed from the
    /// directory, and at least `needed` bytes long.
    #[inline]
    unsafe fn use_free_block(&mut self, block: NonNull<BlockHdr>, needed: usize) {
        let size_and_flags = (*block.as_ptr()).size;
        let excess = (size_and_flags & SIZE_SIZE_MASK) - needed;

        // Invariant: No two adjacent free blocks
        debug_assert!((size_and_flags & SIZE_PREV_FREE) == 0);

        if excess >= Self::MIN_BLOCK_SIZE {
            // The allocation partially fills this free block. Create a new
            // free block header in the remainder. The next block keeps its
            // `SIZE_PREV_FREE` because its predecessor is still free.
            (*block.as_ptr()).size = needed | (size_and_flags & SIZE_PREV_FREE);

            let rest = block_at_offset(block, needed);
            (*rest.as_ptr()).size = excess | SIZE_FREE;
            debug_assert!(((*next_phys_block(rest).as_ptr()).size & SIZE_PREV_FREE) != 0);
            write_footer(rest);
            self.link_free_block(rest.cast(), excess);
        } else {
            // The allocation completely fills this free block
            (*block.as_ptr()).size = size_and_flags & !SIZE_FREE;

            let next = next_phys_block(block);
            debug_assert!(((*next.as_ptr()).size & SIZE_PREV_FREE) != 0);
            (*next.as_ptr()).size &= !SIZE_PREV_FREE;
        }
    }

    /// Deallocate a previously allocated memory block. Does nothing if `ptr`
    /// is `None`.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in constant time.
    ///
    /// # Safety
    ///
    ///  - `ptr` must denote a memory block previously allocated via `self`
    ///    and not deallocated since.
    ///
    pub unsafe fn deallocate(&mut self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else { return };
        misuse_assert!(
            ptr.as_ptr() as usize % Self::GRANULARITY == 0,
            "{:p} is not an allocation",
            ptr
        );

        let mut block = block_for_payload(ptr, Self::GRANULARITY);
        let size_and_flags = (*block.as_ptr()).size;
        let mut size = size_and_flags & SIZE_SIZE_MASK;
        misuse_assert!((size_and_flags & SIZE_FREE) == 0, "double free of {:p}", ptr);
        misuse_assert!(size >= Self::MIN_BLOCK_SIZE, "{:p} is not an allocation", ptr);

        // Merge with the previous block if it's a free block
        if (size_and_flags & SIZE_PREV_FREE) != 0 {
            let prev_phys_block = prev_phys_block(block);
            let prev_size_and_flags = (*prev_phys_block.as_ptr()).size;
            misuse_assert!(
                (prev_size_and_flags & SIZE_FREE) != 0,
                "{:p}: the previous block is tagged free but isn't",
                ptr
            );
            // Invariant: No two adjacent free blocks
            debug_assert!((prev_size_and_flags & SIZE_PREV_FREE) == 0);

            let prev_size = prev_size_and_flags & SIZE_SIZE_MASK;
            self.unlink_free_block(prev_phys_block.cast(), prev_size);
            size += prev_size;

            // Move `block` to where `prev_phys_block` is located
            block = prev_phys_block;
        }

        // Merge with the next block if it's a free block. This must come
        // second so that the next block is found from the merged block.
        let next_phys_block = block_at_offset(block, size);
        let next_size_and_flags = (*next_phys_block.as_ptr()).size;
        if (next_size_and_flags & SIZE_FREE) != 0 {
            misuse_assert!(
                (next_size_and_flags & SIZE_PREV_FREE) == 0,
                "{:p}: the next block thinks this block is free",
                ptr
            );
            let next_size = next_size_and_flags & SIZE_SIZE_MASK;
            self.unlink_free_block(next_phys_block.cast(), next_size);
            size += next_size;
        } else {
            // Its predecessor was in use until now
            misuse_assert!(
                (next_size_and_flags & SIZE_PREV_FREE) == 0,
                "{:p}: the next block's boundary tag is corrupted",
                ptr
            );
        }

        // Tell the new next block that its predecessor is free
        let new_next_phys_block = block_at_offset(block, size);
        debug_assert!(((*new_next_phys_block.as_ptr()).size & SIZE_FREE) == 0);
        (*new_next_phys_block.as_ptr()).size |= SIZE_PREV_FREE;

        // The block's predecessor can't be free at this point
        (*block.as_ptr()).size = size | SIZE_FREE;
        write_footer(block);
        self.link_free_block(block.cast(), size);
    }

    /// Shrink or grow a previously allocated memory block.
    ///
    ///  - If `ptr` is `None`, this is equivalent to
    ///    `self.allocate(new_size)`.
    ///  - If `new_size` is zero, this is equivalent to
    ///    `self.deallocate(ptr)` and returns `None`.
    ///
    /// Otherwise returns the new starting address of the memory block on
    /// success. The first `min(old_size, new_size)` bytes are preserved. On
    /// failure, returns `None` and leaves the original memory block intact.
    ///
    /// # Time Complexity
    ///
    /// This method completes in constant time if the memory block can be
    /// resized in place. Otherwise it completes in linear time
    /// (`O(min(old_size, new_size))`).
    ///
    /// # Safety
    ///
    ///  - `ptr` must be `None` or denote a memory block previously allocated
    ///    via `self` and not deallocated since.
    ///
    pub unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let Some(ptr) = ptr else {
            return self.allocate(new_size);
        };
        misuse_assert!(
            ptr.as_ptr() as usize % Self::GRANULARITY == 0,
            "{:p} is not an allocation",
            ptr
        );

        if new_size == 0 {
            self.deallocate(Some(ptr));
            return None;
        }

        let block = block_for_payload(ptr, Self::GRANULARITY);
        let old_size_and_flags = (*block.as_ptr()).size;
        misuse_assert!(
            (old_size_and_flags & SIZE_FREE) == 0,
            "use after free of {:p}",
            ptr
        );

        // Fail if the new size is not representable
        let needed = Self::needed_size(new_size)?;

        // First try to shrink or grow the block toward the end (i.e., preseving
        // the starting address).
        if self.reallocate_without_moving(block, needed) {
            return Some(ptr);
        }

        // Allocate a whole new memory block. The original one stays intact
        // if this fails.
        let new_ptr = self.allocate(new_size)?;

        let old_payload_size = (old_size_and_flags & SIZE_SIZE_MASK) - Self::GRANULARITY;
        core::ptr::copy_nonoverlapping(
            ptr.as_ptr(),
            new_ptr.as_ptr(),
            old_payload_size.min(new_size),
        );

        self.deallocate(Some(ptr));

        Some(new_ptr)
    }

    /// A subroutine of [`Self::reallocate`]. Attempts to shrink or grow the
    /// block toward the end (i.e., preseving the starting address). Returns
    /// `false` if growing needs more than the next free block provides.
    #[inline]
    unsafe fn reallocate_without_moving(&mut self, block: NonNull<BlockHdr>, needed: usize) -> bool {
        let size_and_flags = (*block.as_ptr()).size;
        let mut size = size_and_flags & SIZE_SIZE_MASK;

        if needed > size {
            // Grow into the next free block. Fail if there isn't such a block.
            let next_phys_block = next_phys_block(block);
            let next_size_and_flags = (*next_phys_block.as_ptr()).size;
            if (next_size_and_flags & SIZE_FREE) == 0 {
                return false;
            }

            debug_assert!((next_size_and_flags & SIZE_PREV_FREE) == 0);
            let next_size = next_size_and_flags & SIZE_SIZE_MASK;
            if size + next_size < needed {
                // Can't fit
                return false;
            }

            self.unlink_free_block(next_phys_block.cast(), next_size);
            size += next_size;

            // The block after the absorbed one now follows a used block
            let new_next_phys_block = block_at_offset(block, size);
            (*new_next_phys_block.as_ptr()).size &= !SIZE_PREV_FREE;

            (*block.as_ptr()).size = size | (size_and_flags & SIZE_PREV_FREE);
        }

        self.trim_used_block(block, needed);

        true
    }

    /// Cut a used block down to `needed` bytes, returning the excess to the
    /// directory if it can form a block. The excess is merged with the next
    /// block if that one is free.
    ///
    /// # Safety
    ///
    /// `block` must be a used block owned by `self`, at least `needed` bytes
    /// long.
    unsafe fn trim_used_block(&mut self, block: NonNull<BlockHdr>, needed: usize) {
        let size_and_flags = (*block.as_ptr()).size;
        let size = size_and_flags & SIZE_SIZE_MASK;
        debug_assert!(size >= needed);

        let excess = size - needed;
        if excess < Self::MIN_BLOCK_SIZE {
            // No size change
            return;
        }

        (*block.as_ptr()).size = needed | (size_and_flags & SIZE_PREV_FREE);

        // We will create a new free block at this address
        let new_free_block = block_at_offset(block, needed);
        let mut new_free_block_size = excess;

        let next_phys_block = block_at_offset(new_free_block, excess);
        let next_size_and_flags = (*next_phys_block.as_ptr()).size;
        if (next_size_and_flags & SIZE_FREE) != 0 {
            // Then we can merge this existing free block (`next_phys_block`)
            // into the new one (`new_free_block`). The block following it
            // already has `SIZE_PREV_FREE`.
            let next_size = next_size_and_flags & SIZE_SIZE_MASK;
            self.unlink_free_block(next_phys_block.cast(), next_size);
            new_free_block_size += next_size;
        } else {
            // We can't merge an used block (`next_phys_block`) and
            // a free block (`new_free_block`).
            (*next_phys_block.as_ptr()).size |= SIZE_PREV_FREE;
        }

        (*new_free_block.as_ptr()).size = new_free_block_size | SIZE_FREE;
        write_footer(new_free_block);
        self.link_free_block(new_free_block.cast(), new_free_block_size);
    }

    /// Get the number of bytes the caller may use in an allocated memory
    /// block. This is at least the requested size.
    ///
    /// # Safety
    ///
    ///  - `ptr` must denote a memory block previously allocated via `self`
    ///    and not deallocated since.
    ///
    #[inline]
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        misuse_assert!(
            ptr.as_ptr() as usize % Self::GRANULARITY == 0,
            "{:p} is not an allocation",
            ptr
        );
        let block = block_for_payload(ptr, Self::GRANULARITY);
        let size_and_flags = (*block.as_ptr()).size;
        misuse_assert!(
            (size_and_flags & SIZE_FREE) == 0,
            "use after free of {:p}",
            ptr
        );
        (size_and_flags & SIZE_SIZE_MASK) - Self::GRANULARITY
    }
}
