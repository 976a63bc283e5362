//! In-place block headers and footers.
//!
//! Every function that turns an address plus an offset into a block header
//! lives here. The rest of the crate walks the physical block sequence only
//! through [`next_phys_block`], [`prev_phys_block`], [`block_for_payload`]
//! and [`payload_for_block`].
use core::{mem, ptr::NonNull};

/// The header of a memory block.
#[repr(C)]
#[derive(Debug)]
pub(super) struct BlockHdr {
    /// The size of the whole memory block, including the header.
    ///
    ///  - `bit[0]` ([`SIZE_FREE`]) indicates whether the block is free.
    ///
    ///  - `bit[1]` ([`SIZE_PREV_FREE`]) indicates whether the block
    ///    *physically preceding* this one is free. When it's set, the last
    ///    word of the preceding block holds a pointer to its header.
    ///
    ///  - `bit[2..]` ([`SIZE_SIZE_MASK`]) represents the size. A sentinel
    ///    block terminating an arena has size zero.
    ///
    pub size: usize,
}

/// The header of a free memory block.
#[repr(C)]
#[derive(Debug)]
pub(super) struct FreeBlockHdr {
    pub common: BlockHdr,
    pub next_free: Option<NonNull<FreeBlockHdr>>,
    pub prev_free: Option<NonNull<FreeBlockHdr>>,
}

/// The bit of [`BlockHdr::size`] indicating whether the block is free.
pub(super) const SIZE_FREE: usize = 1;
/// The bit of [`BlockHdr::size`] indicating whether the previous block is
/// free.
pub(super) const SIZE_PREV_FREE: usize = 2;
/// The bits of [`BlockHdr::size`] indicating the block's size.
pub(super) const SIZE_SIZE_MASK: usize = !(SIZE_FREE | SIZE_PREV_FREE);

/// The length of the back-pointer stored in the last word of a free block.
const FOOTER_LEN: usize = mem::size_of::<NonNull<BlockHdr>>();

/// The number of bytes a free block needs for its header, links, and footer.
pub(super) const FREE_BLOCK_MIN_LEN: usize = mem::size_of::<FreeBlockHdr>() + FOOTER_LEN;

/// Get the header located `offset` bytes after `block`.
///
/// # Safety
///
/// The resulting address must lie in the same arena as `block`.
#[inline]
pub(super) unsafe fn block_at_offset(block: NonNull<BlockHdr>, offset: usize) -> NonNull<BlockHdr> {
    NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(offset)).cast()
}

/// Get the block physically following `block`.
///
/// # Safety
///
/// `block` must be a valid, non-sentinel block header.
#[inline]
pub(super) unsafe fn next_phys_block(block: NonNull<BlockHdr>) -> NonNull<BlockHdr> {
    let size = (*block.as_ptr()).size & SIZE_SIZE_MASK;
    debug_assert_ne!(size, 0, "a sentinel has no next block");
    block_at_offset(block, size)
}

/// Get the block physically preceding `block` by reading the footer the
/// preceding block left just before `block`.
///
/// # Safety
///
/// `block`'s `SIZE_PREV_FREE` must be set and telling the truth.
#[inline]
pub(super) unsafe fn prev_phys_block(block: NonNull<BlockHdr>) -> NonNull<BlockHdr> {
    debug_assert!((*block.as_ptr()).size & SIZE_PREV_FREE != 0);
    block
        .as_ptr()
        .cast::<u8>()
        .sub(FOOTER_LEN)
        .cast::<NonNull<BlockHdr>>()
        .read()
}

/// Store a pointer to `block` in its last word so that the following block
/// can find it.
///
/// # Safety
///
/// `block` must be a free block whose size field is up-to-date.
#[inline]
pub(super) unsafe fn write_footer(block: NonNull<BlockHdr>) {
    let size = (*block.as_ptr()).size & SIZE_SIZE_MASK;
    debug_assert!(size >= FREE_BLOCK_MIN_LEN);
    block
        .as_ptr()
        .cast::<u8>()
        .add(size - FOOTER_LEN)
        .cast::<NonNull<BlockHdr>>()
        .write(block);
}

/// Find the header of an allocation returned by the allocator.
///
/// # Safety
///
/// `ptr` must be a payload pointer produced by [`payload_for_block`] with the
/// same `hdr_len`.
#[inline]
pub(super) unsafe fn block_for_payload(ptr: NonNull<u8>, hdr_len: usize) -> NonNull<BlockHdr> {
    NonNull::new_unchecked(ptr.as_ptr().sub(hdr_len)).cast()
}

/// Get the payload pointer of a used block.
///
/// # Safety
///
/// `block` must be a valid block header spanning more than `hdr_len` bytes.
#[inline]
pub(super) unsafe fn payload_for_block(block: NonNull<BlockHdr>, hdr_len: usize) -> NonNull<u8> {
    NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(hdr_len))
}
