//! Consistency checks and statistics. Intended for tests and debugging, not
//! for hot paths.
use core::ptr::NonNull;

use super::{
    block::{
        next_phys_block, payload_for_block, prev_phys_block, FreeBlockHdr, SIZE_FREE,
        SIZE_PREV_FREE, SIZE_SIZE_MASK,
    },
    map::map_floor,
    Heap, FLLEN, SLLEN,
};
use crate::int::BinInteger;

/// An inconsistency found by [`Heap::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("class {class}: `listmap` disagrees with `slotmaps[{class}] = {slotmap:#06b}`")]
    ListmapMismatch { class: usize, slotmap: u8 },
    #[error("class {class}: `slotmaps[{class}] = {slotmap:#010b}` marks nonexistent slots")]
    InvalidSlot { class: usize, slotmap: u8 },
    #[error("list ({class}, {slot}): emptiness ({empty}) disagrees with its bitmap bit")]
    SlotmapMismatch {
        class: usize,
        slot: usize,
        empty: bool,
    },
    #[error("block {addr:#x} in list ({class}, {slot}) is not marked free")]
    NotFree {
        addr: usize,
        class: usize,
        slot: usize,
    },
    #[error("block {addr:#x} has an invalid size {size}")]
    InvalidSize { addr: usize, size: usize },
    #[error("block {addr:#x} of size {size} is filed under the wrong list ({class}, {slot})")]
    Misfiled {
        addr: usize,
        size: usize,
        class: usize,
        slot: usize,
    },
    #[error("free list links around block {addr:#x} are inconsistent")]
    BrokenLink { addr: usize },
    #[error("free block {addr:#x} is physically adjacent to another free block")]
    AdjacentFree { addr: usize },
    #[error("the block following free block {addr:#x} lacks `PREV_FREE`")]
    MissingPrevFree { addr: usize },
    #[error("the footer of free block {addr:#x} doesn't point back to it")]
    BadFooter { addr: usize },
    #[error("block {addr:#x} is not aligned to {align} bytes")]
    Misaligned { addr: usize, align: usize },
}

/// Free space statistics reported by [`Heap::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// The number of free blocks.
    pub free_blocks: usize,
    /// The total size of the free blocks, including their headers.
    pub free_bytes: usize,
    /// The size of the largest free block, including its header.
    pub largest_free_block: usize,
}

impl<const ALIGN: usize> Heap<'_, ALIGN> {
    /// Check the directory and every free block for consistency.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in linear time (`O(number of free blocks)`).
    pub fn verify(&self) -> Result<(), VerifyError> {
        let result = self.verify_directory();
        if let Err(e) = &result {
            log::debug!("verify: {}", e);
        }
        result
    }

    fn verify_directory(&self) -> Result<(), VerifyError> {
        for class in 0..FLLEN {
            let slotmap = self.slotmaps[class];
            if (slotmap != 0) != self.listmap.get_bit(class as u32) {
                return Err(VerifyError::ListmapMismatch { class, slotmap });
            }
            if slotmap >> SLLEN != 0 {
                return Err(VerifyError::InvalidSlot { class, slotmap });
            }

            for slot in 0..SLLEN {
                let head = self.first_free[class][slot];
                if head.is_none() == slotmap.get_bit(slot as u32) {
                    return Err(VerifyError::SlotmapMismatch {
                        class,
                        slot,
                        empty: head.is_none(),
                    });
                }

                let mut prev_free = None;
                let mut cursor = head;
                while let Some(block) = cursor {
                    // Safety: Every block reachable from the directory is
                    //         owned by `self`
                    unsafe { self.verify_free_block(block, prev_free, class, slot)? };
                    prev_free = Some(block);
                    cursor = unsafe { block.as_ref().next_free };
                }
            }
        }

        Ok(())
    }

    /// # Safety
    ///
    /// `block` must be reachable from the directory.
    unsafe fn verify_free_block(
        &self,
        block: NonNull<FreeBlockHdr>,
        prev_free: Option<NonNull<FreeBlockHdr>>,
        class: usize,
        slot: usize,
    ) -> Result<(), VerifyError> {
        let addr = block.as_ptr() as usize;
        let size_and_flags = block.as_ref().common.size;
        let size = size_and_flags & SIZE_SIZE_MASK;

        if (size_and_flags & SIZE_FREE) == 0 {
            return Err(VerifyError::NotFree { addr, class, slot });
        }
        if size < Self::MIN_BLOCK_SIZE || size % Self::GRANULARITY != 0 {
            return Err(VerifyError::InvalidSize { addr, size });
        }
        if map_floor(size) != Some((class, slot)) {
            return Err(VerifyError::Misfiled {
                addr,
                size,
                class,
                slot,
            });
        }
        if block.as_ref().prev_free != prev_free {
            return Err(VerifyError::BrokenLink { addr });
        }

        let payload = payload_for_block(block.cast(), Self::GRANULARITY).as_ptr() as usize;
        if addr % Self::GRANULARITY != 0 || payload % ALIGN != 0 {
            return Err(VerifyError::Misaligned { addr, align: ALIGN });
        }

        // There should never be two consecutive free blocks
        if (size_and_flags & SIZE_PREV_FREE) != 0 {
            return Err(VerifyError::AdjacentFree { addr });
        }

        let next = next_phys_block(block.cast());
        let next_size_and_flags = (*next.as_ptr()).size;
        if (next_size_and_flags & SIZE_FREE) != 0 {
            return Err(VerifyError::AdjacentFree { addr });
        }

        // The next block needs to know we're free
        if (next_size_and_flags & SIZE_PREV_FREE) == 0 {
            return Err(VerifyError::MissingPrevFree { addr });
        }
        if prev_phys_block(next) != block.cast() {
            return Err(VerifyError::BadFooter { addr });
        }

        Ok(())
    }

    /// Collect free space statistics by walking every free list.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in linear time (`O(number of free blocks)`).
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats::default();

        for &head in self.first_free.iter().flatten() {
            let mut cursor = head;
            while let Some(block) = cursor {
                // Safety: Every block reachable from the directory is owned
                //         by `self`
                let (size, next_free) = unsafe {
                    let hdr = block.as_ref();
                    (hdr.common.size & SIZE_SIZE_MASK, hdr.next_free)
                };
                stats.free_blocks += 1;
                stats.free_bytes += size;
                stats.largest_free_block = stats.largest_free_block.max(size);
                cursor = next_free;
            }
        }

        stats
    }
}
