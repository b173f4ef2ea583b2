//! The in-arena block layout.
//!
//! An arena is one contiguous OS mapping carved into blocks, each a fixed
//! header in front of its payload. Blocks chain through sizes rather than
//! pointers: `size_curr` reaches the right neighbour, the `size_prev`
//! boundary tag reaches the left one. Sizes are ALIGN-multiples, which frees
//! the two low bits of `size_curr` for the busy and last flags.

use core::mem::size_of;
use core::ptr::NonNull;

use static_assertions as sa;

use crate::cfg;
use crate::index::AvlNode;

bitflags::bitflags! {
    /// Flag bits overlaid on the low end of `size_curr`.
    struct Flags: usize {
        /// Payload is held by a caller.
        const BUSY = 1 << 0;
        /// Final block of its arena.
        const LAST = 1 << 1;
    }
}

/// Header fronting every block.
#[repr(C)]
struct BlockHdr {
    /// Payload size in bytes, low bits overlaid with [`Flags`].
    size_curr: usize,
    /// Payload size of the left neighbour; 0 iff first-in-arena.
    size_prev: usize,
    /// Byte offset of this header from the arena base.
    offset: usize,
}

/// Header size as laid out in an arena.
pub const BLOCK_HDR_SIZE: usize = cfg::round_bytes(size_of::<BlockHdr>());

/// Smallest payload a block may carry: a free block's payload must be able to
/// host its index node.
pub const BLOCK_SIZE_MIN: usize = cfg::round_bytes(size_of::<AvlNode>());

sa::const_assert_eq!(BLOCK_HDR_SIZE % cfg::ALIGN, 0);
sa::const_assert_eq!(BLOCK_SIZE_MIN % cfg::ALIGN, 0);
sa::const_assert!(BLOCK_SIZE_MIN >= size_of::<AvlNode>());

/// Handle to a block within a live arena.
///
/// A `Block` is a bare pointer to the header; every accessor dereferences it.
/// The arena must outlive the handle and the caller must hold exclusive
/// access to it, which the owning heap guarantees.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Block(NonNull<BlockHdr>);

impl Block {
    /// Lay a fresh arena out as one free, first-and-last block spanning the
    /// whole mapping past the header.
    ///
    /// ### Safety:
    /// `base` must point at `bytes` writable bytes, `bytes` at least
    /// `BLOCK_HDR_SIZE + BLOCK_SIZE_MIN` and an ALIGN-multiple.
    pub unsafe fn arena_init(base: NonNull<u8>, bytes: usize) -> Block {
        let block = Block(base.cast());
        block.hdr().write(BlockHdr {
            size_curr: bytes - BLOCK_HDR_SIZE,
            size_prev: 0,
            offset: 0,
        });
        block.set_last();
        block
    }

    /// Recover the block handle from the payload pointer handed to a caller.
    ///
    /// ### Safety:
    /// `payload` must have been produced by [`Block::payload`] on a block
    /// that is still live.
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Block {
        Block(NonNull::new_unchecked(payload.as_ptr().sub(BLOCK_HDR_SIZE)).cast())
    }

    /// Recover the block handle from its embedded index node.
    ///
    /// ### Safety:
    /// `node` must be the node storage of a live free block.
    #[inline]
    pub unsafe fn from_node(node: *mut AvlNode) -> Block {
        Self::from_payload(NonNull::new_unchecked(node.cast()))
    }

    #[inline]
    fn hdr(self) -> *mut BlockHdr {
        self.0.as_ptr()
    }

    /// Pointer to the header itself; for a first block, the arena base.
    #[inline]
    pub fn base(self) -> NonNull<u8> {
        self.0.cast()
    }

    /// Pointer to the payload handed to callers.
    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.base().as_ptr().add(BLOCK_HDR_SIZE)) }
    }

    /// The free payload's embedded index node storage.
    #[inline]
    pub fn node(self) -> *mut AvlNode {
        self.payload().as_ptr().cast()
    }

    /// Payload size with the flag bits masked off.
    #[inline]
    pub unsafe fn size(self) -> usize {
        (*self.hdr()).size_curr & !Flags::all().bits()
    }

    #[inline]
    unsafe fn set_size(self, size: usize) {
        debug_assert_eq!(size % cfg::ALIGN, 0);
        let flags = (*self.hdr()).size_curr & Flags::all().bits();
        (*self.hdr()).size_curr = size | flags;
    }

    /// The boundary tag: the left neighbour's payload size.
    #[inline]
    pub unsafe fn size_prev(self) -> usize {
        (*self.hdr()).size_prev
    }

    #[inline]
    unsafe fn set_size_prev(self, size: usize) {
        (*self.hdr()).size_prev = size;
    }

    /// Byte offset of this header from its arena's base.
    #[inline]
    pub unsafe fn offset(self) -> usize {
        (*self.hdr()).offset
    }

    #[inline]
    pub unsafe fn is_busy(self) -> bool {
        (*self.hdr()).size_curr & Flags::BUSY.bits() != 0
    }

    #[inline]
    pub unsafe fn set_busy(self) {
        (*self.hdr()).size_curr |= Flags::BUSY.bits();
    }

    #[inline]
    pub unsafe fn clear_busy(self) {
        (*self.hdr()).size_curr &= !Flags::BUSY.bits();
    }

    #[inline]
    pub unsafe fn is_last(self) -> bool {
        (*self.hdr()).size_curr & Flags::LAST.bits() != 0
    }

    #[inline]
    unsafe fn set_last(self) {
        (*self.hdr()).size_curr |= Flags::LAST.bits();
    }

    #[inline]
    unsafe fn clear_last(self) {
        (*self.hdr()).size_curr &= !Flags::LAST.bits();
    }

    /// Derived, not stored: a block is first-in-arena iff there is no left
    /// neighbour to record.
    #[inline]
    pub unsafe fn is_first(self) -> bool {
        self.size_prev() == 0
    }

    /// Right neighbour.
    ///
    /// ### Safety:
    /// The address one header past the payload must still lie within the
    /// arena, i.e. `self` is not last (or a block is being carved there).
    #[inline]
    pub unsafe fn next(self) -> Block {
        Block(NonNull::new_unchecked(self.base().as_ptr().add(BLOCK_HDR_SIZE + self.size())).cast())
    }

    /// Left neighbour via the boundary tag.
    ///
    /// ### Safety:
    /// `self` must not be first-in-arena.
    #[inline]
    pub unsafe fn prev(self) -> Block {
        Block(NonNull::new_unchecked(self.base().as_ptr().sub(BLOCK_HDR_SIZE + self.size_prev())).cast())
    }

    /// Claim the block for a caller at payload size `size`, carving the
    /// remainder into a fresh free block when it can host a header plus
    /// [`BLOCK_SIZE_MIN`].
    ///
    /// `self` is marked busy either way. Returns the remainder block, fully
    /// linked to both neighbours, or `None` when no remainder was formed and
    /// `self` keeps its original size.
    ///
    /// ### Safety:
    /// `size` must be an ALIGN-multiple no larger than the current payload
    /// size.
    pub unsafe fn split(self, size: usize) -> Option<Block> {
        debug_assert_eq!(size % cfg::ALIGN, 0);
        debug_assert!(size <= self.size());

        self.set_busy();

        let rest = self.size() - size;
        if rest < BLOCK_HDR_SIZE + BLOCK_SIZE_MIN {
            return None;
        }
        let rest = rest - BLOCK_HDR_SIZE;

        self.set_size(size);
        let right = self.next();
        right.hdr().write(BlockHdr {
            size_curr: rest,
            size_prev: size,
            offset: self.offset() + size + BLOCK_HDR_SIZE,
        });
        if self.is_last() {
            self.clear_last();
            right.set_last();
        } else {
            right.next().set_size_prev(rest);
        }
        Some(right)
    }

    /// Absorb the immediate right neighbour `right`, which must be free. The
    /// busy bit of `self` is preserved; `right` ceases to exist.
    ///
    /// ### Safety:
    /// `right` must be `self`'s right neighbour within the same arena.
    pub unsafe fn merge(self, right: Block) {
        debug_assert!(!right.is_busy());
        debug_assert_eq!(self.next(), right);

        let size = self.size() + right.size() + BLOCK_HDR_SIZE;
        self.set_size(size);
        if right.is_last() {
            self.set_last();
        } else {
            self.next().set_size_prev(size);
        }
    }

    /// Tell the page provider that the interior pages of this free block are
    /// discardable. The header and the embedded index node bytes survive;
    /// partial pages at either end are left alone. No-op when the block does
    /// not cover a whole interior page.
    ///
    /// ### Safety:
    /// `self` must be free and stay untouched by callers.
    pub unsafe fn dontneed(self) {
        debug_assert!(!self.is_busy());

        let size = self.size();
        if size - size_of::<AvlNode>() < cfg::PAGE_SIZE {
            return;
        }

        let offset = self.offset();
        let lo = cfg::page_align_up(offset + BLOCK_HDR_SIZE + size_of::<AvlNode>());
        let hi = cfg::page_align_down(offset + size + BLOCK_HDR_SIZE);
        if lo >= hi {
            return;
        }

        let ptr = NonNull::new_unchecked(self.base().as_ptr().add(lo - offset));
        mman::reset(ptr, hi - lo);
    }
}
