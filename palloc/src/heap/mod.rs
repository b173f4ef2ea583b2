//! The allocator core: best-fit allocation over page-mapped arenas.
//!
//! [`Heap`] owns the process's size index and composes the block layer with
//! the page provider. Requests up to [`BLOCK_SIZE_MAX`] are served best-fit
//! from the index, or by carving a fresh default arena; anything larger gets
//! a dedicated single-block arena that bypasses the index entirely. Freeing
//! eagerly coalesces both sides, returns a fully free arena to the OS, and
//! otherwise discards the free block's interior pages and re-indexes it.

pub mod block;

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use log::trace;
use spin::Mutex;

use crate::cfg;
use crate::index::{AvlNode, AvlTree};
use block::{Block, BLOCK_HDR_SIZE, BLOCK_SIZE_MIN};

/// Largest payload servable from a default arena. Bigger blocks are
/// "oversized": alone in their arena, never split, merged, or indexed.
pub const BLOCK_SIZE_MAX: usize = cfg::ARENA_SIZE - BLOCK_HDR_SIZE;

/// The allocator proper. Not internally synchronised; see [`LockedHeap`] for
/// the call-per-call exclusive facade.
pub struct Heap {
    index: AvlTree,
}

unsafe impl Send for Heap {}

impl Heap {
    pub const fn new() -> Self {
        Self { index: AvlTree::new() }
    }

    /// Map a fresh arena of `bytes` and lay it out as a single free block.
    unsafe fn fresh_arena(&mut self, bytes: usize) -> Option<Block> {
        let base = mman::map(bytes)?;
        trace!("mapped {} byte arena at {:p}", bytes, base);
        Some(Block::arena_init(base, bytes))
    }

    /// Allocate at least `size` writable bytes, aligned to
    /// [`cfg::ALIGN`]. A zero request yields a [`BLOCK_SIZE_MIN`] block.
    /// Returns `None` when the page provider reports exhaustion.
    pub unsafe fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size > BLOCK_SIZE_MAX {
            // oversized: an arena of exactly the pages needed plus one header
            let payload = size.checked_add(cfg::PAGE_SIZE - 1)? & !(cfg::PAGE_SIZE - 1);
            let block = self.fresh_arena(payload + BLOCK_HDR_SIZE)?;
            block.set_busy();
            return Some(block.payload());
        }

        let size = cfg::round_bytes(size.max(BLOCK_SIZE_MIN));

        let node = self.index.find_best(size);
        let block = if node.is_null() {
            self.fresh_arena(cfg::ARENA_SIZE)?
        } else {
            self.index.remove(node);
            Block::from_node(node)
        };

        if let Some(rest) = block.split(size) {
            self.index_insert(rest);
        }
        Some(block.payload())
    }

    /// Free the allocation behind `payload`, coalescing with free
    /// neighbours. A sole surviving block hands its whole arena back to the
    /// OS; anything else is page-discarded and re-indexed.
    ///
    /// ### Safety:
    /// `payload` must have come from [`Heap::alloc`] or [`Heap::realloc`] on
    /// this heap, and must not be used afterwards.
    pub unsafe fn dealloc(&mut self, payload: NonNull<u8>) {
        let mut block = Block::from_payload(payload);
        debug_assert!(block.is_busy());
        block.clear_busy();

        if block.size() > BLOCK_SIZE_MAX {
            let bytes = block.size() + BLOCK_HDR_SIZE;
            trace!("unmapping {} byte oversized arena at {:p}", bytes, block.base());
            mman::unmap(block.base(), bytes);
            return;
        }

        if !block.is_last() {
            let right = block.next();
            if !right.is_busy() {
                self.index_remove(right);
                block.merge(right);
            }
        }
        if !block.is_first() {
            let left = block.prev();
            if !left.is_busy() {
                self.index_remove(left);
                left.merge(block);
                block = left;
            }
        }

        if block.is_first() && block.is_last() {
            trace!("unmapping quiescent arena at {:p}", block.base());
            mman::unmap(block.base(), cfg::ARENA_SIZE);
        } else {
            block.dontneed();
            self.index_insert(block);
        }
    }

    /// Resize the allocation behind `payload`, in place when possible.
    /// Returns the surviving pointer, or `None` on exhaustion — in which
    /// case the original allocation is left intact.
    ///
    /// ### Safety:
    /// As for [`Heap::dealloc`]; when a new pointer is returned the old one
    /// is dead.
    pub unsafe fn realloc(&mut self, payload: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        let size = size.max(BLOCK_SIZE_MIN).checked_add(cfg::ALIGN - 1)? & !(cfg::ALIGN - 1);
        let block = Block::from_payload(payload);
        let size_curr = block.size();

        if size_curr > BLOCK_SIZE_MAX {
            // oversized blocks are never resized in place
            if size == size_curr {
                return Some(payload);
            }
        } else if size == size_curr {
            return Some(payload);
        } else if size < size_curr {
            // shrink in place. A last block, or one whose remainder cannot
            // stand alone, keeps its size: shrinking never moves and never
            // fails.
            if !block.is_last() {
                if let Some(rest) = block.split(size) {
                    // the cut cannot be last here, so its right neighbour is
                    // in bounds
                    let right = rest.next();
                    if !right.is_busy() {
                        self.index_remove(right);
                        rest.merge(right);
                    }
                    self.index_insert(rest);
                }
            }
            return Some(payload);
        } else if !block.is_last() {
            // grow over the right neighbour when it is free and big enough
            let right = block.next();
            if !right.is_busy() && size_curr + right.size() + BLOCK_HDR_SIZE >= size {
                self.index_remove(right);
                block.merge(right);
                if let Some(rest) = block.split(size) {
                    self.index_insert(rest);
                }
                return Some(payload);
            }
        }

        // move: fresh allocation, copy, release
        let moved = self.alloc(size)?;
        ptr::copy_nonoverlapping(payload.as_ptr(), moved.as_ptr(), size_curr.min(size));
        self.dealloc(payload);
        Some(moved)
    }

    /// Dump the free index to stdout, one line per free block.
    pub fn show(&self, caption: &str) {
        println!("{}:", caption);
        if self.index.is_empty() {
            println!("  (index empty)");
            return;
        }
        let mut print_node = |node: *mut AvlNode| {
            // SAFETY: indexed nodes belong to live free blocks
            let (base, size, prev, first, last) = unsafe {
                let block = Block::from_node(node);
                (block.base(), block.size(), block.size_prev(), block.is_first(), block.is_last())
            };
            println!(
                "  [{:p}] size {:>10} prev {:>10}{}{}",
                base,
                size,
                prev,
                if first { " first" } else { "" },
                if last { " last" } else { "" },
            );
        };
        unsafe { self.index.walk(&mut print_node) };
    }

    #[inline]
    unsafe fn index_insert(&mut self, block: Block) {
        debug_assert!(!block.is_busy());
        debug_assert!(block.size() <= BLOCK_SIZE_MAX);
        self.index.insert(block.node(), block.size());
    }

    #[inline]
    unsafe fn index_remove(&mut self, block: Block) {
        debug_assert!(!block.is_busy());
        debug_assert_eq!(AvlNode::key(block.node()), block.size());
        self.index.remove(block.node());
    }

    /// Number of blocks currently indexed.
    #[cfg(test)]
    fn free_blocks(&self) -> usize {
        let mut count = 0;
        unsafe { self.index.walk(&mut |_| count += 1) };
        count
    }
}

/// Call-per-call synchronisation over [`Heap`], and the crate's
/// `GlobalAlloc` surface.
///
/// A thin wrapper containing a spin mutex; the underlying heap is not
/// internally synchronised, so concurrent use goes through this.
pub struct LockedHeap(Mutex<Heap>);

impl LockedHeap {
    pub const fn new() -> Self {
        Self(Mutex::new(Heap::new()))
    }

    /// Acquire the lock on the heap.
    #[inline]
    pub fn lock(&self) -> spin::MutexGuard<'_, Heap> {
        self.0.lock()
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > cfg::ALIGN {
            return ptr::null_mut();
        }
        self.lock()
            .alloc(layout.size())
            .map_or(ptr::null_mut(), |p| p.as_ptr())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(payload) = NonNull::new(ptr) {
            self.lock().dealloc(payload);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > cfg::ALIGN {
            return ptr::null_mut();
        }
        let mut heap = self.lock();
        let moved = match NonNull::new(ptr) {
            Some(payload) => heap.realloc(payload, new_size),
            None => heap.alloc(new_size),
        };
        moved.map_or(ptr::null_mut(), |p| p.as_ptr())
    }
}

/// The process-wide heap.
pub static HEAP: LockedHeap = LockedHeap::new();

/// Allocate `size` bytes from [`HEAP`]; null on exhaustion.
pub fn alloc(size: usize) -> *mut u8 {
    unsafe {
        HEAP.lock()
            .alloc(size)
            .map_or(ptr::null_mut(), |p| p.as_ptr())
    }
}

/// Release an allocation made by [`alloc`] or [`realloc`]. Null is a no-op.
///
/// ### Safety:
/// `ptr` must be null or a live allocation from [`HEAP`], and must not be
/// used afterwards.
pub unsafe fn free(ptr: *mut u8) {
    if let Some(payload) = NonNull::new(ptr) {
        HEAP.lock().dealloc(payload);
    }
}

/// Resize an allocation, in place when possible. A null `ptr` allocates; a
/// null return means exhaustion with the input left intact.
///
/// ### Safety:
/// `ptr` must be null or a live allocation from [`HEAP`]; when a different
/// pointer is returned the old one is dead.
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    let mut heap = HEAP.lock();
    let moved = match NonNull::new(ptr) {
        Some(payload) => heap.realloc(payload, size),
        None => heap.alloc(size),
    };
    moved.map_or(ptr::null_mut(), |p| p.as_ptr())
}

/// Dump [`HEAP`]'s free index to stdout under `caption`.
pub fn show(caption: &str) {
    HEAP.lock().show(caption);
}
