//! Compile-time allocator configuration.

use static_assertions as sa;

/// Maximum scalar alignment of the platform. Every size the allocator deals
/// in is a multiple of this, and every payload pointer it returns is aligned
/// to it.
pub const ALIGN: usize = 16;

/// Granularity of the OS page provider.
pub const PAGE_SIZE: usize = 4096;

/// Pages per default arena.
pub const ARENA_PAGES: usize = 16;

/// Byte capacity of a default arena.
pub const ARENA_SIZE: usize = ARENA_PAGES * PAGE_SIZE;

sa::const_assert!(ALIGN.is_power_of_two());
sa::const_assert!(ALIGN >= 4); // the two low bits of size_curr carry flags
sa::const_assert!(PAGE_SIZE.is_power_of_two());
sa::const_assert_eq!(PAGE_SIZE % ALIGN, 0);
sa::const_assert!(ARENA_PAGES >= 1);

/// Round `size` up to the next multiple of [`ALIGN`].
#[inline]
pub const fn round_bytes(size: usize) -> usize {
    size + ALIGN - 1 & !(ALIGN - 1)
}

/// Round `offset` up to the next page boundary.
#[inline]
pub const fn page_align_up(offset: usize) -> usize {
    offset + PAGE_SIZE - 1 & !(PAGE_SIZE - 1)
}

/// Round `offset` down to a page boundary.
#[inline]
pub const fn page_align_down(offset: usize) -> usize {
    offset & !(PAGE_SIZE - 1)
}
