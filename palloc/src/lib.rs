//! A boundary-tagged, best-fit heap over anonymous page mappings.
//!
//! Arenas are acquired from the OS in page multiples and carved into blocks,
//! each a fixed header in front of its payload ([`heap::block`]). Free blocks
//! are indexed by size in an intrusive AVL tree ([`index`]) whose nodes live
//! inside the free payloads themselves. [`heap`] composes the two into the
//! classical allocate / free / reallocate interface and hands fully freed
//! arenas back to the OS.

pub mod cfg;
pub mod heap;
pub mod index;

pub use heap::{alloc, free, realloc, show, Heap, LockedHeap, HEAP};
