//! Anonymous page mappings.
//!
//! The platform layer beneath the allocator: hands out page-granular,
//! read-write anonymous memory, releases it, and advises the kernel that a
//! range's contents are discardable. Exhaustion (`ENOMEM`) is a soft failure
//! reported as `None`; every other failure means the caller handed over a
//! corrupted pointer or length, and the process is terminated with a
//! diagnostic on stderr rather than limping on.

use core::ptr::{self, NonNull};

/// Byte written over a range by [`reset`] before the discard advisory when
/// the `reset-fill` feature is enabled, making discarded spans obvious in a
/// debugger.
pub const RESET_FILL_BYTE: u8 = 0x7e;

fn fatal(call: &str) -> ! {
    eprintln!("mman: {} failed: {}", call, std::io::Error::last_os_error());
    std::process::exit(1);
}

/// Map `len` bytes of zeroed anonymous read-write memory.
///
/// The kernel serves whole pages; a partial trailing page is still usable.
/// Returns `None` when the OS cannot back the request, which callers treat
/// as out-of-memory. Any other failure is fatal.
pub fn map(len: usize) -> Option<NonNull<u8>> {
    // SAFETY: requests a fresh private anonymous mapping; no existing memory
    // is affected by these arguments.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        if std::io::Error::last_os_error().raw_os_error() == Some(libc::ENOMEM) {
            return None;
        }
        fatal("mmap");
    }

    // SAFETY: without MAP_FIXED and a null hint, a successful mmap never
    // yields the zero page.
    Some(unsafe { NonNull::new_unchecked(ptr.cast()) })
}

/// Release a mapping previously obtained from [`map`].
///
/// ### Safety:
/// `ptr..ptr + len` must cover exactly the span of one live mapping returned
/// by [`map`], and nothing may touch it afterwards.
pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
    if libc::munmap(ptr.as_ptr().cast(), len) < 0 {
        fatal("munmap");
    }
}

/// Advise the kernel that `ptr..ptr + len` need not be preserved. The range
/// stays mapped; the next touch observes zero-filled pages.
///
/// ### Safety:
/// The range must lie within a mapping obtained from [`map`], be page-aligned
/// at both ends, and hold nothing the caller still needs.
pub unsafe fn reset(ptr: NonNull<u8>, len: usize) {
    #[cfg(feature = "reset-fill")]
    ptr.as_ptr().write_bytes(RESET_FILL_BYTE, len);

    if libc::madvise(ptr.as_ptr().cast(), len, libc::MADV_DONTNEED) < 0 {
        fatal("madvise");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEN: usize = 4 * 4096;

    #[test]
    fn map_write_unmap() {
        let ptr = map(LEN).unwrap();
        unsafe {
            ptr.as_ptr().write_bytes(0xaa, LEN);
            assert_eq!(*ptr.as_ptr(), 0xaa);
            assert_eq!(*ptr.as_ptr().add(LEN - 1), 0xaa);
            unmap(ptr, LEN);
        }
    }

    #[test]
    fn fresh_mappings_are_zeroed() {
        let ptr = map(LEN).unwrap();
        unsafe {
            assert_eq!(*ptr.as_ptr(), 0);
            assert_eq!(*ptr.as_ptr().add(LEN / 2), 0);
            unmap(ptr, LEN);
        }
    }

    #[test]
    fn reset_discards_contents() {
        let ptr = map(LEN).unwrap();
        unsafe {
            ptr.as_ptr().write_bytes(0xaa, LEN);
            reset(ptr, LEN);
            // anonymous private memory reads back zero after the advisory
            assert_eq!(*ptr.as_ptr(), 0);
            assert_eq!(*ptr.as_ptr().add(LEN - 1), 0);
            unmap(ptr, LEN);
        }
    }

    #[test]
    fn exhaustion_is_soft() {
        // far beyond any virtual address space the kernel will grant
        assert!(map(usize::MAX / 2 + 1).is_none());
    }
}
