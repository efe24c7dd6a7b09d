// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber stacks.
//!
//! One anonymous mapping per stack. The lowest `guard_pages` pages are
//! mapped `PROT_NONE` so running off the end faults instead of scribbling
//! over the neighbouring allocation. If the protection call fails the
//! stack is kept without guards.

use std::io;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::MIN_STACK_SIZE;
use crate::error::{Error, Result};

/// An execution stack owned by exactly one fiber. Unmapped on drop.
#[derive(Debug)]
pub struct Stack {
    /// Start of the whole mapping, guard pages included.
    base: NonNull<u8>,
    /// Length of the whole mapping.
    mapped: usize,
    /// Usable bytes above the guard region.
    size: usize,
    guard_pages: usize,
}

impl Stack {
    /// Map a stack with at least `size` usable bytes.
    ///
    /// `size` is rounded up to the page size and to [`MIN_STACK_SIZE`].
    pub fn allocate(size: usize, guard_pages: usize) -> Result<Stack> {
        let page = page_size();
        let usable = round_up(size.max(MIN_STACK_SIZE), page).ok_or_else(|| too_large(size))?;
        let guard_len = guard_pages.checked_mul(page).ok_or_else(|| too_large(size))?;
        let mapped = usable.checked_add(guard_len).ok_or_else(|| too_large(size))?;

        // SAFETY: anonymous private mapping, no file descriptor involved.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | map_stack_flag(),
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(Error::AllocationFailed {
                size: usable,
                source: Arc::new(io::Error::last_os_error()),
            });
        }
        let base = NonNull::new(raw.cast::<u8>()).ok_or_else(|| too_large(size))?;

        let mut guard_pages = guard_pages;
        if guard_len > 0 {
            // SAFETY: the range is the first `guard_len` bytes of our own mapping.
            let rc = unsafe { libc::mprotect(raw, guard_len, libc::PROT_NONE) };
            if rc != 0 {
                log::warn!(
                    "fiber stack guard pages unavailable ({}); continuing without them",
                    io::Error::last_os_error()
                );
                guard_pages = 0;
            }
        }

        log::trace!("mapped fiber stack: {usable} bytes, {guard_pages} guard pages at {raw:p}");

        Ok(Stack {
            base,
            mapped,
            size: usable,
            guard_pages,
        })
    }

    /// Usable size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn guard_pages(&self) -> usize {
        self.guard_pages
    }

    /// Highest address of the stack; stacks grow down from here.
    pub fn top(&self) -> *mut u8 {
        // SAFETY: one past the end of our mapping.
        unsafe { self.base.as_ptr().add(self.mapped) }
    }

    /// Lowest usable address (just above the guard region).
    pub fn limit(&self) -> *mut u8 {
        // SAFETY: `mapped - size` is the guard length, inside the mapping.
        unsafe { self.base.as_ptr().add(self.mapped - self.size) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: `base`/`mapped` describe exactly the mapping created in
        // `allocate`, and a Stack is never cloned.
        let rc = unsafe { libc::munmap(self.base.as_ptr().cast(), self.mapped) };
        if rc != 0 {
            log::warn!("munmap of fiber stack failed: {}", io::Error::last_os_error());
        }
    }
}

fn too_large(size: usize) -> Error {
    Error::AllocationFailed {
        size,
        source: Arc::new(io::Error::new(io::ErrorKind::InvalidInput, "stack size overflows address space")),
    }
}

fn round_up(n: usize, align: usize) -> Option<usize> {
    Some(n.checked_add(align - 1)? / align * align)
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn map_stack_flag() -> libc::c_int {
    libc::MAP_STACK
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn map_stack_flag() -> libc::c_int {
    0
}

/// Platform page size, cached after the first query.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    // SAFETY: sysconf has no preconditions.
    let queried = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let size = if queried > 0 { queried as usize } else { 4096 };
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_page_and_minimum() {
        let page = page_size();
        let s = Stack::allocate(1, 0).unwrap();
        assert_eq!(s.size(), round_up(MIN_STACK_SIZE, page).unwrap());
        assert_eq!(s.size() % page, 0);

        let s = Stack::allocate(MIN_STACK_SIZE + 1, 0).unwrap();
        assert_eq!(s.size() % page, 0);
        assert!(s.size() > MIN_STACK_SIZE);
    }

    #[test]
    fn usable_region_is_writable() {
        let s = Stack::allocate(64 * 1024, 2).unwrap();
        assert_eq!(s.top() as usize - s.limit() as usize, s.size());
        unsafe {
            s.limit().write(0xAA);
            s.top().sub(1).write(0x55);
            assert_eq!(s.limit().read(), 0xAA);
            assert_eq!(s.top().sub(1).read(), 0x55);
        }
    }

    #[test]
    fn guard_pages_sit_below_the_limit() {
        let page = page_size();
        let s = Stack::allocate(32 * 1024, 4).unwrap();
        if s.guard_pages() > 0 {
            assert_eq!(s.limit() as usize - s.base.as_ptr() as usize, 4 * page);
        }
    }

    #[test]
    fn absurd_size_is_a_typed_error() {
        match Stack::allocate(usize::MAX - 3, 4) {
            Err(Error::AllocationFailed { .. }) => {}
            other => panic!("expected AllocationFailed, got {:?}", other),
        }
    }

    #[test]
    fn page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
    }
}
