//! Low-level abstraction for reserving address space and flipping page
//! permissions within it.
//!
//! WebAssembly memories are always allocated through a [`PageAllocator`]. The
//! [`OsPageAllocator`] maps directly onto the host's virtual memory APIs;
//! embedders (and tests) may provide their own implementation through
//! [`Engine::with_page_allocator`](crate::Engine::with_page_allocator).

use crate::sys;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Access permissions that can be applied to a range of pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protection {
    /// Any access faults. Reserved-but-uncommitted memory is in this state.
    NoAccess,
    /// Readable and writable.
    ReadWrite,
}

/// A source of page-granular virtual memory.
///
/// # Safety
///
/// Implementations must return regions that are exclusively owned by the
/// caller until they are handed back through [`PageAllocator::free_pages`],
/// and that read as zero the first time they become accessible.
pub unsafe trait PageAllocator: Send + Sync {
    /// The granularity at which regions are handed out. Sizes and alignments
    /// passed to [`PageAllocator::allocate_pages`] are multiples of this.
    fn allocate_page_size(&self) -> usize;

    /// The granularity at which permissions can be changed.
    fn commit_page_size(&self) -> usize;

    /// Maps `size` bytes at an address that is a multiple of `alignment`,
    /// optionally near `hint`, with the given initial protection.
    fn allocate_pages(
        &self,
        hint: Option<NonNull<u8>>,
        size: usize,
        alignment: usize,
        protection: Protection,
    ) -> io::Result<NonNull<u8>>;

    /// Changes the permissions of `[base, base + size)`.
    ///
    /// # Safety
    ///
    /// The range must lie within a single region returned from
    /// [`PageAllocator::allocate_pages`] that has not been freed.
    unsafe fn set_permissions(
        &self,
        base: NonNull<u8>,
        size: usize,
        protection: Protection,
    ) -> io::Result<()>;

    /// Unmaps a region returned from [`PageAllocator::allocate_pages`].
    ///
    /// # Safety
    ///
    /// `base` and `size` must describe exactly one live region and no
    /// references into it may be used afterwards.
    unsafe fn free_pages(&self, base: NonNull<u8>, size: usize) -> io::Result<()>;
}

/// A [`PageAllocator`] backed by the host operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsPageAllocator;

unsafe impl PageAllocator for OsPageAllocator {
    fn allocate_page_size(&self) -> usize {
        host_page_size().max(sys::vm::get_allocation_granularity())
    }

    fn commit_page_size(&self) -> usize {
        host_page_size()
    }

    fn allocate_pages(
        &self,
        _hint: Option<NonNull<u8>>,
        size: usize,
        alignment: usize,
        protection: Protection,
    ) -> io::Result<NonNull<u8>> {
        sys::mmap::map_anonymous(size, alignment.max(self.allocate_page_size()), protection)
    }

    unsafe fn set_permissions(
        &self,
        base: NonNull<u8>,
        size: usize,
        protection: Protection,
    ) -> io::Result<()> {
        if size == 0 {
            // A zero-sized mprotect (or equivalent) is allowed on some
            // platforms but not others (notably Windows). Treat it as a no-op
            // everywhere.
            return Ok(());
        }
        assert!(
            base.as_ptr() as usize % self.commit_page_size() == 0,
            "changing of protections isn't page-aligned",
        );
        unsafe { sys::mmap::protect(base, size, protection) }
    }

    unsafe fn free_pages(&self, base: NonNull<u8>, size: usize) -> io::Result<()> {
        unsafe { sys::mmap::unmap(base, size) }
    }
}

/// Returns the host OS page size, in bytes.
pub fn host_page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = sys::vm::get_page_size();
            assert!(size != 0);
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        n => n,
    }
}

/// Round the given byte size up to a multiple of `page_size`, which must be a
/// power of two. Returns `None` on overflow.
pub fn round_up_to_page_size(bytes: usize, page_size: usize) -> Option<usize> {
    debug_assert!(page_size.is_power_of_two());
    bytes
        .checked_add(page_size - 1)
        .map(|val| val & !(page_size - 1))
}
