//! The embedder-supplied allocator for general-purpose buffers.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Allocator used for backing stores that aren't WebAssembly memories.
///
/// Memory handed out by this allocator is outside the address-space budget;
/// it is the embedder's responsibility to bound it.
///
/// # Safety
///
/// Returned regions must be valid for reads and writes of `length` bytes and
/// remain so until passed to [`ArrayBufferAllocator::free`].
pub unsafe trait ArrayBufferAllocator: Send + Sync {
    /// Allocates `length` zero-initialized bytes. `length` is never zero.
    fn allocate(&self, length: usize) -> Option<NonNull<u8>>;

    /// Allocates `length` bytes with unspecified contents. `length` is never
    /// zero.
    fn allocate_uninitialized(&self, length: usize) -> Option<NonNull<u8>>;

    /// Frees a region returned by either allocation method.
    ///
    /// # Safety
    ///
    /// `data` and `length` must match a previous, not yet freed, allocation.
    unsafe fn free(&self, data: NonNull<u8>, length: usize);
}

/// An [`ArrayBufferAllocator`] on top of the Rust global allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultArrayBufferAllocator;

impl DefaultArrayBufferAllocator {
    const ALIGN: usize = 16;

    fn layout(length: usize) -> Option<Layout> {
        Layout::from_size_align(length, Self::ALIGN).ok()
    }
}

unsafe impl ArrayBufferAllocator for DefaultArrayBufferAllocator {
    fn allocate(&self, length: usize) -> Option<NonNull<u8>> {
        let layout = Self::layout(length)?;
        NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
    }

    fn allocate_uninitialized(&self, length: usize) -> Option<NonNull<u8>> {
        let layout = Self::layout(length)?;
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    unsafe fn free(&self, data: NonNull<u8>, length: usize) {
        let layout = Self::layout(length).expect("layout was valid at allocation");
        unsafe { alloc::dealloc(data.as_ptr(), layout) }
    }
}
