//! Backing allocator seam.
//!
//! The arena never calls the global allocator directly. Blocks are
//! obtained through a [`BackingAllocator`], so the arena can sit on top of
//! the system heap, a page allocator, or an instrumented test allocator.

#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Source of raw memory blocks for the arena.
///
/// Implementations must be thread-safe: concurrent `allocate` calls on the
/// arena may each request a new block at the same time.
pub trait BackingAllocator: Send + Sync {
    /// Allocate `bytes` bytes aligned to `align` (a power of two).
    ///
    /// Returns `None` if the request cannot be satisfied.
    fn raw_allocate(&self, bytes: usize, align: usize) -> Option<NonNull<u8>>;

    /// Return a block to the allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `raw_allocate` on this allocator
    /// with the same `bytes` and `align`, and must not have been freed.
    unsafe fn raw_free(&self, ptr: NonNull<u8>, bytes: usize, align: usize);
}

/// [`BackingAllocator`] over the process global allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemAllocator;

impl BackingAllocator for SystemAllocator {
    fn raw_allocate(&self, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        if bytes == 0 {
            return None;
        }
        let layout = Layout::from_size_align(bytes, align).ok()?;
        // SAFETY: layout has non-zero size (checked above).
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    unsafe fn raw_free(&self, ptr: NonNull<u8>, bytes: usize, align: usize) {
        // SAFETY: the caller guarantees ptr came from raw_allocate with this
        // size and alignment, which already passed Layout validation.
        unsafe {
            let layout = Layout::from_size_align_unchecked(bytes, align);
            alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}

impl<A: BackingAllocator + ?Sized> BackingAllocator for &A {
    fn raw_allocate(&self, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        (**self).raw_allocate(bytes, align)
    }

    unsafe fn raw_free(&self, ptr: NonNull<u8>, bytes: usize, align: usize) {
        // SAFETY: forwarded contract.
        unsafe { (**self).raw_free(ptr, bytes, align) }
    }
}
