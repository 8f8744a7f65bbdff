//! Test utilities and instrumented backing allocators for rewind development.
//!
//! - [`CountingAllocator`]: forwards to the system allocator and counts
//!   live blocks and bytes, so tests can see exactly when the arena goes
//!   back to its backing allocator.
//! - [`FailingAllocator`]: succeeds a fixed number of times, then refuses.

#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use rewind_arena::{BackingAllocator, SystemAllocator};

/// System allocator wrapper that tracks every block it hands out.
#[derive(Debug, Default)]
pub struct CountingAllocator {
    allocations: AtomicUsize,
    frees: AtomicUsize,
    live_bytes: AtomicUsize,
}

impl CountingAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total successful `raw_allocate` calls.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Acquire)
    }

    /// Total `raw_free` calls.
    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::Acquire)
    }

    /// Blocks allocated and not yet freed.
    pub fn live_blocks(&self) -> usize {
        self.allocations() - self.frees()
    }

    /// Bytes allocated and not yet freed.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire)
    }
}

impl BackingAllocator for CountingAllocator {
    fn raw_allocate(&self, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        let ptr = SystemAllocator.raw_allocate(bytes, align)?;
        self.allocations.fetch_add(1, Ordering::AcqRel);
        self.live_bytes.fetch_add(bytes, Ordering::AcqRel);
        Some(ptr)
    }

    unsafe fn raw_free(&self, ptr: NonNull<u8>, bytes: usize, align: usize) {
        self.frees.fetch_add(1, Ordering::AcqRel);
        self.live_bytes.fetch_sub(bytes, Ordering::AcqRel);
        // SAFETY: forwarded contract; every block came from SystemAllocator.
        unsafe { SystemAllocator.raw_free(ptr, bytes, align) }
    }
}

/// Allocator that grants the first `budget` requests, then fails.
///
/// Granted blocks are real system allocations, so arenas built on this
/// can be used normally until the budget runs out.
#[derive(Debug)]
pub struct FailingAllocator {
    remaining: AtomicUsize,
    inner: CountingAllocator,
}

impl FailingAllocator {
    pub fn new(budget: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(budget),
            inner: CountingAllocator::new(),
        }
    }

    /// Requests that will still be granted.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Counters for the granted blocks.
    pub fn counts(&self) -> &CountingAllocator {
        &self.inner
    }
}

impl BackingAllocator for FailingAllocator {
    fn raw_allocate(&self, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()?;
        self.inner.raw_allocate(bytes, align)
    }

    unsafe fn raw_free(&self, ptr: NonNull<u8>, bytes: usize, align: usize) {
        // SAFETY: forwarded contract.
        unsafe { self.inner.raw_free(ptr, bytes, align) }
    }
}
