//! Generation-tagged allocation handles.
//!
//! A [`RawHandle`] pairs the address of an allocation with the arena
//! generation it was issued in. Rewinding the arena advances its
//! generation, so every handle issued before the rewind fails the O(1)
//! equality check in [`RewindArena::resolve`](crate::RewindArena::resolve)
//! without memory being touched.

#![allow(unsafe_code)]

use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

/// Arena epoch counter.
///
/// Fixed-width and wrapping: `next()` of `u32::MAX` is `0`. Validity is
/// plain equality, so a handle is only mistaken for live if it is held
/// across exactly 2^32 rewinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(pub u32);

impl Generation {
    /// Generation of a freshly created arena.
    pub const INITIAL: Generation = Generation(1);

    /// The following generation, wrapping at `u32::MAX`.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-unique arena identity, stamped into every handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArenaId(pub u32);

impl ArenaId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ArenaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Untyped arena allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub struct RawHandle {
    pub(crate) ptr: NonNull<u8>,
    pub(crate) len: usize,
    pub(crate) generation: Generation,
    pub(crate) arena: ArenaId,
    pub(crate) block: u32,
    /// Reclaim lap of the block when the allocation was made.
    pub(crate) lap: u32,
}

// SAFETY: a handle is an address plus tags; dereferencing it always goes
// through the arena (or an unsafe caller contract), never through the
// handle itself.
unsafe impl Send for RawHandle {}
// SAFETY: as above.
unsafe impl Sync for RawHandle {}

impl RawHandle {
    /// Address of the allocation. Dereferencing it is only sound while the
    /// handle is valid in its arena.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size of the allocation in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether this is a zero-byte allocation.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The generation this handle belongs to.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// The arena that issued this handle.
    pub fn arena_id(&self) -> ArenaId {
        self.arena
    }

    /// Index of the block holding the allocation.
    pub fn block_index(&self) -> u32 {
        self.block
    }
}

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RawHandle(arena={}, gen={}, block={}, len={})",
            self.arena, self.generation, self.block, self.len
        )
    }
}

/// Typed arena allocation of `len` initialised `T`s.
#[must_use]
pub struct Handle<T> {
    pub(crate) raw: RawHandle,
    pub(crate) len: usize,
    _marker: PhantomData<T>,
}

// SAFETY: same reasoning as RawHandle; element access goes through the
// arena, which requires T: Sync for shared reads across threads.
unsafe impl<T: Send> Send for Handle<T> {}
// SAFETY: as above.
unsafe impl<T: Sync> Sync for Handle<T> {}

impl<T> Handle<T> {
    pub(crate) fn new(raw: RawHandle, len: usize) -> Self {
        Self {
            raw,
            len,
            _marker: PhantomData,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the allocation holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The generation this handle belongs to.
    pub fn generation(&self) -> Generation {
        self.raw.generation
    }

    /// The untyped handle underneath.
    pub fn raw(&self) -> RawHandle {
        self.raw
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw && self.len == other.len
    }
}

impl<T> Eq for Handle<T> {}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("raw", &self.raw)
            .field("len", &self.len)
            .finish()
    }
}
