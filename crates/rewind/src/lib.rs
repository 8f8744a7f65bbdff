//! Rewind: epoch-scoped arena allocation and lock-free slot masks.
//!
//! This is the top-level facade crate that re-exports the public API from
//! both rewind sub-crates. For most users, adding `rewind` as a single
//! dependency is sufficient.
//!
//! # Quick start
//!
//! ```rust
//! use rewind::prelude::*;
//!
//! // Per-frame scratch arena.
//! let mut arena = RewindArena::new(ArenaConfig::new(64 * 1024)).unwrap();
//! let ids = arena.alloc_copy(&[3u32, 1, 4]).unwrap();
//! assert_eq!(arena.get(&ids).unwrap(), &[3, 1, 4]);
//! arena.rewind().unwrap();
//! assert!(!arena.is_valid(&ids.raw()));
//!
//! // Slot bookkeeping for a fixed pool of 100 entries.
//! let mask = SlotMask::fixed(100);
//! let offset = mask.try_allocate(4).unwrap();
//! assert_eq!(offset, 0);
//! mask.try_free(offset, 4).unwrap();
//! assert_eq!(mask.occupied(), 0);
//! ```
//!
//! # Modules
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`arena`] | `rewind-arena` | `RewindArena`, handles, config, backing allocators |
//! | [`mask`] | `rewind-mask` | `SlotMask`, per-word primitives, status codes |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Rewindable bump arena (`rewind-arena`).
///
/// [`arena::RewindArena`] hands out [`arena::Handle`]s that go stale on
/// the next rewind. Plug in a custom [`arena::BackingAllocator`] to control
/// where blocks come from.
pub use rewind_arena as arena;

/// Lock-free bit-range allocation (`rewind-mask`).
///
/// [`mask::SlotMask`] for multi-word containers, [`mask::word`] for
/// single-word primitives.
pub use rewind_mask as mask;

/// Common imports for typical rewind usage.
///
/// ```rust
/// use rewind::prelude::*;
/// ```
pub mod prelude {
    // Arena
    pub use rewind_arena::{
        ArenaConfig, ArenaError, BackingAllocator, Generation, Handle, RawHandle, RewindArena,
        StalePolicy, SystemAllocator,
    };

    // Mask
    pub use rewind_mask::{MaskError, MaskStatus, SlotMask};
}
