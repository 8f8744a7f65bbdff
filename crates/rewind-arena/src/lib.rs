//! Rewindable bump arena with generation-tagged handles.
//!
//! Provides a bump allocator that reclaims everything at once: a rewind
//! resets every block cursor in O(blocks) and advances the arena's
//! generation, which turns every previously issued handle stale. Stale
//! handles are caught by an equality check rather than by touching memory.
//! This crate and `rewind-test-utils` are the only ones with `unsafe` code.
//!
//! # Architecture
//!
//! ```text
//! RewindArena (orchestrator, generation counter)
//! ├── BlockTable (index-addressed, lock-free append)
//! │   └── Block[]  ←── raw region + packed (offset, live count) AtomicU64
//! │                    + start bitmap (SlotMask) when individual free is on
//! └── BackingAllocator (SystemAllocator by default)
//! ```
//!
//! # Concurrency
//!
//! `allocate`, the typed allocators and `free` take `&self` and are safe
//! to call from many threads: each block's cursor only moves by CAS, and
//! new blocks are published by CAS into the block table. `rewind` and
//! `dispose` take `&mut self`, so the borrow checker enforces that no
//! allocation is in flight when an epoch ends.
//!
//! # Block retention
//!
//! A rewind keeps all blocks. If the epoch that just ended never reached
//! past the first block, the surplus blocks go back to the backing
//! allocator. Blocks therefore survive exactly one idle epoch.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(unsafe_code)]

pub mod arena;
mod block;
pub mod config;
pub mod error;
pub mod handle;
pub mod raw;

// Public re-exports for the primary API surface.
pub use arena::RewindArena;
pub use config::{ArenaConfig, StalePolicy};
pub use error::ArenaError;
pub use handle::{ArenaId, Generation, Handle, RawHandle};
pub use raw::{BackingAllocator, SystemAllocator};
