//! Lock-free bit-range slot allocation.
//!
//! Tracks slot occupancy in 64-bit words and hands out contiguous runs of
//! 1 to 64 slots without locks. This is the reservation engine under
//! fixed-capacity concurrent containers: a container asks for a run, and
//! if the mask is full the container reports itself full instead of
//! growing.
//!
//! # Architecture
//!
//! ```text
//! SlotMask (global slot index = word * 64 + bit)
//! └── AtomicU64 × N  ←── word::try_allocate / try_claim / try_free (CAS loops)
//! ```
//!
//! Runs never span words. Every mutation is a compare-and-swap on the
//! whole word value; a failed CAS re-scans the observed value, so some
//! caller always makes progress (lock-free, not wait-free).

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod error;
pub mod storage;
pub mod word;

// Public re-exports for the primary API surface.
pub use error::{succeeded, MaskError, MaskStatus};
pub use storage::SlotMask;
pub use word::WORD_BITS;
