//! Arena-specific error types.

use std::error::Error;
use std::fmt;

/// Errors that can occur during arena operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArenaError {
    /// The block table is full: no more blocks can be created.
    CapacityExceeded {
        /// Number of bytes requested.
        requested: usize,
        /// Block count limit that was hit.
        max_blocks: usize,
    },
    /// The arena configuration is invalid.
    InvalidConfig {
        /// Description of what is wrong.
        reason: String,
    },
    /// A size/alignment/count combination that cannot be laid out.
    InvalidLayout {
        /// Element size in bytes.
        size: usize,
        /// Requested alignment.
        align: usize,
        /// Element count.
        count: usize,
    },
    /// A single request too large for any block the arena can track.
    RequestTooLarge {
        /// Number of bytes requested.
        requested: usize,
        /// Largest block size in bytes.
        limit: u64,
    },
    /// A handle from a generation that has been rewound.
    StaleHandle {
        /// The generation encoded in the handle.
        handle_generation: u32,
        /// The arena's current generation.
        current: u32,
    },
    /// A handle issued by a different arena.
    ForeignHandle {
        /// Arena that issued the handle.
        handle_arena: u32,
        /// Arena the handle was presented to.
        arena: u32,
    },
    /// The backing allocator refused a block.
    BackingAllocationFailed {
        /// Size of the refused block in bytes.
        bytes: usize,
    },
    /// Per-allocation free was requested on an arena without it.
    IndividualFreeDisabled,
    /// A free that does not match any live allocation.
    InvalidFree {
        /// Index of the block the handle points into.
        block: u32,
    },
    /// Element index outside a typed allocation.
    OutOfBounds {
        /// Requested index.
        index: usize,
        /// Number of elements in the allocation.
        len: usize,
    },
    /// The arena has been disposed.
    Disposed,
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityExceeded {
                requested,
                max_blocks,
            } => {
                write!(
                    f,
                    "arena capacity exceeded: requested {requested} bytes with all {max_blocks} blocks in use"
                )
            }
            Self::InvalidConfig { reason } => write!(f, "invalid arena config: {reason}"),
            Self::InvalidLayout { size, align, count } => {
                write!(
                    f,
                    "invalid allocation layout: {count} x {size} bytes aligned to {align}"
                )
            }
            Self::RequestTooLarge { requested, limit } => {
                write!(
                    f,
                    "request of {requested} bytes exceeds the {limit} byte block limit"
                )
            }
            Self::StaleHandle {
                handle_generation,
                current,
            } => {
                write!(
                    f,
                    "stale handle: generation {handle_generation}, arena at generation {current}"
                )
            }
            Self::ForeignHandle {
                handle_arena,
                arena,
            } => {
                write!(
                    f,
                    "handle from arena {handle_arena} presented to arena {arena}"
                )
            }
            Self::BackingAllocationFailed { bytes } => {
                write!(f, "backing allocator refused a {bytes} byte block")
            }
            Self::IndividualFreeDisabled => {
                write!(f, "individual free is disabled for this arena")
            }
            Self::InvalidFree { block } => {
                write!(f, "free does not match a live allocation in block {block}")
            }
            Self::OutOfBounds { index, len } => {
                write!(f, "index {index} out of bounds for allocation of {len}")
            }
            Self::Disposed => write!(f, "arena has been disposed"),
        }
    }
}

impl Error for ArenaError {}
