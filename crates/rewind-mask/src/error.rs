//! Slot mask error and status types.

use std::error::Error;
use std::fmt;

/// Errors that can occur during slot mask operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaskError {
    /// No run of free bits of the requested width exists, and the mask
    /// is not permitted to grow.
    CapacityExhausted {
        /// Width of the requested run.
        bit_count: u32,
    },
    /// The request can never succeed: zero bits, more than one word, or a
    /// range that leaves its word or the mask.
    InvalidRequest {
        /// Starting slot of the request (0 for allocation requests).
        offset: usize,
        /// Width of the request.
        bit_count: u32,
    },
    /// At least one bit in the range was already free (double free).
    RangeNotAllocated {
        /// Starting slot of the range.
        offset: usize,
        /// Width of the range.
        bit_count: u32,
    },
    /// At least one bit in a range claimed by position was already taken.
    RangeOccupied {
        /// Starting slot of the range.
        offset: usize,
        /// Width of the range.
        bit_count: u32,
    },
}

impl MaskError {
    /// The status code for this error.
    pub fn status(&self) -> MaskStatus {
        match self {
            Self::CapacityExhausted { .. } => MaskStatus::CapacityExhausted,
            Self::InvalidRequest { .. } => MaskStatus::InvalidRequest,
            Self::RangeNotAllocated { .. } => MaskStatus::RangeNotAllocated,
            Self::RangeOccupied { .. } => MaskStatus::RangeOccupied,
        }
    }

    /// Shift a word-relative error to a mask-global slot offset.
    pub(crate) fn rebase(self, base: usize) -> Self {
        match self {
            Self::InvalidRequest { offset, bit_count } => Self::InvalidRequest {
                offset: base + offset,
                bit_count,
            },
            Self::RangeNotAllocated { offset, bit_count } => Self::RangeNotAllocated {
                offset: base + offset,
                bit_count,
            },
            Self::RangeOccupied { offset, bit_count } => Self::RangeOccupied {
                offset: base + offset,
                bit_count,
            },
            other => other,
        }
    }
}

impl fmt::Display for MaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityExhausted { bit_count } => {
                write!(f, "slot mask full: no free run of {bit_count} bits")
            }
            Self::InvalidRequest { offset, bit_count } => {
                write!(
                    f,
                    "invalid slot request: {bit_count} bits at offset {offset} (runs must lie within one 64-bit word)"
                )
            }
            Self::RangeNotAllocated { offset, bit_count } => {
                write!(
                    f,
                    "double free: {bit_count} bits at offset {offset} are not all allocated"
                )
            }
            Self::RangeOccupied { offset, bit_count } => {
                write!(
                    f,
                    "slot range taken: {bit_count} bits at offset {offset} are not all free"
                )
            }
        }
    }
}

impl Error for MaskError {}

/// Compact outcome code for a mask operation.
///
/// Containers that forward mask outcomes across their own API boundary
/// carry this instead of the full [`MaskError`]. Only
/// [`MaskStatus::succeeded`] is behaviourally significant; the failure
/// variants exist so callers can distinguish a full container from a
/// programming error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MaskStatus {
    /// The operation completed.
    Success = 0,
    /// No free run was available.
    CapacityExhausted = 1,
    /// The request was malformed.
    InvalidRequest = 2,
    /// A free targeted bits that were already free.
    RangeNotAllocated = 3,
    /// A positional claim targeted bits that were already taken.
    RangeOccupied = 4,
}

impl MaskStatus {
    /// Whether this status denotes success.
    pub fn succeeded(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl<T> From<&Result<T, MaskError>> for MaskStatus {
    fn from(result: &Result<T, MaskError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(e) => e.status(),
        }
    }
}

/// Whether a mask operation succeeded.
pub fn succeeded<T>(result: &Result<T, MaskError>) -> bool {
    MaskStatus::from(result).succeeded()
}
