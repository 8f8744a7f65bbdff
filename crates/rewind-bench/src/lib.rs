//! Benchmark workloads for the rewind arena and slot mask.
//!
//! - [`frame_config`]: arena sized for a typical per-frame scratch budget
//! - [`request_sizes`]: deterministic mixed-size request stream
//! - [`run_frame`]: allocate one frame's worth of requests from an arena
//! - [`fill_mask`]: saturate a mask with fixed-width ranges

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use rewind_arena::{ArenaConfig, ArenaError, RewindArena, StalePolicy};
use rewind_mask::SlotMask;

/// First-block size used by the frame profile (256 KiB).
pub const FRAME_BLOCK_BYTES: usize = 256 * 1024;

/// Arena profile for per-frame scratch: one 256 KiB block, stale accesses
/// reported rather than panicking.
pub fn frame_config() -> ArenaConfig {
    ArenaConfig::new(FRAME_BLOCK_BYTES).with_stale_policy(StalePolicy::Ignore)
}

/// Generate `n` request sizes between 8 and 512 bytes.
///
/// Uses a fixed LCG so every run sees the same stream for a given seed.
/// Sizes are multiples of 8.
pub fn request_sizes(n: usize, seed: u64) -> Vec<usize> {
    let mut state = seed;
    (0..n)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            8 * (1 + (state >> 58) as usize)
        })
        .collect()
}

/// Allocate every size in `sizes` (8-byte aligned). Returns total bytes.
pub fn run_frame(arena: &RewindArena, sizes: &[usize]) -> Result<usize, ArenaError> {
    sizes.iter().try_fold(0, |total, &size| {
        arena.allocate(size, 8, 1).map(|h| total + h.len())
    })
}

/// Allocate `bit_count`-wide ranges until the mask refuses. Returns how
/// many ranges were granted.
pub fn fill_mask(mask: &SlotMask, bit_count: u32) -> usize {
    let mut granted = 0;
    while mask.try_allocate(bit_count).is_ok() {
        granted += 1;
    }
    granted
}
