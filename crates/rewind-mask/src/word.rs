//! Single-word bit-range allocation.
//!
//! A word is a 64-bit occupancy bitmap: bit `i` set means slot `i` is
//! taken. [`try_allocate`], [`try_claim`] and [`try_free`] mutate an [`AtomicU64`] through
//! a compare-and-swap retry loop, so any number of threads may race on the
//! same word. A failed CAS means another thread changed the word, so the
//! loop re-scans the freshly observed value and tries again.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::MaskError;

/// Number of slots tracked by one word.
pub const WORD_BITS: u32 = u64::BITS;

/// Reject run widths outside `1..=64`.
pub(crate) fn check_bit_count(offset: usize, bit_count: u32) -> Result<(), MaskError> {
    if bit_count == 0 || bit_count > WORD_BITS {
        return Err(MaskError::InvalidRequest { offset, bit_count });
    }
    Ok(())
}

/// Bits `offset..offset + bit_count` set.
///
/// Requires `1 <= bit_count` and `offset + bit_count <= 64`.
#[inline]
pub fn range_mask(offset: u32, bit_count: u32) -> u64 {
    debug_assert!(bit_count >= 1 && offset + bit_count <= WORD_BITS);
    (u64::MAX >> (WORD_BITS - bit_count)) << offset
}

/// Lowest offset at which `value` has `bit_count` consecutive zero bits.
///
/// Returns `None` if no such run exists or `bit_count` is outside `1..=64`.
/// Runs never wrap past bit 63.
pub fn find_run(value: u64, bit_count: u32) -> Option<u32> {
    if bit_count == 0 || bit_count > WORD_BITS {
        return None;
    }
    // Bit i of `starts` is set iff bits i..i + covered are all free.
    // Doubling the covered width each round keeps this to O(log n) steps.
    let mut starts = !value;
    let mut covered = 1;
    while covered < bit_count && starts != 0 {
        let step = covered.min(bit_count - covered);
        starts &= starts >> step;
        covered += step;
    }
    if starts == 0 {
        None
    } else {
        Some(starts.trailing_zeros())
    }
}

/// Reserve the lowest run of `bit_count` free bits in `word`.
///
/// Returns the in-word offset of the run. On failure the word is not
/// modified: [`MaskError::InvalidRequest`] for widths outside `1..=64`,
/// [`MaskError::CapacityExhausted`] when no free run exists.
pub fn try_allocate(word: &AtomicU64, bit_count: u32) -> Result<u32, MaskError> {
    check_bit_count(0, bit_count)?;
    let mut current = word.load(Ordering::Acquire);
    loop {
        let offset =
            find_run(current, bit_count).ok_or(MaskError::CapacityExhausted { bit_count })?;
        let candidate = current | range_mask(offset, bit_count);
        match word.compare_exchange_weak(current, candidate, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return Ok(offset),
            Err(observed) => current = observed,
        }
    }
}

/// Reject ranges that leave the word.
fn check_range(offset: u32, bit_count: u32) -> Result<u64, MaskError> {
    check_bit_count(offset as usize, bit_count)?;
    if offset.checked_add(bit_count).is_none_or(|end| end > WORD_BITS) {
        return Err(MaskError::InvalidRequest {
            offset: offset as usize,
            bit_count,
        });
    }
    Ok(range_mask(offset, bit_count))
}

/// Reserve exactly the bits `offset..offset + bit_count` in `word`.
///
/// Fails with [`MaskError::RangeOccupied`] if any bit in the range is
/// already taken, and with [`MaskError::InvalidRequest`] if the range does
/// not fit in the word. The word is not modified on failure.
pub fn try_claim(word: &AtomicU64, offset: u32, bit_count: u32) -> Result<(), MaskError> {
    let mask = check_range(offset, bit_count)?;
    let mut current = word.load(Ordering::Acquire);
    loop {
        if current & mask != 0 {
            return Err(MaskError::RangeOccupied {
                offset: offset as usize,
                bit_count,
            });
        }
        let candidate = current | mask;
        match word.compare_exchange_weak(current, candidate, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return Ok(()),
            Err(observed) => current = observed,
        }
    }
}

/// Release `bit_count` bits starting at `offset` in `word`.
///
/// Fails with [`MaskError::RangeNotAllocated`] if any bit in the range is
/// already free, and with [`MaskError::InvalidRequest`] if the range does
/// not fit in the word. The word is not modified on failure.
pub fn try_free(word: &AtomicU64, offset: u32, bit_count: u32) -> Result<(), MaskError> {
    let mask = check_range(offset, bit_count)?;
    let mut current = word.load(Ordering::Acquire);
    loop {
        if current & mask != mask {
            return Err(MaskError::RangeNotAllocated {
                offset: offset as usize,
                bit_count,
            });
        }
        let candidate = current & !mask;
        match word.compare_exchange_weak(current, candidate, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return Ok(()),
            Err(observed) => current = observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_mask_edges() {
        assert_eq!(range_mask(0, 1), 0b1);
        assert_eq!(range_mask(3, 2), 0b11000);
        assert_eq!(range_mask(0, 64), u64::MAX);
        assert_eq!(range_mask(63, 1), 1 << 63);
    }

    #[test]
    fn find_run_on_empty_word_is_zero() {
        for bits in 1..=64 {
            assert_eq!(find_run(0, bits), Some(0));
        }
    }

    #[test]
    fn find_run_rejects_bad_widths() {
        assert_eq!(find_run(0, 0), None);
        assert_eq!(find_run(0, 65), None);
    }

    #[test]
    fn find_run_skips_short_gaps() {
        // Free: bit 1, bits 4..=6, bits 10..
        let value = 0b11_1000_1101;
        assert_eq!(find_run(value, 1), Some(1));
        assert_eq!(find_run(value, 2), Some(4));
        assert_eq!(find_run(value, 3), Some(4));
        assert_eq!(find_run(value, 4), Some(10));
    }

    #[test]
    fn find_run_does_not_wrap_past_top_bit() {
        // Only bits 62, 63 and 0 are free.
        let value = !(0b1 | (0b11 << 62));
        assert_eq!(find_run(value, 2), Some(62));
        assert_eq!(find_run(value, 3), None);
    }

    #[test]
    fn sixty_four_single_bits_fill_word() {
        let word = AtomicU64::new(0);
        for expected in 0..64 {
            assert_eq!(try_allocate(&word, 1), Ok(expected));
        }
        assert_eq!(word.load(Ordering::Relaxed), u64::MAX);
        assert_eq!(
            try_allocate(&word, 1),
            Err(MaskError::CapacityExhausted { bit_count: 1 })
        );
        assert_eq!(word.load(Ordering::Relaxed), u64::MAX);
    }

    #[test]
    fn oversized_request_is_invalid_and_leaves_word() {
        let word = AtomicU64::new(0b1010);
        let result = try_allocate(&word, 65);
        assert!(matches!(result, Err(MaskError::InvalidRequest { .. })));
        assert_eq!(word.load(Ordering::Relaxed), 0b1010);
    }

    #[test]
    fn zero_width_request_is_invalid() {
        let word = AtomicU64::new(0);
        assert!(matches!(
            try_allocate(&word, 0),
            Err(MaskError::InvalidRequest { .. })
        ));
        assert!(matches!(
            try_free(&word, 0, 0),
            Err(MaskError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn full_word_allocation() {
        let word = AtomicU64::new(0);
        assert_eq!(try_allocate(&word, 64), Ok(0));
        assert_eq!(word.load(Ordering::Relaxed), u64::MAX);
        assert_eq!(try_free(&word, 0, 64), Ok(()));
        assert_eq!(word.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn double_free_is_reported_without_mutation() {
        let word = AtomicU64::new(0);
        let offset = try_allocate(&word, 4).unwrap();
        try_free(&word, offset, 4).unwrap();
        assert_eq!(
            try_free(&word, offset, 4),
            Err(MaskError::RangeNotAllocated {
                offset: 0,
                bit_count: 4
            })
        );
        assert_eq!(word.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn partial_double_free_is_rejected() {
        let word = AtomicU64::new(0b0111);
        assert!(try_free(&word, 0, 4).is_err());
        assert_eq!(word.load(Ordering::Relaxed), 0b0111);
    }

    #[test]
    fn free_past_word_end_is_invalid() {
        let word = AtomicU64::new(u64::MAX);
        assert!(matches!(
            try_free(&word, 62, 4),
            Err(MaskError::InvalidRequest { .. })
        ));
        assert!(matches!(
            try_free(&word, 64, 1),
            Err(MaskError::InvalidRequest { .. })
        ));
        assert_eq!(word.load(Ordering::Relaxed), u64::MAX);
    }

    #[test]
    fn claim_sets_exact_range() {
        let word = AtomicU64::new(0b1);
        assert_eq!(try_claim(&word, 4, 3), Ok(()));
        assert_eq!(word.load(Ordering::Relaxed), 0b111_0001);
        assert_eq!(
            try_claim(&word, 6, 2),
            Err(MaskError::RangeOccupied {
                offset: 6,
                bit_count: 2
            })
        );
        assert_eq!(word.load(Ordering::Relaxed), 0b111_0001);
        assert!(matches!(
            try_claim(&word, 63, 2),
            Err(MaskError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn claim_then_free_then_reclaim() {
        let word = AtomicU64::new(0);
        try_claim(&word, 10, 1).unwrap();
        try_free(&word, 10, 1).unwrap();
        assert!(try_free(&word, 10, 1).is_err());
        assert_eq!(try_claim(&word, 10, 1), Ok(()));
    }

    #[cfg(not(miri))]
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        /// Straight-line reference scan.
        fn naive_find_run(value: u64, bits: u32) -> Option<u32> {
            (0..=(WORD_BITS - bits)).find(|&off| value & range_mask(off, bits) == 0)
        }

        proptest! {
            #[test]
            fn find_run_matches_reference(value in any::<u64>(), bits in 1u32..=64) {
                prop_assert_eq!(find_run(value, bits), naive_find_run(value, bits));
            }

            #[test]
            fn allocate_succeeds_iff_run_exists(value in any::<u64>(), bits in 1u32..=64) {
                let word = AtomicU64::new(value);
                match try_allocate(&word, bits) {
                    Ok(offset) => {
                        prop_assert_eq!(Some(offset), naive_find_run(value, bits));
                        prop_assert_eq!(
                            word.load(Ordering::Relaxed),
                            value | range_mask(offset, bits)
                        );
                    }
                    Err(e) => {
                        prop_assert_eq!(e, MaskError::CapacityExhausted { bit_count: bits });
                        prop_assert_eq!(naive_find_run(value, bits), None);
                        prop_assert_eq!(word.load(Ordering::Relaxed), value);
                    }
                }
            }

            #[test]
            fn allocate_then_free_restores_word(value in any::<u64>(), bits in 1u32..=64) {
                let word = AtomicU64::new(value);
                if let Ok(offset) = try_allocate(&word, bits) {
                    try_free(&word, offset, bits).unwrap();
                    prop_assert_eq!(word.load(Ordering::Relaxed), value);
                }
            }
        }
    }
}
