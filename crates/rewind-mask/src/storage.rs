//! Multi-word slot masks.
//!
//! A [`SlotMask`] is an ordered sequence of occupancy words addressed by a
//! global slot index (`word_index * 64 + bit`). Allocation scans words left
//! to right and delegates to the single-word algorithm in [`crate::word`],
//! so a run never spans two words.
//!
//! Two growth policies:
//!
//! - **Fixed** ([`SlotMask::fixed`]): the word count never changes and
//!   exhaustion is reported as [`MaskError::CapacityExhausted`]. This is
//!   what fixed-capacity concurrent containers sit on.
//! - **Growable** ([`SlotMask::growable`]): when every live word is
//!   exhausted a fresh zero word is appended, up to `max_words`.
//!
//! Word storage for the maximum size is reserved up front so that growth
//! is a single CAS on the live word count and never moves existing words.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::error::MaskError;
use crate::word::{self, WORD_BITS};

const BITS: usize = WORD_BITS as usize;

/// Lock-free occupancy bitmap over one or more 64-bit words.
pub struct SlotMask {
    /// Reserved words. Only `0..len` are live; the rest stay zero.
    words: Box<[AtomicU64]>,
    /// Number of live words. Grows monotonically.
    len: AtomicUsize,
    /// Highest slot index (exclusive) that may ever be handed out.
    slot_limit: usize,
}

// Compile-time assertion: SlotMask must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<SlotMask>();
};

impl SlotMask {
    /// Default word limit for [`SlotMask::default`] (65_536 slots).
    pub const DEFAULT_MAX_WORDS: usize = 1024;

    /// Create a fixed-capacity mask with exactly `slot_count` slots.
    ///
    /// When `slot_count` is not a multiple of 64 the unused high bits of
    /// the last word are marked occupied, so they are never allocated.
    pub fn fixed(slot_count: usize) -> Self {
        let word_count = slot_count.div_ceil(BITS);
        let words: Box<[AtomicU64]> = (0..word_count).map(|_| AtomicU64::new(0)).collect();
        let mask = Self {
            words,
            len: AtomicUsize::new(word_count),
            slot_limit: slot_count,
        };
        mask.seal_padding();
        mask
    }

    /// Create a growable mask starting with `initial_words` live words
    /// and able to grow to `max_words`.
    ///
    /// `max_words` is raised to `initial_words` if smaller.
    pub fn growable(initial_words: usize, max_words: usize) -> Self {
        let max_words = max_words.max(initial_words);
        let words: Box<[AtomicU64]> = (0..max_words).map(|_| AtomicU64::new(0)).collect();
        Self {
            words,
            len: AtomicUsize::new(initial_words),
            slot_limit: max_words * BITS,
        }
    }

    /// Reserve the lowest free run of `bit_count` slots.
    ///
    /// Returns the global slot index of the run's first bit. Appends a
    /// word when every live word is exhausted and the mask may still grow.
    pub fn try_allocate(&self, bit_count: u32) -> Result<usize, MaskError> {
        word::check_bit_count(0, bit_count)?;
        let mut start = 0;
        loop {
            let len = self.len.load(Ordering::Acquire);
            for index in start..len {
                match word::try_allocate(&self.words[index], bit_count) {
                    Ok(offset) => return Ok(index * BITS + offset as usize),
                    Err(MaskError::CapacityExhausted { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            self.grow_past(len, bit_count)?;
            start = len;
        }
    }

    /// Reserve exactly the slots `offset..offset + bit_count`.
    ///
    /// The range must lie inside a single live word. Never grows the mask.
    /// Fails with [`MaskError::RangeOccupied`] if any slot is taken, leaving
    /// the mask unchanged.
    pub fn try_claim(&self, offset: usize, bit_count: u32) -> Result<(), MaskError> {
        let (index, in_word) = self.locate(offset, bit_count)?;
        word::try_claim(&self.words[index], in_word, bit_count).map_err(|e| e.rebase(index * BITS))
    }

    /// Release `bit_count` slots starting at global index `offset`.
    ///
    /// The range must lie inside a single word and inside the mask.
    /// Freeing slots that are not all allocated fails with
    /// [`MaskError::RangeNotAllocated`] and leaves the mask unchanged.
    pub fn try_free(&self, offset: usize, bit_count: u32) -> Result<(), MaskError> {
        let (index, in_word) = self.locate(offset, bit_count)?;
        word::try_free(&self.words[index], in_word, bit_count).map_err(|e| e.rebase(index * BITS))
    }

    /// Map a global range to (word index, in-word offset), rejecting ranges
    /// that cross a word boundary or leave the mask.
    fn locate(&self, offset: usize, bit_count: u32) -> Result<(usize, u32), MaskError> {
        word::check_bit_count(offset, bit_count)?;
        let index = offset / BITS;
        let in_word = (offset % BITS) as u32;
        let end = offset.checked_add(bit_count as usize);
        if in_word + bit_count > WORD_BITS || end.is_none_or(|end| end > self.capacity()) {
            return Err(MaskError::InvalidRequest { offset, bit_count });
        }
        Ok((index, in_word))
    }

    /// Whether `slot` is currently occupied. Out-of-range slots are not.
    pub fn is_occupied(&self, slot: usize) -> bool {
        if slot >= self.capacity() {
            return false;
        }
        let value = self.words[slot / BITS].load(Ordering::Acquire);
        value & (1u64 << (slot % BITS)) != 0
    }

    /// Snapshot of the live word at `index`.
    pub fn word(&self, index: usize) -> Option<u64> {
        if index < self.word_count() {
            Some(self.words[index].load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// Number of live words.
    pub fn word_count(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Maximum number of words this mask can grow to.
    pub fn max_words(&self) -> usize {
        self.words.len()
    }

    /// Number of slots currently addressable.
    pub fn capacity(&self) -> usize {
        (self.word_count() * BITS).min(self.slot_limit)
    }

    /// Number of occupied slots across all live words.
    ///
    /// Under concurrent mutation this is a point-in-time estimate.
    pub fn occupied(&self) -> usize {
        let set: usize = self.words[..self.word_count()]
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum();
        set - self.padding_bits()
    }

    /// Whether the mask can never grow.
    pub fn is_fixed(&self) -> bool {
        self.word_count() == self.max_words()
    }

    /// Free every slot. Live word count is retained.
    pub fn clear(&mut self) {
        for w in self.words.iter_mut() {
            *w.get_mut() = 0;
        }
        self.seal_padding();
    }

    /// Make one more word live, unless another thread already did.
    fn grow_past(&self, len: usize, bit_count: u32) -> Result<(), MaskError> {
        if len >= self.words.len() {
            return Err(MaskError::CapacityExhausted { bit_count });
        }
        // A failed exchange means someone else grew the mask; their new
        // word is scanned on the next pass either way.
        if self
            .len
            .compare_exchange(len, len + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::trace!(words = len + 1, "slot mask grew");
        }
        Ok(())
    }

    /// Bits of the last word that lie past `slot_limit`.
    fn padding_bits(&self) -> usize {
        (self.word_count() * BITS).saturating_sub(self.slot_limit)
    }

    fn seal_padding(&self) {
        let tail = self.slot_limit % BITS;
        if tail != 0 && self.slot_limit < self.words.len() * BITS {
            let last = self.slot_limit / BITS;
            self.words[last].fetch_or(u64::MAX << tail, Ordering::Release);
        }
    }
}

impl Default for SlotMask {
    /// A growable mask with one live word.
    fn default() -> Self {
        Self::growable(1, Self::DEFAULT_MAX_WORDS)
    }
}

impl std::fmt::Debug for SlotMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotMask")
            .field("word_count", &self.word_count())
            .field("max_words", &self.max_words())
            .field("occupied", &self.occupied())
            .finish()
    }
}
