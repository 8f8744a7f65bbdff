//! Raw memory blocks and the lock-free block table.
//!
//! A [`Block`] is one contiguous region from the backing allocator with an
//! atomic bump cursor. A [`BlockTable`] is the arena's index-addressed list
//! of blocks. Both support concurrent allocation through `&self`; anything
//! that resets or frees blocks takes `&mut self`.

#![allow(unsafe_code)]

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use rewind_mask::SlotMask;

use crate::error::ArenaError;
use crate::raw::BackingAllocator;

/// Bump offset occupies the low 40 bits of the packed state; the live
/// allocation count (individual-free mode only) occupies the high 24.
const OFFSET_BITS: u32 = 40;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;
const LIVE_ONE: u64 = 1 << OFFSET_BITS;
const MAX_LIVE: u64 = (1 << (u64::BITS - OFFSET_BITS)) - 1;

fn pack(offset: u64, live: u64) -> u64 {
    (live << OFFSET_BITS) | offset
}

fn unpack(state: u64) -> (u64, u64) {
    (state & OFFSET_MASK, state >> OFFSET_BITS)
}

/// Allocation start granularity in individual-free mode. Every tracked
/// allocation starts on its own granule, so one bit per granule records
/// which allocations are still live.
pub(crate) const FREE_GRANULE: usize = 16;

/// State of a tracked block while its last live allocation is released:
/// no live count, and an offset past any capacity so no bump fits.
const SEALED: u64 = OFFSET_MASK;

/// A single contiguous memory block with bump allocation.
pub(crate) struct Block {
    base: NonNull<u8>,
    capacity: usize,
    align: usize,
    /// Packed bump offset and live count, updated only by CAS.
    state: AtomicU64,
    /// Number of times individual free has reclaimed the block. Advanced
    /// while the block is sealed, so a bump always reads the lap it
    /// belongs to.
    lap: AtomicU32,
    /// Individual-free mode only: one bit per granule, set while the
    /// allocation starting there is live.
    starts: Option<SlotMask>,
}

// SAFETY: the block only hands out disjoint byte ranges through atomic
// CAS on `state`; `base`, `capacity` and `align` are immutable.
unsafe impl Send for Block {}
// SAFETY: as above.
unsafe impl Sync for Block {}

impl Block {
    /// Obtain a block of `capacity` bytes aligned to `align`.
    ///
    /// `track` enables per-allocation bookkeeping for individual free.
    pub(crate) fn new<A: BackingAllocator>(
        allocator: &A,
        capacity: usize,
        align: usize,
        track: bool,
    ) -> Result<Self, ArenaError> {
        let base = allocator
            .raw_allocate(capacity, align)
            .ok_or(ArenaError::BackingAllocationFailed { bytes: capacity })?;
        Ok(Self {
            base,
            capacity,
            align,
            state: AtomicU64::new(0),
            lap: AtomicU32::new(0),
            starts: track.then(|| SlotMask::fixed(capacity.div_ceil(FREE_GRANULE))),
        })
    }

    /// Claim `bytes` bytes aligned to `align`, returning the offset and
    /// the block's current lap.
    ///
    /// Tracked blocks bump the live count alongside the offset and record
    /// the allocation's start; their requests must be at least one byte
    /// and granule aligned. Returns `None` if the block cannot fit the
    /// request.
    pub(crate) fn try_bump(&self, bytes: usize, align: usize) -> Option<(usize, u32)> {
        let track = self.starts.is_some();
        debug_assert!(!track || (bytes > 0 && align >= FREE_GRANULE));
        let base = self.base.as_ptr() as usize;
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            let (offset, live) = unpack(state);
            // Align the absolute address so over-aligned requests work in
            // blocks whose base is only cache-line aligned.
            let addr = base.checked_add(offset as usize)?;
            let aligned = addr.checked_add(align - 1)? & !(align - 1);
            let start = aligned - base;
            let end = start.checked_add(bytes)?;
            if end > self.capacity {
                return None;
            }
            let live = if track {
                if live == MAX_LIVE {
                    return None;
                }
                live + 1
            } else {
                live
            };
            let next = pack(end as u64, live);
            match self
                .state
                .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if let Some(starts) = &self.starts {
                        // Starts are unique within a lap and all cleared
                        // before a reclaim.
                        let claimed = starts.try_claim(start / FREE_GRANULE, 1);
                        debug_assert!(claimed.is_ok(), "allocation start claimed twice");
                    }
                    return Some((start, self.lap.load(Ordering::Acquire)));
                }
                Err(observed) => state = observed,
            }
        }
    }

    /// Free the tracked allocation starting at `offset`, issued in `lap`.
    ///
    /// Returns `Ok(true)` if it was the block's last live allocation, in
    /// which case the whole block has been reclaimed. Fails without side
    /// effects if that allocation is not live: it was already freed, or it
    /// was issued before the block was last reclaimed.
    pub(crate) fn free_allocation(&self, offset: usize, lap: u32) -> Result<bool, ()> {
        let starts = self.starts.as_ref().ok_or(())?;
        if offset % FREE_GRANULE != 0 || self.lap.load(Ordering::Acquire) != lap {
            return Err(());
        }
        starts.try_free(offset / FREE_GRANULE, 1).map_err(|_| ())?;
        self.drop_live()
    }

    /// Drop one live allocation. The last one seals the block, advances
    /// the lap and reopens the block at offset 0.
    fn drop_live(&self) -> Result<bool, ()> {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            let (_, live) = unpack(state);
            if live == 0 {
                return Err(());
            }
            let next = if live == 1 { SEALED } else { state - LIVE_ONE };
            match self
                .state
                .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) if live == 1 => {
                    self.lap.fetch_add(1, Ordering::AcqRel);
                    self.state.store(0, Ordering::Release);
                    return Ok(true);
                }
                Ok(_) => return Ok(false),
                Err(observed) => state = observed,
            }
        }
    }

    /// Whether `[ptr, ptr + len)` lies inside the block's handed-out range.
    pub(crate) fn contains(&self, ptr: *const u8, len: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= base && addr.saturating_add(len) <= base + self.used()
    }

    /// Reset the bump offset, live count and start records. All previous
    /// allocations in this block become invalid.
    pub(crate) fn reset(&mut self) {
        *self.state.get_mut() = 0;
        if let Some(starts) = self.starts.as_mut() {
            starts.clear();
        }
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Bytes handed out since the last reset, including alignment padding.
    pub(crate) fn used(&self) -> usize {
        let state = self.state.load(Ordering::Acquire);
        if self.starts.is_some() && state == SEALED {
            return 0;
        }
        unpack(state).0 as usize
    }

    /// Live allocations (individual-free mode only).
    pub(crate) fn live(&self) -> usize {
        unpack(self.state.load(Ordering::Acquire)).1 as usize
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether an empty block of this shape can hold the request.
    pub(crate) fn fits(&self, bytes: usize, align: usize) -> bool {
        self.align >= align && self.capacity >= bytes
    }

    /// Return the memory to the allocator it came from.
    ///
    /// # Safety
    ///
    /// `allocator` must be the allocator passed to [`Block::new`].
    pub(crate) unsafe fn release<A: BackingAllocator>(self, allocator: &A) {
        // SAFETY: base came from allocator.raw_allocate(capacity, align)
        // (caller contract) and is freed exactly once since self is consumed.
        unsafe { allocator.raw_free(self.base, self.capacity, self.align) };
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("base", &self.base)
            .field("capacity", &self.capacity)
            .field("used", &self.used())
            .field("live", &self.live())
            .finish()
    }
}

/// Index-addressed table of blocks with lock-free append.
///
/// Slots `0..len` are always populated. A new block is published by a CAS
/// of slot `len` from null, then `len` is advanced; a thread that finds a
/// populated slot at `len` helps advance it.
pub(crate) struct BlockTable {
    slots: Box<[AtomicPtr<Block>]>,
    len: AtomicUsize,
    /// Block currently receiving bump allocations.
    current: AtomicUsize,
}

impl BlockTable {
    pub(crate) fn new(max_blocks: usize) -> Self {
        Self {
            slots: (0..max_blocks)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
            len: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
        }
    }

    pub(crate) fn get(&self, index: usize) -> Option<&Block> {
        if index >= self.len() {
            return None;
        }
        let ptr = self.slots[index].load(Ordering::Acquire);
        // SAFETY: slots below len are non-null and point at blocks leaked
        // from a Box by `install`. They are only freed by `truncate`, which
        // takes &mut self, so the block outlives this shared borrow.
        unsafe { ptr.as_ref() }
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub(crate) fn max_blocks(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Move the current block forward to `index`. Never moves backwards.
    pub(crate) fn advance_current(&self, index: usize) {
        self.current.fetch_max(index, Ordering::AcqRel);
    }

    /// Move the current block back to `index`, a block that individual
    /// free just reclaimed.
    pub(crate) fn retreat_current(&self, index: usize) {
        self.current.fetch_min(index, Ordering::AcqRel);
    }

    /// Publish `block` at exactly `index`.
    ///
    /// Fails (handing the block back) if `index` is not the next free
    /// slot, either because another thread got there first or because the
    /// table is full.
    pub(crate) fn install(&self, index: usize, block: Block) -> Result<(), Block> {
        if index >= self.slots.len() {
            return Err(block);
        }
        let raw = Box::into_raw(Box::new(block));
        match self.slots[index].compare_exchange(
            ptr::null_mut(),
            raw,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                let _ = self
                    .len
                    .compare_exchange(index, index + 1, Ordering::AcqRel, Ordering::Acquire);
                Ok(())
            }
            Err(_) => {
                // Someone else owns this slot; make sure len reflects it.
                let _ = self
                    .len
                    .compare_exchange(index, index + 1, Ordering::AcqRel, Ordering::Acquire);
                // SAFETY: raw was produced by Box::into_raw above and never
                // published, so we still own it.
                Err(*unsafe { Box::from_raw(raw) })
            }
        }
    }

    /// Reset every block's cursor and make block 0 current.
    pub(crate) fn reset(&mut self) {
        let len = *self.len.get_mut();
        for slot in self.slots[..len].iter_mut() {
            let raw = *slot.get_mut();
            // SAFETY: populated slot owned by the table; &mut self excludes
            // any concurrent reader.
            if let Some(block) = unsafe { raw.as_mut() } {
                block.reset();
            }
        }
        *self.current.get_mut() = 0;
    }

    /// Free every block at index `keep` and above. Returns how many were
    /// released.
    ///
    /// # Safety
    ///
    /// `allocator` must be the allocator every block was created with.
    pub(crate) unsafe fn truncate<A: BackingAllocator>(
        &mut self,
        keep: usize,
        allocator: &A,
    ) -> usize {
        let len = *self.len.get_mut();
        let mut released = 0;
        for slot in self.slots.iter_mut().take(len).skip(keep) {
            let raw = std::mem::replace(slot.get_mut(), ptr::null_mut());
            if !raw.is_null() {
                // SAFETY: raw came from Box::into_raw in `install` and the
                // slot has just been cleared, so this is the only owner.
                let block = unsafe { Box::from_raw(raw) };
                // SAFETY: caller guarantees the allocator matches.
                unsafe { block.release(allocator) };
                released += 1;
            }
        }
        let len = self.len.get_mut();
        *len = (*len).min(keep);
        let current = self.current.get_mut();
        *current = (*current).min(keep.saturating_sub(1));
        released
    }

    /// Bytes handed out across blocks at index `from` and above.
    pub(crate) fn used_from(&self, from: usize) -> usize {
        (from..self.len())
            .filter_map(|i| self.get(i))
            .map(Block::used)
            .sum()
    }

    /// Live allocation count across all blocks.
    pub(crate) fn live(&self) -> usize {
        (0..self.len())
            .filter_map(|i| self.get(i))
            .map(Block::live)
            .sum()
    }

    /// Total capacity of all blocks.
    pub(crate) fn reserved(&self) -> usize {
        (0..self.len())
            .filter_map(|i| self.get(i))
            .map(Block::capacity)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::SystemAllocator;

    fn block(capacity: usize) -> Block {
        Block::new(&SystemAllocator, capacity, 64, false).unwrap()
    }

    fn tracked(capacity: usize) -> Block {
        Block::new(&SystemAllocator, capacity, 64, true).unwrap()
    }

    fn free(b: Block) {
        // SAFETY: created with SystemAllocator in `block` or `tracked`.
        unsafe { b.release(&SystemAllocator) };
    }

    #[test]
    fn pack_round_trip() {
        assert_eq!(unpack(pack(123, 4)), (123, 4));
        assert_eq!(unpack(pack(OFFSET_MASK, MAX_LIVE)), (OFFSET_MASK, MAX_LIVE));
    }

    #[test]
    fn sequential_bumps_are_contiguous() {
        let b = block(1024);
        assert_eq!(b.try_bump(100, 1), Some((0, 0)));
        assert_eq!(b.try_bump(200, 1), Some((100, 0)));
        assert_eq!(b.used(), 300);
        free(b);
    }

    #[test]
    fn bump_respects_alignment() {
        let b = block(1024);
        assert_eq!(b.try_bump(3, 1).map(|(o, _)| o), Some(0));
        assert_eq!(b.try_bump(8, 8).map(|(o, _)| o), Some(8));
        assert_eq!(b.try_bump(1, 32).map(|(o, _)| o), Some(32));
        free(b);
    }

    #[test]
    fn bump_fails_when_full() {
        let b = block(128);
        assert!(b.try_bump(128, 1).is_some());
        assert_eq!(b.try_bump(1, 1), None);
        assert_eq!(b.used(), 128);
        free(b);
    }

    #[test]
    fn reset_allows_reuse() {
        let mut b = block(128);
        b.try_bump(128, 1).unwrap();
        b.reset();
        assert_eq!(b.used(), 0);
        assert_eq!(b.try_bump(64, 1), Some((0, 0)));
        free(b);
    }

    #[test]
    fn last_free_reclaims_block_and_advances_lap() {
        let b = tracked(256);
        let (x, lap) = b.try_bump(16, 16).unwrap();
        let (y, _) = b.try_bump(16, 16).unwrap();
        assert_eq!(b.live(), 2);
        assert_eq!(b.free_allocation(x, lap), Ok(false));
        assert_eq!(b.used(), 32);
        assert_eq!(b.free_allocation(y, lap), Ok(true));
        assert_eq!(b.used(), 0);
        assert_eq!(b.try_bump(16, 16), Some((0, lap + 1)));
        free(b);
    }

    #[test]
    fn repeated_free_with_live_neighbour_is_rejected() {
        let b = tracked(256);
        let (x, lap) = b.try_bump(16, 16).unwrap();
        let (y, _) = b.try_bump(16, 16).unwrap();
        assert_eq!(b.free_allocation(y, lap), Ok(false));
        assert_eq!(b.free_allocation(y, lap), Err(()));
        // The neighbour keeps the block open.
        assert_eq!(b.live(), 1);
        assert_eq!(b.used(), 32);
        assert_eq!(b.try_bump(16, 16).map(|(o, _)| o), Some(32));
        assert_eq!(b.free_allocation(x, lap), Ok(false));
        free(b);
    }

    #[test]
    fn free_from_previous_lap_is_rejected() {
        let b = tracked(256);
        let (x, old_lap) = b.try_bump(16, 16).unwrap();
        assert_eq!(b.free_allocation(x, old_lap), Ok(true));
        // Reuse hands out the same start in a new lap.
        let (again, lap) = b.try_bump(16, 16).unwrap();
        assert_eq!(again, x);
        assert_eq!(b.free_allocation(x, old_lap), Err(()));
        assert_eq!(b.live(), 1);
        assert_eq!(b.free_allocation(again, lap), Ok(true));
        free(b);
    }

    #[test]
    fn untracked_block_refuses_individual_free() {
        let b = block(256);
        let (x, lap) = b.try_bump(16, 16).unwrap();
        assert_eq!(b.free_allocation(x, lap), Err(()));
        free(b);
    }

    #[test]
    fn reset_clears_start_records() {
        let mut b = tracked(256);
        let (x, lap) = b.try_bump(16, 16).unwrap();
        b.reset();
        assert_eq!(b.live(), 0);
        assert_eq!(b.free_allocation(x, lap), Err(()));
        assert_eq!(b.try_bump(16, 16), Some((0, lap)));
        free(b);
    }

    #[test]
    fn contains_checks_handed_out_range() {
        let b = block(256);
        let (off, _) = b.try_bump(16, 1).unwrap();
        // SAFETY: offset is within the block.
        let p = unsafe { b.base().as_ptr().add(off) };
        assert!(b.contains(p, 16));
        assert!(!b.contains(p, 17));
        free(b);
    }

    #[test]
    fn table_install_and_truncate() {
        let mut table = BlockTable::new(4);
        assert!(table.install(0, block(64)).is_ok());
        assert!(table.install(1, block(64)).is_ok());
        assert_eq!(table.len(), 2);
        // Slot 1 is taken: the block comes back.
        let rejected = table.install(1, block(64)).unwrap_err();
        free(rejected);
        // SAFETY: every block was created with SystemAllocator.
        let released = unsafe { table.truncate(1, &SystemAllocator) };
        assert_eq!(released, 1);
        assert_eq!(table.len(), 1);
        // SAFETY: as above.
        unsafe { table.truncate(0, &SystemAllocator) };
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn table_full_hands_block_back() {
        let mut table = BlockTable::new(1);
        assert!(table.install(0, block(64)).is_ok());
        let rejected = table.install(1, block(64)).unwrap_err();
        free(rejected);
        // SAFETY: created with SystemAllocator.
        unsafe { table.truncate(0, &SystemAllocator) };
    }

    #[test]
    fn table_reset_rewinds_current() {
        let mut table = BlockTable::new(4);
        table.install(0, block(64)).unwrap();
        table.install(1, block(64)).unwrap();
        table.get(1).unwrap().try_bump(10, 1).unwrap();
        table.advance_current(1);
        assert_eq!(table.used_from(1), 10);
        table.reset();
        assert_eq!(table.current(), 0);
        assert_eq!(table.used_from(0), 0);
        assert_eq!(table.reserved(), 128);
        // SAFETY: created with SystemAllocator.
        unsafe { table.truncate(0, &SystemAllocator) };
    }

    #[test]
    fn retreat_current_never_moves_forward() {
        let mut table = BlockTable::new(4);
        table.install(0, block(64)).unwrap();
        table.advance_current(2);
        table.retreat_current(0);
        assert_eq!(table.current(), 0);
        table.retreat_current(3);
        assert_eq!(table.current(), 0);
        // SAFETY: created with SystemAllocator.
        unsafe { table.truncate(0, &SystemAllocator) };
    }
}
