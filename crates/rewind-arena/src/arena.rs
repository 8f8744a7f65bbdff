//! Rewindable arena orchestrator.
//!
//! [`RewindArena`] bump-allocates out of a table of blocks and invalidates
//! everything at once on [`RewindArena::rewind`]. The lifecycle per epoch
//! is:
//!
//! 1. Workers call `allocate` / `alloc_slice` concurrently through `&self`.
//! 2. Once all allocating work is done, the owner calls `rewind()` (which
//!    needs `&mut self`, so no allocation can be in flight).
//! 3. The generation advances; every handle from step 1 is now stale.
//!
//! Block reclamation lags one epoch behind: blocks beyond the first are
//! kept across a rewind if the epoch used them, and released at the next
//! rewind if it did not.

#![allow(unsafe_code)]

use std::fmt;
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};

use crate::block::{Block, BlockTable, FREE_GRANULE};
use crate::config::{ArenaConfig, StalePolicy, CACHE_LINE};
use crate::error::ArenaError;
use crate::handle::{ArenaId, Generation, Handle, RawHandle};
use crate::raw::{BackingAllocator, SystemAllocator};

fn align_up(value: usize, align: usize) -> Option<usize> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}

/// Bump arena with epoch-based bulk reset.
///
/// `allocate` and the typed allocators are safe to call from many threads
/// at once. `rewind` and `dispose` take `&mut self` and therefore act as
/// the synchronisation barrier between epochs.
pub struct RewindArena<A: BackingAllocator = SystemAllocator> {
    id: ArenaId,
    config: ArenaConfig,
    blocks: BlockTable,
    allocator: A,
    generation: Generation,
    disposed: bool,
}

// Compile-time assertion: RewindArena must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<RewindArena>();
};

impl RewindArena<SystemAllocator> {
    /// Create an arena on the system allocator.
    ///
    /// Allocates the first block of `config.initial_block_bytes` (rounded up
    /// to a cache line).
    pub fn new(config: ArenaConfig) -> Result<Self, ArenaError> {
        Self::with_allocator(config, SystemAllocator)
    }
}

impl<A: BackingAllocator> RewindArena<A> {
    /// Create an arena that draws blocks from `allocator`.
    pub fn with_allocator(config: ArenaConfig, allocator: A) -> Result<Self, ArenaError> {
        config.validate()?;
        let first_bytes = align_up(config.initial_block_bytes, CACHE_LINE).ok_or(
            ArenaError::RequestTooLarge {
                requested: config.initial_block_bytes,
                limit: ArenaConfig::MAX_BLOCK_LIMIT,
            },
        )?;
        let first = Block::new(
            &allocator,
            first_bytes,
            CACHE_LINE,
            config.enable_individual_free,
        )?;
        let blocks = BlockTable::new(config.max_blocks);
        if let Err(block) = blocks.install(0, first) {
            // SAFETY: block was created with `allocator` just above.
            unsafe { block.release(&allocator) };
            return Err(ArenaError::CapacityExceeded {
                requested: first_bytes,
                max_blocks: config.max_blocks,
            });
        }

        let id = ArenaId::next();
        tracing::debug!(
            arena = id.0,
            block_bytes = first_bytes,
            individual_free = config.enable_individual_free,
            "arena initialised"
        );
        Ok(Self {
            id,
            generation: config.initial_generation,
            config,
            blocks,
            allocator,
            disposed: false,
        })
    }

    /// Reserve `size * count` bytes aligned to `align`.
    ///
    /// The returned memory is uninitialised. The handle is valid until the
    /// next [`rewind`](Self::rewind). With `enable_individual_free` every
    /// allocation is at least 16 bytes and 16-byte aligned.
    pub fn allocate(
        &self,
        size: usize,
        align: usize,
        count: usize,
    ) -> Result<RawHandle, ArenaError> {
        self.ensure_live()?;
        let invalid = ArenaError::InvalidLayout { size, align, count };
        if !align.is_power_of_two() {
            return Err(invalid);
        }
        let (min_bytes, align) = if self.config.enable_individual_free {
            (1, align.max(FREE_GRANULE))
        } else {
            (0, align)
        };
        let bytes = size
            .checked_mul(count)
            .and_then(|b| align_up(b.max(min_bytes), align))
            .ok_or(invalid)?;
        let (block, ptr, lap) = self.bump(bytes, align)?;
        Ok(RawHandle {
            ptr,
            len: bytes,
            generation: self.generation,
            arena: self.id,
            block: block as u32,
            lap,
        })
    }

    /// Allocate `len` copies of `fill`.
    pub fn alloc_slice<T: Copy>(&self, len: usize, fill: T) -> Result<Handle<T>, ArenaError> {
        let raw = self.allocate(size_of::<T>(), align_of::<T>(), len)?;
        let base = raw.ptr.cast::<T>().as_ptr();
        for i in 0..len {
            // SAFETY: [base, base + len) was reserved for this call alone and
            // is sized and aligned for `len` values of T.
            unsafe { base.add(i).write(fill) };
        }
        Ok(Handle::new(raw, len))
    }

    /// Allocate a single value.
    pub fn alloc_value<T: Copy>(&self, value: T) -> Result<Handle<T>, ArenaError> {
        self.alloc_slice(1, value)
    }

    /// Allocate a copy of `src`.
    pub fn alloc_copy<T: Copy>(&self, src: &[T]) -> Result<Handle<T>, ArenaError> {
        let raw = self.allocate(size_of::<T>(), align_of::<T>(), src.len())?;
        // SAFETY: the destination was reserved for this call alone, is sized
        // and aligned for src.len() values, and cannot overlap `src`, which
        // is borrowed memory outside any fresh reservation.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), raw.ptr.cast::<T>().as_ptr(), src.len());
        }
        Ok(Handle::new(raw, src.len()))
    }

    /// Check a handle and return its address.
    ///
    /// Fails with [`ArenaError::StaleHandle`] if the arena has rewound since
    /// the handle was issued, and [`ArenaError::ForeignHandle`] if another
    /// arena issued it. Never panics, regardless of [`StalePolicy`].
    pub fn resolve(&self, handle: &RawHandle) -> Result<NonNull<u8>, ArenaError> {
        self.ensure_live()?;
        if handle.arena != self.id {
            return Err(ArenaError::ForeignHandle {
                handle_arena: handle.arena.0,
                arena: self.id.0,
            });
        }
        if handle.generation != self.generation {
            return Err(ArenaError::StaleHandle {
                handle_generation: handle.generation.0,
                current: self.generation.0,
            });
        }
        Ok(handle.ptr)
    }

    /// Whether `handle` is valid in this arena right now.
    pub fn is_valid(&self, handle: &RawHandle) -> bool {
        self.resolve(handle).is_ok()
    }

    /// Shared view of a typed allocation.
    pub fn get<T: Copy>(&self, handle: &Handle<T>) -> Result<&[T], ArenaError> {
        let ptr = self.checked(&handle.raw)?.cast::<T>();
        // SAFETY: the handle is live in this arena, so its elements were
        // initialised by a typed allocator and stay mapped while &self is
        // borrowed (rewind and dispose need &mut self). Mutable views need
        // &mut self, so none can coexist with this one.
        Ok(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), handle.len) })
    }

    /// Exclusive view of a typed allocation.
    pub fn get_mut<T: Copy>(&mut self, handle: &Handle<T>) -> Result<&mut [T], ArenaError> {
        let ptr = self.checked(&handle.raw)?.cast::<T>();
        // SAFETY: as in `get`; &mut self rules out every other view.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), handle.len) })
    }

    /// Read one element.
    pub fn read<T: Copy>(&self, handle: &Handle<T>, index: usize) -> Result<T, ArenaError> {
        let data = self.get(handle)?;
        data.get(index).copied().ok_or(ArenaError::OutOfBounds {
            index,
            len: handle.len,
        })
    }

    /// Write one element. Under [`StalePolicy::Ignore`] a stale write is
    /// dropped and reported.
    pub fn write<T: Copy>(
        &mut self,
        handle: &Handle<T>,
        index: usize,
        value: T,
    ) -> Result<(), ArenaError> {
        let len = handle.len;
        let slot = self
            .get_mut(handle)?
            .get_mut(index)
            .ok_or(ArenaError::OutOfBounds { index, len })?;
        *slot = value;
        Ok(())
    }

    /// Release one allocation before the next rewind.
    ///
    /// Only available with `enable_individual_free`. When a block's last
    /// live allocation is freed, the whole block is reclaimed for reuse
    /// within the current epoch. Freeing a handle that is no longer live,
    /// because it was already freed or its block has since been reclaimed,
    /// fails with [`ArenaError::InvalidFree`] and changes nothing.
    ///
    /// # Safety
    ///
    /// No reference derived from `handle`, or from any copy of it, may be
    /// used after this call: its memory can be handed to another caller.
    /// A repeated free of `handle` must not run concurrently with frees of
    /// other allocations in the same block; sequential repeats are always
    /// rejected.
    pub unsafe fn free(&self, handle: RawHandle) -> Result<(), ArenaError> {
        if !self.config.enable_individual_free {
            return Err(ArenaError::IndividualFreeDisabled);
        }
        self.resolve(&handle)?;
        let index = handle.block as usize;
        let invalid = ArenaError::InvalidFree {
            block: handle.block,
        };
        let block = self
            .blocks
            .get(index)
            .filter(|b| b.contains(handle.ptr.as_ptr(), handle.len))
            .ok_or(invalid.clone())?;
        let offset = handle.ptr.as_ptr() as usize - block.base().as_ptr() as usize;
        match block.free_allocation(offset, handle.lap) {
            Ok(true) => {
                self.blocks.retreat_current(index);
                tracing::trace!(arena = self.id.0, block = handle.block, "arena block reclaimed");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(()) => Err(invalid),
        }
    }

    /// Typed form of [`free`](Self::free).
    ///
    /// # Safety
    ///
    /// Same contract as [`free`](Self::free).
    pub unsafe fn free_slice<T>(&self, handle: Handle<T>) -> Result<(), ArenaError> {
        // SAFETY: forwarded contract.
        unsafe { self.free(handle.raw) }
    }

    /// Invalidate every allocation and start a new epoch.
    ///
    /// Resets every block's cursor without touching the backing allocator.
    /// If the epoch that just ended allocated nothing outside the first
    /// block, the surplus blocks are released.
    pub fn rewind(&mut self) -> Result<(), ArenaError> {
        self.ensure_live()?;
        let surplus_used = self.blocks.used_from(1);
        self.generation = self.generation.next();
        self.blocks.reset();
        if surplus_used == 0 && self.blocks.len() > 1 {
            // SAFETY: every block in the table came from self.allocator.
            let released = unsafe { self.blocks.truncate(1, &self.allocator) };
            tracing::debug!(arena = self.id.0, released, "released surplus arena blocks");
        }
        tracing::trace!(
            arena = self.id.0,
            generation = self.generation.0,
            blocks = self.blocks.len(),
            "arena rewound"
        );
        Ok(())
    }

    /// Release every block and retire the arena.
    ///
    /// Every later call, including a second `dispose`, fails with
    /// [`ArenaError::Disposed`].
    pub fn dispose(&mut self) -> Result<(), ArenaError> {
        self.ensure_live()?;
        // SAFETY: every block in the table came from self.allocator.
        let released = unsafe { self.blocks.truncate(0, &self.allocator) };
        self.generation = self.generation.next();
        self.disposed = true;
        tracing::debug!(arena = self.id.0, released, "arena disposed");
        Ok(())
    }

    /// Bytes handed out in the current epoch, including alignment padding.
    pub fn bytes_allocated(&self) -> usize {
        self.blocks.used_from(0)
    }

    /// Number of blocks currently held.
    pub fn blocks_allocated(&self) -> usize {
        self.blocks.len()
    }

    /// Total capacity of the blocks currently held.
    pub fn reserved_bytes(&self) -> usize {
        self.blocks.reserved()
    }

    /// Allocations not yet individually freed. Always 0 unless
    /// `enable_individual_free` is set.
    pub fn live_allocations(&self) -> usize {
        self.blocks.live()
    }

    /// Current generation.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// This arena's identity.
    pub fn id(&self) -> ArenaId {
        self.id
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Arena configuration.
    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// The backing allocator.
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    fn ensure_live(&self) -> Result<(), ArenaError> {
        if self.disposed {
            Err(ArenaError::Disposed)
        } else {
            Ok(())
        }
    }

    /// `resolve` with the configured stale policy applied.
    fn checked(&self, handle: &RawHandle) -> Result<NonNull<u8>, ArenaError> {
        match self.resolve(handle) {
            Err(e @ (ArenaError::StaleHandle { .. } | ArenaError::ForeignHandle { .. }))
                if self.config.stale_policy == StalePolicy::Panic =>
            {
                panic!("{e}")
            }
            other => other,
        }
    }

    /// Claim `bytes` from the current block, reusing or appending blocks as
    /// needed. Returns the block index, start address and block lap.
    fn bump(&self, bytes: usize, align: usize) -> Result<(usize, NonNull<u8>, u32), ArenaError> {
        let mut spare: Option<Block> = None;
        let result = loop {
            let current = self.blocks.current();
            let len = self.blocks.len();
            if let Some(hit) = self.bump_existing(current, len, bytes, align) {
                break Ok(hit);
            }
            if len >= self.blocks.max_blocks() {
                break Err(ArenaError::CapacityExceeded {
                    requested: bytes,
                    max_blocks: self.blocks.max_blocks(),
                });
            }
            // A block left over from a lost install race is reused if it
            // still fits this request.
            let block = match spare.take() {
                Some(b) if b.fits(bytes, align) => b,
                leftover => {
                    if let Some(b) = leftover {
                        self.release_block(b);
                    }
                    match self.new_block(bytes, align) {
                        Ok(b) => b,
                        Err(e) => break Err(e),
                    }
                }
            };
            let block_bytes = block.capacity();
            match self.blocks.install(len, block) {
                Ok(()) => {
                    self.blocks.advance_current(len);
                    tracing::debug!(
                        arena = self.id.0,
                        index = len,
                        block_bytes,
                        "allocated arena block"
                    );
                }
                Err(block) => spare = Some(block),
            }
        };
        if let Some(b) = spare {
            self.release_block(b);
        }
        result
    }

    /// Try blocks `current..len` in order. Blocks below `current` are
    /// full, or were reclaimed by individual free, which moves `current`
    /// back to them.
    fn bump_existing(
        &self,
        current: usize,
        len: usize,
        bytes: usize,
        align: usize,
    ) -> Option<(usize, NonNull<u8>, u32)> {
        (current..len).find_map(|index| {
            let block = self.blocks.get(index)?;
            let (offset, lap) = block.try_bump(bytes, align)?;
            if index != current {
                self.blocks.advance_current(index);
                tracing::trace!(arena = self.id.0, index, "reusing arena block");
            }
            // SAFETY: try_bump guarantees offset + bytes <= capacity.
            Some((index, unsafe { block.base().add(offset) }, lap))
        })
    }

    /// Size of a block created to serve a `bytes` request.
    ///
    /// `max(initial, bytes rounded to a cache line)` capped at
    /// `max_block_bytes`; above the cap, whole multiples of the cap.
    fn block_size_for(&self, bytes: usize) -> Option<usize> {
        let needed = align_up(bytes.max(1), CACHE_LINE)?;
        let max = self.config.max_block_bytes;
        let size = if needed <= max {
            needed.max(self.config.initial_block_bytes).min(max)
        } else {
            needed.div_ceil(max).checked_mul(max)?
        };
        (size as u64 <= ArenaConfig::MAX_BLOCK_LIMIT).then_some(size)
    }

    fn new_block(&self, bytes: usize, align: usize) -> Result<Block, ArenaError> {
        let capacity = self
            .block_size_for(bytes)
            .ok_or(ArenaError::RequestTooLarge {
                requested: bytes,
                limit: ArenaConfig::MAX_BLOCK_LIMIT,
            })?;
        Block::new(
            &self.allocator,
            capacity,
            align.max(CACHE_LINE),
            self.config.enable_individual_free,
        )
    }

    fn release_block(&self, block: Block) {
        // SAFETY: every block the arena creates comes from self.allocator.
        unsafe { block.release(&self.allocator) };
    }
}

impl<A: BackingAllocator> Drop for RewindArena<A> {
    fn drop(&mut self) {
        if !self.disposed {
            // SAFETY: every block in the table came from self.allocator.
            unsafe { self.blocks.truncate(0, &self.allocator) };
        }
    }
}

impl<A: BackingAllocator> fmt::Debug for RewindArena<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RewindArena")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("blocks", &self.blocks.len())
            .field("bytes_allocated", &self.bytes_allocated())
            .field("disposed", &self.disposed)
            .finish()
    }
}
