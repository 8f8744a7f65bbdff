//! Arena configuration parameters.

use crate::error::ArenaError;
use crate::handle::Generation;

/// Cache line size assumed for block sizing and block base alignment.
pub const CACHE_LINE: usize = 64;

/// What a typed access through a stale handle does.
///
/// Stale access is always a caller bug. Debug builds default to
/// panicking at the offending call; release builds default to reporting
/// [`ArenaError::StaleHandle`] and dropping any write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StalePolicy {
    /// Panic on stale access.
    Panic,
    /// Return `ArenaError::StaleHandle` and leave memory untouched.
    Ignore,
}

/// Configuration for [`RewindArena`](crate::RewindArena).
///
/// Validated at construction; immutable afterwards.
#[derive(Clone, Debug)]
pub struct ArenaConfig {
    /// Size of the first block, and the floor for every later block.
    pub initial_block_bytes: usize,

    /// Ceiling on the size of a block created for an ordinary request.
    ///
    /// Requests larger than this get a dedicated block sized in whole
    /// multiples of `max_block_bytes`. Default: 64 MiB.
    pub max_block_bytes: usize,

    /// Maximum number of blocks alive at once. Default: 1024.
    pub max_blocks: usize,

    /// Whether allocations may be freed individually before a rewind.
    pub enable_individual_free: bool,

    /// Generation the arena starts at. Default: 1.
    pub initial_generation: Generation,

    /// Behaviour of typed accessors on stale handles.
    pub stale_policy: StalePolicy,
}

impl ArenaConfig {
    /// Default block size ceiling: 64 MiB.
    pub const DEFAULT_MAX_BLOCK_BYTES: usize = 64 * 1024 * 1024;

    /// Default block count limit.
    pub const DEFAULT_MAX_BLOCKS: usize = 1024;

    /// Default stale access policy for this build profile.
    pub const DEFAULT_STALE_POLICY: StalePolicy = if cfg!(debug_assertions) {
        StalePolicy::Panic
    } else {
        StalePolicy::Ignore
    };

    /// Largest block the arena can track (bump offsets are 40 bits wide).
    pub const MAX_BLOCK_LIMIT: u64 = (1 << 40) - 1;

    /// Create a config with the given initial block size and defaults
    /// for everything else.
    pub fn new(initial_block_bytes: usize) -> Self {
        Self {
            initial_block_bytes,
            max_block_bytes: Self::DEFAULT_MAX_BLOCK_BYTES.max(initial_block_bytes),
            max_blocks: Self::DEFAULT_MAX_BLOCKS,
            enable_individual_free: false,
            initial_generation: Generation::INITIAL,
            stale_policy: Self::DEFAULT_STALE_POLICY,
        }
    }

    /// Enable or disable per-allocation free.
    pub fn with_individual_free(mut self, enabled: bool) -> Self {
        self.enable_individual_free = enabled;
        self
    }

    /// Set the block size ceiling.
    pub fn with_max_block_bytes(mut self, bytes: usize) -> Self {
        self.max_block_bytes = bytes;
        self
    }

    /// Set the block count limit.
    pub fn with_max_blocks(mut self, blocks: usize) -> Self {
        self.max_blocks = blocks;
        self
    }

    /// Set the starting generation.
    pub fn with_initial_generation(mut self, generation: u32) -> Self {
        self.initial_generation = Generation(generation);
        self
    }

    /// Set the stale access policy.
    pub fn with_stale_policy(mut self, policy: StalePolicy) -> Self {
        self.stale_policy = policy;
        self
    }

    /// Check the config for values the arena cannot honour.
    pub fn validate(&self) -> Result<(), ArenaError> {
        if self.initial_block_bytes == 0 {
            return Err(ArenaError::InvalidConfig {
                reason: "initial_block_bytes must be > 0".into(),
            });
        }
        if self.max_block_bytes < self.initial_block_bytes {
            return Err(ArenaError::InvalidConfig {
                reason: format!(
                    "max_block_bytes ({}) must be >= initial_block_bytes ({})",
                    self.max_block_bytes, self.initial_block_bytes,
                ),
            });
        }
        if self.max_block_bytes as u64 > Self::MAX_BLOCK_LIMIT {
            return Err(ArenaError::InvalidConfig {
                reason: format!(
                    "max_block_bytes ({}) exceeds the {} byte block limit",
                    self.max_block_bytes,
                    Self::MAX_BLOCK_LIMIT,
                ),
            });
        }
        if self.max_blocks == 0 {
            return Err(ArenaError::InvalidConfig {
                reason: "max_blocks must be >= 1".into(),
            });
        }
        Ok(())
    }
}
