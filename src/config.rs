//! Arena configuration.

use crate::{
    block::MAX_BLOCK_SIZE,
    error::{Error, Result},
};

/// Default arena capacity: 1 MiB.
pub const DEFAULT_ARENA_SIZE: usize = 1_048_576;

/// Construction-time parameters of an allocator instance. Nothing here can
/// change once the arena is mapped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Bytes mapped from the OS. Must be a non-zero multiple of
    /// [`MAX_BLOCK_SIZE`].
    pub capacity: usize,

    /// Flag the head of every chunk carved at bootstrap as a boundary block.
    /// Coalescing never absorbs a boundary block into its predecessor, so
    /// merges stay inside the chunk they started in.
    pub mark_boundaries: bool,
}

impl ArenaConfig {
    pub const fn new() -> Self {
        Self {
            capacity: DEFAULT_ARENA_SIZE,
            mark_boundaries: true,
        }
    }

    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub const fn with_boundaries(mut self, mark_boundaries: bool) -> Self {
        self.mark_boundaries = mark_boundaries;
        self
    }

    /// Number of maximum-size chunks bootstrap carves.
    pub const fn chunks(&self) -> usize {
        self.capacity / MAX_BLOCK_SIZE
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::InvalidConfig("capacity must not be zero"));
        }
        if self.capacity % MAX_BLOCK_SIZE != 0 {
            return Err(Error::InvalidConfig("capacity must be a multiple of the maximum block size"));
        }
        Ok(())
    }
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self::new()
    }
}
