//! Helper functions for the allocator that don't belong to any particular module.

use crate::block::{BLOCK_META_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// Rounds `to_be_aligned` up to a multiple of `alignment`, which must be a power of two.
///
/// This method is used to round the arena mapping up to a multiple of
/// [`crate::kernel::page_size`].
pub fn align(to_be_aligned: usize, alignment: usize) -> usize {
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// Block size needed to serve a request of `requested` payload bytes.
///
/// The payload plus both tags is rounded up to the next power of two and never
/// drops below [`MIN_BLOCK_SIZE`]. Returns `None` when no block in the arena
/// could ever hold the request.
pub fn block_size_for(requested: usize) -> Option<usize> {
    let size = requested
        .checked_add(BLOCK_META_SIZE)?
        .checked_next_power_of_two()?
        .max(MIN_BLOCK_SIZE);

    (size <= MAX_BLOCK_SIZE).then_some(size)
}
