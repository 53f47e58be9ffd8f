use std::ptr::NonNull;

use log::{debug, trace};

use crate::{
    block::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, TAG_SIZE, Tag},
    config::ArenaConfig,
    error::{Error, Result},
    kernel::{page_size, request_memory, return_memory},
    utils::align,
};

/// The single memory region backing an allocator instance.
///
/// [`crate::kernel::request_memory`] gives us page aligned memory. We ask for it
/// exactly once and cut it into [`MAX_BLOCK_SIZE`] chunks right away. From then
/// on the region is just a sequence of blocks laid end to end, each one
/// carrying its own [`Tag`] at both ends:
///
/// ```text
/// start                                                            start + capacity
/// +------------------+------+--------+------------------+----------------+
/// | Block (boundary) | Used | Free   | Block (boundary) |      ...       |
/// +------------------+------+--------+------------------+----------------+
///  \________________ chunk ________/  \_______________ chunk ___________/
/// ```
///
/// Everything here works with byte offsets from the start of the region.
/// Offsets only turn into pointers when a payload is handed to the user.
pub(crate) struct Region {
    /// Start address returned by the kernel.
    base: NonNull<u8>,
    /// Usable bytes. The last block ends exactly here.
    capacity: usize,
    /// Bytes actually mapped, `capacity` rounded up to the page size.
    mapped_len: usize,
}

/// Which neighbours [`Region::coalesce`] may absorb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    #[cfg_attr(not(test), allow(dead_code))]
    Forward,
    #[cfg_attr(not(test), allow(dead_code))]
    Backward,
    Both,
}

impl Direction {
    fn forward(self) -> bool {
        matches!(self, Self::Forward | Self::Both)
    }

    fn backward(self) -> bool {
        matches!(self, Self::Backward | Self::Both)
    }
}

/// Snapshot of a single block, as reported by [`crate::Rmalloc::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Byte offset of the block's head tag from the arena start.
    pub offset: usize,
    /// Size of the block, tags included.
    pub size: usize,
    pub used: bool,
    pub boundary: bool,
}

/// Totals gathered by [`crate::Rmalloc::check`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub blocks: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    /// Size of the biggest free block, tags included.
    pub largest_free: usize,
}

impl HeapStats {
    fn record(&mut self, tag: Tag) {
        self.blocks += 1;

        if tag.used {
            self.used_blocks += 1;
            self.used_bytes += tag.size;
        } else {
            self.free_blocks += 1;
            self.free_bytes += tag.size;
            self.largest_free = self.largest_free.max(tag.size);
        }
    }
}

impl Region {
    /// Maps a fresh region and carves it into free maximum-size blocks.
    pub(crate) fn map(config: &ArenaConfig) -> Result<Self> {
        config.validate()?;

        let mapped_len = align(config.capacity, page_size());

        let base = unsafe { request_memory(mapped_len) }.ok_or(Error::MapFailed { len: mapped_len })?;

        // From here on dropping `region` gives the memory back.
        let mut region = Self {
            base,
            capacity: config.capacity,
            mapped_len,
        };

        for chunk in 0..config.chunks() {
            region.init_block(chunk * MAX_BLOCK_SIZE, MAX_BLOCK_SIZE, config.mark_boundaries)?;
        }

        debug!(
            "mapped arena at {:p}: {} bytes in {} chunks",
            base,
            config.capacity,
            config.chunks()
        );

        Ok(region)
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub(crate) fn start(&self) -> NonNull<u8> {
        self.base
    }

    /// Address right after the head tag of the block at `offset`.
    #[inline]
    pub(crate) fn payload(&self, offset: usize) -> NonNull<u8> {
        unsafe { self.base.add(offset + TAG_SIZE) }
    }

    /// Reads the tag word stored at `offset`.
    ///
    /// Callers make sure `offset + TAG_SIZE <= capacity`.
    #[inline]
    fn read_tag(&self, offset: usize) -> Tag {
        debug_assert!(offset + TAG_SIZE <= self.capacity);

        let word = unsafe { self.base.as_ptr().add(offset).cast::<u32>().read_unaligned() };

        Tag::decode(word)
    }

    #[inline]
    fn write_tag(&mut self, offset: usize, tag: Tag) {
        debug_assert!(offset + TAG_SIZE <= self.capacity);

        unsafe {
            self.base.as_ptr().add(offset).cast::<u32>().write_unaligned(tag.encode());
        }
    }

    /// Head tag of the block starting at `offset`.
    #[inline]
    pub(crate) fn head(&self, offset: usize) -> Tag {
        self.read_tag(offset)
    }

    /// Writes `tag` to both ends of the block starting at `offset`.
    #[inline]
    pub(crate) fn write_block(&mut self, offset: usize, tag: Tag) {
        self.write_tag(offset, tag);
        self.write_tag(offset + tag.size - TAG_SIZE, tag);
    }

    /// Turns `[offset, offset + size)` into a single free block.
    ///
    /// Nothing is written unless the size is within block limits, the block
    /// fits in the arena and its tags land on word boundaries.
    pub(crate) fn init_block(&mut self, offset: usize, size: usize, boundary: bool) -> Result<()> {
        let fits = offset
            .checked_add(size)
            .is_some_and(|end| end <= self.capacity);

        if !Tag::size_in_range(size) || !fits || offset % TAG_SIZE != 0 {
            return Err(Error::Range { offset, size });
        }

        self.write_block(offset, Tag::free(size, boundary));

        Ok(())
    }

    /// Offset of the block right after the one at `offset`, if any.
    pub(crate) fn next_block(&self, offset: usize) -> Option<usize> {
        let size = self.head(offset).size;

        if size == 0 {
            return None;
        }

        let next = offset + size;
        (next + TAG_SIZE <= self.capacity).then_some(next)
    }

    /// Offset of the block right before the one at `offset`, found through
    /// the tail tag that precedes our head.
    pub(crate) fn prev_block(&self, offset: usize) -> Option<usize> {
        if offset < TAG_SIZE {
            return None;
        }

        let size = self.read_tag(offset - TAG_SIZE).size;

        if size == 0 || size > offset {
            return None;
        }

        Some(offset - size)
    }

    /// Tries to hand out the block at `offset` for a request that needs a
    /// block of `needed` bytes.
    ///
    /// Returns `Ok(false)` if the block is used or too small. Otherwise the
    /// unused remainder is split off as a new free block (unless it would be
    /// too small to be worth it) and the block is marked used.
    pub(crate) fn claim(&mut self, offset: usize, needed: usize) -> Result<bool> {
        let mut tag = self.head(offset);

        if tag.used || tag.size < needed {
            return Ok(false);
        }

        let leftover = tag.size - needed;

        if leftover > MIN_BLOCK_SIZE {
            self.init_block(offset + needed, leftover, false)?;
            trace!("split block at {offset}: {needed} used, {leftover} free");
            tag.size = needed;
        }

        tag.used = true;
        self.write_block(offset, tag);

        Ok(true)
    }

    /// Tries to absorb the block right after the free block at `offset`.
    ///
    /// The neighbour must be free, must not start a chunk, and the merged
    /// block must still be a valid block. Returns whether a merge happened.
    pub(crate) fn merge_with_next(&mut self, offset: usize) -> bool {
        let tag = self.head(offset);

        if tag.used {
            return false;
        }

        let Some(next) = self.next_block(offset) else {
            return false;
        };

        let neighbour = self.head(next);

        if neighbour.used || neighbour.boundary {
            return false;
        }

        let size = tag.size + neighbour.size;

        if self.init_block(offset, size, tag.boundary).is_err() {
            return false;
        }

        trace!("merged block at {next} into {offset}, now {size} bytes");
        true
    }

    /// Tries to let the block right before the free block at `offset`
    /// absorb it. On success returns the offset of the merged block.
    pub(crate) fn merge_with_prev(&mut self, offset: usize) -> Option<usize> {
        let tag = self.head(offset);

        // A chunk head is never swallowed by the chunk before it.
        if tag.used || tag.boundary {
            return None;
        }

        let prev = self.prev_block(offset)?;
        let neighbour = self.head(prev);

        if neighbour.used || prev + neighbour.size != offset {
            return None;
        }

        let size = neighbour.size + tag.size;

        self.init_block(prev, size, neighbour.boundary).ok()?;

        trace!("merged block at {offset} into {prev}, now {size} bytes");
        Some(prev)
    }

    /// Merges the free block at `offset` with every eligible free neighbour
    /// in the requested direction(s), one at a time until none is left.
    ///
    /// Returns the start of the resulting block, which moves backwards when
    /// a predecessor absorbed us.
    pub(crate) fn coalesce(&mut self, mut offset: usize, direction: Direction) -> usize {
        if direction.forward() {
            while self.merge_with_next(offset) {}
        }

        if direction.backward() {
            while let Some(prev) = self.merge_with_prev(offset) {
                offset = prev;
            }
        }

        offset
    }

    /// Maps a payload pointer back to the offset of its block's head tag.
    ///
    /// Rejects anything that can't be a payload of this arena, including
    /// addresses whose head tag does not look like a real block.
    pub(crate) fn block_of(&self, ptr: NonNull<u8>) -> Result<usize> {
        let addr = ptr.as_ptr() as usize;
        let foreign = Error::ForeignPointer { addr };

        let offset = addr
            .checked_sub(self.base.as_ptr() as usize + TAG_SIZE)
            .filter(|offset| *offset < self.capacity && offset % MIN_BLOCK_SIZE == 0)
            .ok_or(foreign.clone())?;

        let tag = self.head(offset);

        if !Tag::size_in_range(tag.size) || offset + tag.size > self.capacity {
            return Err(foreign);
        }

        if self.read_tag(offset + tag.size - TAG_SIZE) != tag {
            return Err(foreign);
        }

        Ok(offset)
    }

    pub(crate) fn blocks(&self) -> Blocks<'_> {
        Blocks {
            region: Some(self),
            offset: 0,
        }
    }

    /// Walks the whole arena and verifies that head and tail tags agree, that
    /// every size is valid and that the blocks tile the arena exactly.
    pub(crate) fn check(&self) -> Result<HeapStats> {
        let mut stats = HeapStats::default();
        let mut offset = 0;

        while offset < self.capacity {
            let tag = self.head(offset);

            if !Tag::size_in_range(tag.size) {
                return Err(Error::Corrupted {
                    offset,
                    reason: "block size out of range",
                });
            }

            if offset + tag.size > self.capacity {
                return Err(Error::Corrupted {
                    offset,
                    reason: "block runs past the arena end",
                });
            }

            if self.read_tag(offset + tag.size - TAG_SIZE) != tag {
                return Err(Error::Corrupted {
                    offset,
                    reason: "head and tail tags disagree",
                });
            }

            stats.record(tag);
            offset += tag.size;
        }

        Ok(stats)
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { return_memory(self.base, self.mapped_len) };
        debug!("unmapped arena at {:p}", self.base);
    }
}

/// Iterator over the blocks of an arena in address order.
pub struct Blocks<'a> {
    region: Option<&'a Region>,
    offset: usize,
}

impl<'a> Blocks<'a> {
    /// Iterator that yields nothing, for allocators without an arena.
    pub(crate) fn empty() -> Self {
        Self {
            region: None,
            offset: 0,
        }
    }
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let region = self.region?;

        if self.offset + TAG_SIZE > region.capacity {
            return None;
        }

        let tag = region.head(self.offset);
        let info = BlockInfo {
            offset: self.offset,
            size: tag.size,
            used: tag.used,
            boundary: tag.boundary,
        };

        // A zero size can only come from corruption, stop instead of spinning.
        self.offset = match tag.size {
            0 => region.capacity,
            size => self.offset + size,
        };

        Some(info)
    }
}
