use std::{ops::Range, ptr::{self, NonNull}};

use log::{debug, trace, warn};

use crate::{
    config::ArenaConfig,
    error::{Error, Result},
    region::{Blocks, Direction, HeapStats, Region},
    utils::block_size_for,
};

/// Boundary-tag allocator over one fixed-size arena.
///
/// The arena is mapped lazily by the first allocation (or an explicit
/// [`Rmalloc::bootstrap`]) and given back on [`Rmalloc::teardown`] or drop.
/// Allocating after a teardown maps a brand new arena.
///
/// Searches start at the last block handed out (the rotation cursor) and run
/// to the end of the arena, then walk backwards from the cursor to the arena
/// start. Releasing a block merges it with its free neighbours.
///
/// The allocator holds raw pointers and is neither `Send` nor `Sync`. Share it
/// across threads only behind your own lock.
pub struct Rmalloc {
    config: ArenaConfig,
    /// `None` until bootstrap and after teardown.
    region: Option<Region>,
    /// Offset of the most recently allocated block. Always names a block head.
    cursor: Option<usize>,
}

impl Rmalloc {
    /// Allocator with the default 1 MiB arena.
    pub const fn new() -> Self {
        Self {
            config: ArenaConfig::new(),
            region: None,
            cursor: None,
        }
    }

    /// Allocator with a custom arena. Nothing is mapped yet.
    pub fn with_config(config: ArenaConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            region: None,
            cursor: None,
        })
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.region.is_some()
    }

    /// Maps and carves the arena. Does nothing if it already exists.
    pub fn bootstrap(&mut self) -> Result<()> {
        if self.region.is_none() {
            self.region = Some(Region::map(&self.config)?);
            self.cursor = None;
        }

        Ok(())
    }

    /// Gives the arena back to the OS. Every pointer handed out so far dangles
    /// afterwards. Does nothing if there is no arena.
    pub fn teardown(&mut self) {
        if let Some(region) = self.region.take() {
            debug!("tearing down arena of {} bytes", region.capacity());
        }

        self.cursor = None;
    }

    /// Returns a pointer to at least `size` usable bytes, or null when no
    /// block fits or the arena can't be mapped.
    ///
    /// The memory is not zeroed and is only aligned to 4 bytes.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        match self.try_allocate(size) {
            Ok(ptr) => ptr.as_ptr(),
            Err(err) => {
                trace!("allocation of {size} bytes failed: {err}");
                ptr::null_mut()
            }
        }
    }

    /// Same as [`Rmalloc::allocate`] but tells why it failed.
    pub fn try_allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        self.bootstrap()?;

        let needed = block_size_for(size).ok_or(Error::OutOfMemory { requested: size })?;

        let offset = self
            .find_free_block(needed)?
            .ok_or(Error::OutOfMemory { requested: size })?;

        self.cursor = Some(offset);

        let region = self.region()?;
        trace!("allocated {size} bytes in block at {offset} ({needed} bytes)");

        Ok(region.payload(offset))
    }

    /// Finds a free block of at least `needed` bytes and claims it.
    ///
    /// First pass goes forward from the cursor to the arena end, second pass
    /// goes backward from the block before the cursor to the arena start.
    fn find_free_block(&mut self, needed: usize) -> Result<Option<usize>> {
        let start = self.cursor.unwrap_or(0);
        let region = self.region_mut()?;

        let mut current = Some(start);
        while let Some(offset) = current {
            if region.claim(offset, needed)? {
                return Ok(Some(offset));
            }
            current = region.next_block(offset);
        }

        let mut current = region.prev_block(start);
        while let Some(offset) = current {
            if region.claim(offset, needed)? {
                return Ok(Some(offset));
            }
            current = region.prev_block(offset);
        }

        Ok(None)
    }

    /// Frees the block owning `ptr` and merges it with its free neighbours.
    ///
    /// Null pointers and blocks that are already free are ignored. Pointers
    /// that don't belong to this arena are ignored too (and logged).
    pub fn release(&mut self, ptr: *mut u8) {
        match self.try_release(ptr) {
            Ok(()) => {}
            Err(Error::DoubleFree { offset }) => trace!("block at {offset} released twice"),
            Err(err) => warn!("ignoring release of {ptr:p}: {err}"),
        }
    }

    /// Same as [`Rmalloc::release`] but reports double frees and foreign
    /// pointers instead of ignoring them. A null pointer is still fine.
    pub fn try_release(&mut self, ptr: *mut u8) -> Result<()> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(());
        };

        let region = self.region.as_mut().ok_or(Error::ForeignPointer {
            addr: ptr.as_ptr() as usize,
        })?;

        let offset = region.block_of(ptr)?;
        let mut tag = region.head(offset);

        if !tag.used {
            return Err(Error::DoubleFree { offset });
        }

        tag.used = false;
        region.write_block(offset, tag);

        let merged = region.coalesce(offset, Direction::Both);
        let span = merged..merged + region.head(merged).size;

        // The cursor must keep pointing at a block head, not into the middle
        // of the block that just swallowed it.
        if self.cursor.is_some_and(|cursor| cursor != merged && span.contains(&cursor)) {
            self.cursor = Some(merged);
        }

        trace!("released block at {offset}, free block now spans {span:?}");
        Ok(())
    }

    /// Blocks of the arena in address order. Empty before bootstrap.
    pub fn blocks(&self) -> Blocks<'_> {
        self.region.as_ref().map_or_else(Blocks::empty, Region::blocks)
    }

    /// Verifies the whole arena and returns usage totals.
    pub fn check(&self) -> Result<HeapStats> {
        match &self.region {
            Some(region) => region.check(),
            None => Ok(HeapStats::default()),
        }
    }

    /// Address range covered by the arena, if it is mapped.
    pub fn arena_bounds(&self) -> Option<Range<usize>> {
        self.region.as_ref().map(|region| {
            let start = region.start().as_ptr() as usize;
            start..start + region.capacity()
        })
    }

    /// Whether `ptr` points inside the arena.
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.arena_bounds()
            .is_some_and(|bounds| bounds.contains(&(ptr as usize)))
    }

    fn region(&self) -> Result<&Region> {
        self.region.as_ref().ok_or(Error::MapFailed { len: self.config.capacity })
    }

    fn region_mut(&mut self) -> Result<&mut Region> {
        self.region.as_mut().ok_or(Error::MapFailed { len: self.config.capacity })
    }
}

impl Default for Rmalloc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BLOCK_META_SIZE, MAX_BLOCK_SIZE, TAG_SIZE};

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn small(chunks: usize) -> Rmalloc {
        init_logger();
        Rmalloc::with_config(ArenaConfig::new().with_capacity(chunks * MAX_BLOCK_SIZE)).unwrap()
    }

    fn offset_of(allocator: &Rmalloc, ptr: *mut u8) -> usize {
        ptr as usize - allocator.arena_bounds().unwrap().start - TAG_SIZE
    }

    #[test]
    fn first_allocation_bootstraps() {
        let mut allocator = small(4);
        assert!(!allocator.is_bootstrapped());
        assert_eq!(allocator.blocks().count(), 0);

        let ptr = allocator.allocate(1);
        assert!(!ptr.is_null());
        assert!(allocator.is_bootstrapped());
        assert!(allocator.contains(ptr));
        assert_eq!(offset_of(&allocator, ptr), 0);
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let mut allocator = small(2);

        allocator.bootstrap().unwrap();
        let bounds = allocator.arena_bounds();
        let ptr = allocator.allocate(16);

        allocator.bootstrap().unwrap();
        assert_eq!(allocator.arena_bounds(), bounds);
        assert_eq!(allocator.blocks().next().map(|block| block.used), Some(true));
        assert!(allocator.contains(ptr));
    }

    #[test]
    fn allocated_memory_is_usable() {
        let mut allocator = small(1);

        unsafe {
            let block = allocator.allocate(4).cast::<u32>();
            *block = 23;
            assert_eq!(23, *block);

            let bytes = allocator.allocate(100);
            for i in 0..100 {
                *bytes.add(i) = i as u8;
            }
            assert_eq!(23, *block);
            for i in 0..100 {
                assert_eq!(*bytes.add(i), i as u8);
            }
        }
    }

    #[test]
    fn space_for_free_block_is_used() {
        let mut allocator = small(1);

        let first_block = allocator.allocate(4);
        allocator.release(first_block);

        let second_block = allocator.allocate(4);
        assert_eq!(first_block, second_block);
    }

    #[test]
    fn oversized_requests_return_null() {
        let mut allocator = small(1);

        assert!(allocator.allocate(MAX_BLOCK_SIZE).is_null());
        assert_eq!(
            allocator.try_allocate(usize::MAX),
            Err(Error::OutOfMemory { requested: usize::MAX })
        );
        assert!(!allocator.allocate(MAX_BLOCK_SIZE - BLOCK_META_SIZE).is_null());
    }

    #[test]
    fn exhaustion_returns_null() {
        let mut allocator = small(2);

        assert!(!allocator.allocate(4000).is_null());
        assert!(!allocator.allocate(4000).is_null());
        assert!(allocator.allocate(4000).is_null());
        assert!(allocator.allocate(1).is_null());
    }

    #[test]
    fn forward_scan_starts_at_the_cursor() {
        let mut allocator = small(1);

        let a = allocator.allocate(50);
        let b = allocator.allocate(50);
        let c = allocator.allocate(50);

        assert_eq!(offset_of(&allocator, a), 0);
        assert_eq!(offset_of(&allocator, b), 64);
        assert_eq!(offset_of(&allocator, c), 128);

        // `a` is free again but the search starts from `c` and finds room after it.
        allocator.release(a);
        let d = allocator.allocate(50);
        assert_eq!(offset_of(&allocator, d), 192);
    }

    #[test]
    fn backward_scan_reaches_the_arena_start() {
        let mut allocator = small(2);

        let a = allocator.allocate(4000);
        let b = allocator.allocate(4000);
        assert_eq!(offset_of(&allocator, b), MAX_BLOCK_SIZE);

        allocator.release(a);

        // Nothing fits from the cursor forward, only the block behind it.
        let c = allocator.allocate(4000);
        assert_eq!(c, a);
    }

    #[test]
    fn adjacent_releases_merge_in_either_order() {
        for reverse in [false, true] {
            let mut allocator = small(1);

            let a = allocator.allocate(50);
            let b = allocator.allocate(50);

            if reverse {
                allocator.release(b);
                allocator.release(a);
            } else {
                allocator.release(a);
                allocator.release(b);
            }

            let blocks: Vec<_> = allocator.blocks().collect();
            assert_eq!(blocks.len(), 1);
            assert_eq!(blocks[0].size, MAX_BLOCK_SIZE);
            assert!(!blocks[0].used);

            assert_eq!(allocator.allocate(90), a);
        }
    }

    #[test]
    fn cursor_follows_merged_blocks() {
        let mut allocator = small(1);

        let a = allocator.allocate(50);
        let b = allocator.allocate(50);
        let c = allocator.allocate(50);

        // Cursor sits on `c`. Free `a` and `b`, then `c` last so the cursor's
        // block is swallowed by the merge.
        allocator.release(a);
        allocator.release(b);
        allocator.release(c);

        allocator.check().unwrap();
        assert_eq!(allocator.allocate(50), a);
    }

    #[test]
    fn double_release_is_harmless() {
        let mut allocator = small(1);

        let a = allocator.allocate(50);
        let b = allocator.allocate(50);

        allocator.release(a);
        allocator.release(a);
        assert_eq!(allocator.try_release(a), Err(Error::DoubleFree { offset: 0 }));

        let stats = allocator.check().unwrap();
        assert_eq!(stats.used_blocks, 1);
        assert_eq!(stats.free_bytes + stats.used_bytes, MAX_BLOCK_SIZE);

        allocator.release(b);
        let stats = allocator.check().unwrap();
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.free_bytes, MAX_BLOCK_SIZE);
    }

    #[test]
    fn null_and_foreign_pointers_are_ignored() {
        let mut allocator = small(1);

        allocator.release(ptr::null_mut());
        assert_eq!(allocator.try_release(ptr::null_mut()), Ok(()));

        let mut local = 0u64;
        let foreign = (&mut local as *mut u64).cast::<u8>();

        // Before bootstrap there is nothing it could belong to.
        assert!(matches!(allocator.try_release(foreign), Err(Error::ForeignPointer { .. })));

        let a = allocator.allocate(8);
        allocator.release(foreign);
        assert!(matches!(allocator.try_release(foreign), Err(Error::ForeignPointer { .. })));

        let misaligned = unsafe { a.add(1) };
        assert!(matches!(allocator.try_release(misaligned), Err(Error::ForeignPointer { .. })));

        assert_eq!(allocator.check().unwrap().used_blocks, 1);
    }

    #[test]
    fn teardown_then_allocate_rebootstraps() {
        let mut allocator = small(1);

        allocator.teardown();
        assert!(!allocator.is_bootstrapped());

        let _ = allocator.allocate(4000);
        assert!(allocator.allocate(4000).is_null());

        allocator.teardown();
        allocator.teardown();
        assert!(!allocator.is_bootstrapped());
        assert!(allocator.arena_bounds().is_none());

        // A fresh arena has all its space back.
        let ptr = allocator.allocate(4000);
        assert!(!ptr.is_null());
        assert!(allocator.contains(ptr));
        assert_eq!(allocator.check().unwrap().used_blocks, 1);
    }

    #[test]
    fn instances_are_independent() {
        let mut first = small(1);
        let mut second = small(1);

        let a = first.allocate(4000);
        let b = second.allocate(4000);

        assert!(first.contains(a) && !first.contains(b));
        assert!(second.contains(b) && !second.contains(a));
        assert!(first.allocate(4000).is_null());
        assert!(second.allocate(4000).is_null());
    }

    #[test]
    fn check_before_bootstrap_reports_an_empty_heap() {
        let mut allocator = small(2);

        assert_eq!(allocator.check(), Ok(HeapStats::default()));
        assert!(!allocator.is_bootstrapped());

        allocator.bootstrap().unwrap();
        let stats = allocator.check().unwrap();
        assert_eq!(stats.free_bytes, 2 * MAX_BLOCK_SIZE);
        assert_eq!(stats.blocks, 2);
    }

    #[test]
    fn rejects_invalid_config() {
        let config = ArenaConfig::new().with_capacity(100);
        assert!(matches!(Rmalloc::with_config(config), Err(Error::InvalidConfig(_))));
    }
}
