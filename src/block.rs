use std::mem;

/// Smallest block the arena will ever carve, metadata included.
pub const MIN_BLOCK_SIZE: usize = 32;

/// Largest block the arena will ever carve. Bootstrap splits the whole arena
/// into chunks of exactly this size.
pub const MAX_BLOCK_SIZE: usize = 4096;

/// Size of a single boundary tag in bytes.
pub const TAG_SIZE: usize = mem::size_of::<u32>();

/// Metadata overhead of every block: one tag at the head, one at the tail.
pub const BLOCK_META_SIZE: usize = 2 * TAG_SIZE;

const USED_BIT: u32 = 0b001;
const BOUNDARY_BIT: u32 = 0b010;
const SIZE_SHIFT: u32 = 3;

/// Decoded boundary tag. Every block carries two identical copies of this,
/// one in its first word and one in its last word:
///
/// ```text
/// +---------------------+ <------ block start
/// |  head tag (u32)     |
/// +---------------------+ <------ payload handed to the user
/// |                     |
/// |       Payload       |
/// |         ...         |
/// |                     |
/// +---------------------+
/// |  tail tag (u32)     |
/// +---------------------+ <------ block start + size
/// ```
///
/// Because both ends know the size, we can hop to the next block by reading
/// the head and to the previous one by reading the word right before our own
/// head. No free list is needed.
///
/// The packed word looks like this:
///
/// ```text
///  31                               3   2   1   0
/// +----------------------------------+---+---+---+
/// |               size               | - | B | U |
/// +----------------------------------+---+---+---+
/// ```
///
/// `U` is the used flag and `B` the boundary flag. Block sizes are always a
/// multiple of eight so shifting them by three loses nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    /// Size of the whole block, tags included.
    pub size: usize,
    /// The block is currently handed out.
    pub used: bool,
    /// The block heads a chunk carved at bootstrap.
    pub boundary: bool,
}

impl Tag {
    #[inline]
    pub const fn free(size: usize, boundary: bool) -> Self {
        Self { size, used: false, boundary }
    }

    /// Packs the tag into the word stored in the arena.
    #[inline]
    pub fn encode(self) -> u32 {
        let mut word = (self.size as u32) << SIZE_SHIFT;

        if self.used {
            word |= USED_BIT;
        }
        if self.boundary {
            word |= BOUNDARY_BIT;
        }

        word
    }

    /// Unpacks a word read from the arena. Exact inverse of [`Tag::encode`].
    #[inline]
    pub fn decode(word: u32) -> Self {
        Self {
            size: (word >> SIZE_SHIFT) as usize,
            used: word & USED_BIT != 0,
            boundary: word & BOUNDARY_BIT != 0,
        }
    }

    /// Whether `size` may be stored in a tag at all.
    #[inline]
    pub fn size_in_range(size: usize) -> bool {
        (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size)
    }
}
