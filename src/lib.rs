//! # rmalloc
//!
//! A user-space allocator that manages one fixed-size arena mapped from the
//! operating system. Blocks carry their size and state in boundary tags at
//! both ends, so neighbours are found by arithmetic instead of a free list:
//!
//! ```text
//! +------+---------------+------+------+----------+------+------+---------
//! | head |    payload    | tail | head | payload  | tail | head |   ...
//! +------+---------------+------+------+----------+------+------+---------
//!  \__________ used block _________/ \_____ free block _____/
//! ```
//!
//! Requests are rounded up to a power of two (tags included), served from the
//! first free block found by a next-fit scan, and the unused remainder is split
//! off. Releasing a block merges it with any free neighbour.
//!
//! ```rust
//! use rmalloc::Rmalloc;
//!
//! let mut allocator = Rmalloc::new();
//!
//! let ptr = allocator.allocate(50);
//! assert!(!ptr.is_null());
//!
//! unsafe { ptr.write_bytes(0xAB, 50) };
//!
//! allocator.release(ptr);
//! allocator.teardown();
//! ```

mod allocator;
mod block;
mod config;
mod error;
mod kernel;
mod region;
mod utils;

pub use allocator::Rmalloc;
pub use block::{BLOCK_META_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
pub use config::{ArenaConfig, DEFAULT_ARENA_SIZE};
pub use error::{Error, Result};
pub use region::{BlockInfo, Blocks, HeapStats};
