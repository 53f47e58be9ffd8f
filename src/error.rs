//! Error type shared by every fallible operation of the allocator.
//!
//! Only [`crate::Rmalloc::try_allocate`] and [`crate::Rmalloc::try_release`] hand
//! these out. The plain [`crate::Rmalloc::allocate`] / [`crate::Rmalloc::release`]
//! pair collapses them into a null pointer or a silent no-op.

use thiserror::Error;

/// Things that can go wrong while managing the arena.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Block parameters violate the size limits or fall outside the arena.
    #[error("block at offset {offset} with size {size} is out of range")]
    Range { offset: usize, size: usize },

    /// No free block is large enough for the request.
    #[error("out of memory: no free block can hold {requested} bytes")]
    OutOfMemory { requested: usize },

    /// The operating system refused to map the arena.
    #[error("failed to map {len} bytes from the operating system")]
    MapFailed { len: usize },

    /// The arena configuration is unusable.
    #[error("invalid arena configuration: {0}")]
    InvalidConfig(&'static str),

    /// The pointer was not handed out by this arena.
    #[error("pointer {addr:#x} does not belong to this arena")]
    ForeignPointer { addr: usize },

    /// The block owning the pointer is already free.
    #[error("block at offset {offset} is already free")]
    DoubleFree { offset: usize },

    /// The in-place block metadata is inconsistent.
    #[error("heap corrupted at offset {offset}: {reason}")]
    Corrupted { offset: usize, reason: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;
