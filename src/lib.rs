//! A binary-buddy pool allocator.
//!
//! A [`BuddyPool`] manages one contiguous, pre-reserved arena and serves
//! power-of-two-sized blocks out of it, splitting larger blocks on demand and
//! coalescing freed buddies back together. Allocation and deallocation are
//! both bounded by the number of size classes, i.e. O(log(pool size)).
//!
//! All bookkeeping (per-level free lists and the occupancy bitmap) lives in a
//! side table indexed by tree node id, so the allocator never reads or writes
//! the arena itself. Block contents are untouched from the moment a block is
//! handed out until long after it is freed.
//!
//! ```
//! use balloc::BuddyPool;
//!
//! let mut pool = BuddyPool::try_new(1 << 20, 1 << 10).unwrap();
//!
//! let block = pool.allocate(3000).unwrap();
//! pool.deallocate(block.cast()).unwrap();
//! ```
//!
//! The pool is not internally synchronized; wrap it in a lock to share it
//! across threads.

#![no_std]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![doc(html_root_url = "https://docs.rs/balloc/0.1.0")]

extern crate alloc;

#[cfg(test)]
extern crate std;

mod bitmap;
pub mod buddy;
mod tree;


pub use crate::buddy::{BuddyPool, MIN_BLOCK_SIZE};

/// The error type for pool constructors.
///
/// The configuration variants map one-to-one onto the parameter constraints
/// of [`BuddyPool::try_new`], so callers can tell which parameter to fix.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InitError {
    /// `pool_size` is not a power of two.
    PoolSizeNotPowerOfTwo,

    /// `min_block_size` is not a power of two.
    MinBlockSizeNotPowerOfTwo,

    /// `min_block_size` is not strictly smaller than `pool_size`.
    MinBlockSizeTooLarge,

    /// `min_block_size` is smaller than [`MIN_BLOCK_SIZE`].
    MinBlockSizeTooSmall,

    /// The bookkeeping side tables could not be allocated.
    ///
    /// Anything acquired before the failure has already been released when
    /// this variant is returned.
    MetadataAllocFailed,

    /// The backing arena could not be allocated.
    ///
    /// The metadata acquired before the failure has already been released
    /// when this variant is returned.
    ArenaAllocFailed,
}

/// Indicates an allocation failure due to pool exhaustion or a request larger
/// than the pool itself.
///
/// The pool's state is unchanged when this is returned; the caller may retry
/// after freeing other blocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AllocError;

/// The error type for deallocation.
///
/// A pointer that does not denote a live block is reported rather than
/// corrupting the pool; the pool's state is unchanged when any of these is
/// returned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FreeError {
    /// The pointer does not fall within the pool's arena.
    OutOfBounds,

    /// The pointer falls within the arena but not on the boundary of the
    /// block that contains it.
    Misaligned,

    /// The pointer denotes memory that is already free.
    ///
    /// This is what a double free reports.
    NotAllocated,
}
