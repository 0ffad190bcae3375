//! A binary-buddy pool allocator over a single owned arena.

use core::alloc::Layout;
use core::cmp;
use core::num::NonZeroUsize;
use core::ptr::{self, NonNull};

use alloc::boxed::Box;
use alloc::vec::Vec;

use log::trace;

use crate::{bitmap::Bitmap, tree, AllocError, FreeError, InitError};

/// The smallest supported minimum block size.
///
/// The free-list links live in a side table rather than in block memory, so
/// this floor is a fixed constant independent of pointer width; below it the
/// per-block bookkeeping outweighs the blocks themselves.
pub const MIN_BLOCK_SIZE: usize = 16;

/// A link in a per-level doubly-linked list of free blocks.
///
/// Links are stored in a side table indexed by tree node id; the arena itself
/// is never written by the allocator. Node ids are stored shifted up by one
/// so the `NonZeroUsize` niche keeps each link at two words.
#[derive(Copy, Clone, Debug, Default)]
struct FreeLink {
    prev: Option<NonZeroUsize>,
    next: Option<NonZeroUsize>,
}

/// Converts a node id to its stored link form.
#[inline]
fn link_to(node: usize) -> Option<NonZeroUsize> {
    // `node + 1` cannot wrap: the node count is strictly below `usize::MAX`.
    NonZeroUsize::new(node + 1)
}

/// Inverse of [`link_to`].
#[inline]
fn link_from(id: NonZeroUsize) -> usize {
    id.get() - 1
}

/// Allocates a boxed slice of `len` copies of `value`, reporting failure
/// instead of aborting the process.
fn try_boxed_slice<T: Clone>(value: T, len: usize) -> Result<Box<[T]>, InitError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| InitError::MetadataAllocFailed)?;
    v.resize(len, value);

    Ok(v.into_boxed_slice())
}

/// A binary-buddy pool allocator.
///
/// The pool owns one contiguous arena of `pool_size` bytes and serves blocks
/// whose sizes are power-of-two multiples of `min_block_size`. Each possible
/// block is a node of an implicit full binary tree: level 0 is the whole
/// arena and each level below it halves the block size. Allocation splits the
/// nearest larger free block down to the requested size class; deallocation
/// merges the freed block with its buddy as far up the tree as possible.
///
/// Both operations are synchronous and bounded by the number of levels.
/// The pool is a plain value with no global state; any number of pools may
/// coexist, and sharing one across threads requires external locking.
#[derive(Debug)]
pub struct BuddyPool {
    /// Total arena size in bytes; a power of two.
    pool_size: usize,
    /// Smallest allocatable block size in bytes; a power of two.
    min_block_size: usize,
    /// Number of size classes: `log2(pool_size / min_block_size) + 1`.
    level_count: usize,
    /// Head node id of each level's free list.
    free_heads: Box<[Option<usize>]>,
    /// Free-list linkage per tree node.
    links: Box<[FreeLink]>,
    /// One bit per tree node: set while the node is allocated or split.
    occupancy: Bitmap,
    /// Base of the arena, aligned to `min_block_size`.
    arena: NonNull<u8>,
}

impl BuddyPool {
    /// Constructs a new pool of `pool_size` bytes served in blocks of at
    /// least `min_block_size` bytes.
    ///
    /// Both parameters must be powers of two, `min_block_size` must be
    /// strictly smaller than `pool_size`, and `min_block_size` must be at
    /// least [`MIN_BLOCK_SIZE`].
    ///
    /// # Errors
    ///
    /// Returns a distinct [`InitError`] variant for each violated parameter
    /// constraint, [`InitError::MetadataAllocFailed`] if the bookkeeping
    /// side tables cannot be allocated, or [`InitError::ArenaAllocFailed`]
    /// if the backing arena cannot be. On any error, everything acquired so
    /// far has been released and no pool exists.
    pub fn try_new(pool_size: usize, min_block_size: usize) -> Result<BuddyPool, InitError> {
        if !pool_size.is_power_of_two() {
            return Err(InitError::PoolSizeNotPowerOfTwo);
        }

        if !min_block_size.is_power_of_two() {
            return Err(InitError::MinBlockSizeNotPowerOfTwo);
        }

        if min_block_size >= pool_size {
            return Err(InitError::MinBlockSizeTooLarge);
        }

        if min_block_size < MIN_BLOCK_SIZE {
            return Err(InitError::MinBlockSizeTooSmall);
        }

        let level_count = ((pool_size / min_block_size).ilog2() + 1) as usize;
        let node_count = (1usize << level_count) - 1;

        // Metadata is allocated fallibly and held in owned containers, so
        // any failure below releases everything acquired so far by dropping.
        let free_heads = try_boxed_slice(None, level_count)?;
        let links = try_boxed_slice(FreeLink::default(), node_count)?;
        let occupancy =
            Bitmap::try_new(node_count).map_err(|_| InitError::MetadataAllocFailed)?;
        let layout = Layout::from_size_align(pool_size, min_block_size)
            .map_err(|_| InitError::ArenaAllocFailed)?;

        // SAFETY: `layout` has nonzero size; `pool_size >= 2 * min_block_size`.
        let raw = unsafe { alloc::alloc::alloc(layout) };
        let arena = NonNull::new(raw).ok_or(InitError::ArenaAllocFailed)?;

        let mut pool = BuddyPool {
            pool_size,
            min_block_size,
            level_count,
            free_heads,
            links,
            occupancy,
            arena,
        };

        // The whole arena starts as a single free block at level 0.
        pool.free_list_push(0, 0);

        Ok(pool)
    }

    /// Returns the total arena size in bytes.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Returns the smallest allocatable block size in bytes.
    pub fn min_block_size(&self) -> usize {
        self.min_block_size
    }

    /// Returns the number of size classes.
    ///
    /// Level 0 holds the whole pool; level `level_count() - 1` holds blocks
    /// of `min_block_size()` bytes.
    pub fn level_count(&self) -> usize {
        self.level_count
    }

    /// Returns the total number of free bytes, summed over every level's
    /// free list at that level's block size.
    ///
    /// This walks the free lists and is intended for diagnostics, not hot
    /// paths. Note that the largest satisfiable request may be much smaller
    /// than this total when the pool is fragmented.
    pub fn free_bytes(&self) -> usize {
        (0..self.level_count)
            .map(|level| {
                let mut blocks = 0;
                let mut cur = self.free_heads[level];
                while let Some(node) = cur {
                    blocks += 1;
                    cur = self.links[node].next.map(link_from);
                }
                blocks * self.block_size(level)
            })
            .sum()
    }

    /// Returns the block size of `level` in bytes.
    #[inline]
    fn block_size(&self, level: usize) -> usize {
        self.min_block_size << (self.level_count - 1 - level)
    }

    /// Returns the smallest level whose block size holds `size` bytes, or
    /// `None` if `size` exceeds the pool size.
    ///
    /// Requests smaller than `min_block_size`, including zero, land on the
    /// deepest level.
    fn level_for_size(&self, size: usize) -> Option<usize> {
        if size > self.pool_size {
            return None;
        }

        let alloc_size = cmp::max(size.next_power_of_two(), self.min_block_size);

        Some((self.pool_size.ilog2() - alloc_size.ilog2()) as usize)
    }

    /// Returns the arena address of `node` at `level`.
    fn block_addr(&self, level: usize, node: usize) -> NonNull<u8> {
        let offset = tree::offset_in_level(level, node) * self.block_size(level);

        // SAFETY: `offset < pool_size`, so the sum stays within the arena
        // allocation and cannot wrap to null.
        unsafe { NonNull::new_unchecked(self.arena.as_ptr().add(offset)) }
    }

    /// Returns a pointer to `node`'s block, carrying the requested length.
    fn block_slice(&self, level: usize, node: usize, len: usize) -> NonNull<[u8]> {
        let raw = ptr::slice_from_raw_parts_mut(self.block_addr(level, node).as_ptr(), len);

        // SAFETY: the data pointer comes from `block_addr` and is non-null.
        unsafe { NonNull::new_unchecked(raw) }
    }

    /// Pushes `node` onto the head of `level`'s free list.
    fn free_list_push(&mut self, level: usize, node: usize) {
        let old_head = self.free_heads[level];

        if let Some(h) = old_head {
            self.links[h].prev = link_to(node);
        }

        self.links[node] = FreeLink {
            prev: None,
            next: old_head.and_then(link_to),
        };
        self.free_heads[level] = Some(node);
    }

    /// Pops the head of `level`'s free list.
    fn free_list_pop(&mut self, level: usize) -> Option<usize> {
        let head = self.free_heads[level]?;
        let next = self.links[head].next.map(link_from);

        if let Some(n) = next {
            self.links[n].prev = None;
        }

        self.free_heads[level] = next;
        self.links[head] = FreeLink::default();

        Some(head)
    }

    /// Removes `node`, which must be an element of `level`'s free list, from
    /// that list.
    fn free_list_remove(&mut self, level: usize, node: usize) {
        let FreeLink { prev, next } = self.links[node];

        match prev.map(link_from) {
            // Link `prev` forward to `next`.
            Some(p) => self.links[p].next = next,

            // If there's no previous block, then `node` is the head.
            None => self.free_heads[level] = next.map(link_from),
        }

        if let Some(n) = next.map(link_from) {
            // Link `next` back to `prev`.
            self.links[n].prev = prev;
        }

        self.links[node] = FreeLink::default();
    }

    /// Attempts to allocate a block of at least `size` bytes.
    ///
    /// The returned pointer is aligned to `min_block_size` and carries the
    /// requested length; the backing block is the smallest size class that
    /// holds `size`. The block's contents are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `size` exceeds the pool size, or if no free block of
    /// a sufficient size class exists. Smaller fragments may still be free
    /// elsewhere in the pool; fragmentation at the requested granularity is
    /// inherent to the buddy scheme. The pool is unchanged on error.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        let target_level = self.level_for_size(size).ok_or(AllocError)?;

        // If there is a free block of the correct size, return it immediately.
        if let Some(node) = self.free_list_pop(target_level) {
            self.occupancy.set(node, true);
            trace!("alloc: size {} level {} node {}", size, target_level, node);

            return Ok(self.block_slice(target_level, node, size));
        }

        // Otherwise, scan increasing block sizes until a free block is found.
        let (mut node, found_level) = (0..target_level)
            .rev()
            .find_map(|level| self.free_list_pop(level).map(|node| (node, level)))
            .ok_or(AllocError)?;

        // Split the block repeatedly to obtain a suitably sized block. Each
        // step keeps the lower half and frees the upper half one level down.
        for level in found_level..target_level {
            self.occupancy.set(node, true);
            self.free_list_push(level + 1, tree::right_child(node));
            node = tree::left_child(node);
        }

        self.occupancy.set(node, true);
        trace!(
            "alloc: size {} level {} node {} (split from level {})",
            size,
            target_level,
            node,
            found_level
        );

        Ok(self.block_slice(target_level, node, size))
    }

    /// Deallocates the block that starts at `ptr`, merging it with its buddy
    /// repeatedly while the buddy is also free.
    ///
    /// The block's size class is recovered from the occupancy bitmap, so no
    /// size or layout needs to be supplied.
    ///
    /// # Errors
    ///
    /// Returns `Err` without touching the pool if `ptr` was not returned by
    /// [`allocate`] on this pool, or if the block it denotes has already been
    /// freed.
    ///
    /// [`allocate`]: BuddyPool::allocate
    pub fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), FreeError> {
        let addr = ptr.as_ptr() as usize;
        let base = self.arena.as_ptr() as usize;

        let offset = addr.checked_sub(base).ok_or(FreeError::OutOfBounds)?;
        if offset >= self.pool_size {
            return Err(FreeError::OutOfBounds);
        }

        if offset % self.min_block_size != 0 {
            return Err(FreeError::Misaligned);
        }

        // Recover the allocated block: start at the deepest node covering
        // this offset and walk up while the occupancy bit is clear. Every
        // ancestor of an allocated block is marked split, so the first set
        // bit on the path is the block that was handed out.
        let deepest = self.level_count - 1;
        let mut node = tree::node_at(deepest, offset / self.min_block_size);
        let mut level = deepest;

        while !self.occupancy.get(node) {
            if level == 0 {
                return Err(FreeError::NotAllocated);
            }

            node = tree::parent(node);
            level -= 1;
        }

        // A set bit alone does not prove the node was handed out: split
        // ancestors are marked too. An allocated node never has a set child
        // bit, while a split node always has at least one (two free children
        // would have coalesced).
        if level < deepest
            && (self.occupancy.get(tree::left_child(node))
                || self.occupancy.get(tree::right_child(node)))
        {
            return Err(FreeError::NotAllocated);
        }

        // The recovered block must start exactly at `ptr`; an interior
        // pointer into a live block is a caller bug, not a free.
        if tree::offset_in_level(level, node) * self.block_size(level) != offset {
            return Err(FreeError::Misaligned);
        }

        trace!("free: level {} node {}", level, node);

        // Clear the block and coalesce upward while its buddy is also free.
        loop {
            self.occupancy.set(node, false);

            if level == 0 || self.occupancy.get(tree::buddy(node)) {
                self.free_list_push(level, node);
                break;
            }

            // The buddy is a whole free block; pull it out of its list and
            // let the parent represent the pair.
            self.free_list_remove(level, tree::buddy(node));
            node = tree::parent(node);
            level -= 1;
        }

        trace!("free: coalesced to level {} node {}", level, node);

        Ok(())
    }
}

impl Drop for BuddyPool {
    fn drop(&mut self) {
        // Validated by `try_new`, so reconstructing the layout cannot fail.
        let layout = Layout::from_size_align(self.pool_size, self.min_block_size).unwrap();

        // SAFETY: `arena` was allocated in `try_new` with this layout and is
        // released exactly once, here.
        unsafe { alloc::alloc::dealloc(self.arena.as_ptr(), layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AllocError, FreeError, InitError};

    const POOL: usize = 1 << 20;
    const MIN: usize = 1 << 10;

    fn pool() -> BuddyPool {
        BuddyPool::try_new(POOL, MIN).unwrap()
    }

    fn offset_of(pool: &BuddyPool, block: NonNull<[u8]>) -> usize {
        block.cast::<u8>().as_ptr() as usize - pool.arena.as_ptr() as usize
    }

    #[test]
    fn rejects_non_power_of_two_pool_size() {
        assert_eq!(
            BuddyPool::try_new(1000, 64).unwrap_err(),
            InitError::PoolSizeNotPowerOfTwo
        );
    }

    #[test]
    fn rejects_non_power_of_two_min_block_size() {
        assert_eq!(
            BuddyPool::try_new(1024, 48).unwrap_err(),
            InitError::MinBlockSizeNotPowerOfTwo
        );
    }

    #[test]
    fn rejects_min_block_size_not_below_pool_size() {
        assert_eq!(
            BuddyPool::try_new(1024, 1024).unwrap_err(),
            InitError::MinBlockSizeTooLarge
        );
        assert_eq!(
            BuddyPool::try_new(1024, 4096).unwrap_err(),
            InitError::MinBlockSizeTooLarge
        );
    }

    #[test]
    fn rejects_min_block_size_below_floor() {
        assert_eq!(
            BuddyPool::try_new(1024, 8).unwrap_err(),
            InitError::MinBlockSizeTooSmall
        );
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn metadata_failure_is_an_error_not_an_abort() {
        // 2^59 - 1 tree nodes of linkage cannot be reserved; the failure
        // must come back as an error with everything already released.
        assert_eq!(
            BuddyPool::try_new(1 << 62, 16).unwrap_err(),
            InitError::MetadataAllocFailed
        );
    }

    #[test]
    fn free_links_are_two_words() {
        assert_eq!(
            core::mem::size_of::<FreeLink>(),
            2 * core::mem::size_of::<usize>()
        );
    }

    #[test]
    fn validation_order_reports_pool_size_first() {
        // Both parameters are invalid; the pool size is checked first.
        assert_eq!(
            BuddyPool::try_new(1000, 48).unwrap_err(),
            InitError::PoolSizeNotPowerOfTwo
        );
    }

    #[test]
    fn level_count_matches_size_ratio() {
        let p = pool();
        assert_eq!(p.level_count(), 11);
        assert_eq!(p.pool_size(), POOL);
        assert_eq!(p.min_block_size(), MIN);
    }

    #[test]
    fn fresh_pool_is_entirely_free() {
        let p = pool();
        assert_eq!(p.free_bytes(), POOL);
        assert_eq!(p.free_heads[0], Some(0));
        assert!(p.free_heads[1..].iter().all(Option::is_none));
    }

    #[test]
    fn oversized_request_fails_without_mutation() {
        let mut p = pool();

        assert_eq!(p.allocate(POOL + 1), Err(AllocError));

        // The level-0 block is still intact.
        let whole = p.allocate(POOL).unwrap();
        assert_eq!(offset_of(&p, whole), 0);
    }

    #[test]
    fn request_of_3000_takes_a_4096_byte_block_from_a_full_split() {
        let mut p = pool();

        let block = p.allocate(3000).unwrap();

        // The split keeps the lower half at every level, so the block sits
        // at offset 0, at the 4096-byte size class.
        assert_eq!(offset_of(&p, block), 0);
        assert_eq!(p.free_bytes(), POOL - 4096);

        p.deallocate(block.cast()).unwrap();

        // The free propagates back up to a single level-0 block.
        assert_eq!(p.free_heads[0], Some(0));
        assert!(p.free_heads[1..].iter().all(Option::is_none));
        assert_eq!(p.free_bytes(), POOL);
    }

    #[test]
    fn buddies_coalesce_only_when_both_are_free() {
        let mut p = pool();

        // Two 2048-byte blocks: buddies at level 9, offsets 0 and 2048.
        let a = p.allocate(2048).unwrap();
        let b = p.allocate(2048).unwrap();
        assert_eq!(offset_of(&p, a), 0);
        assert_eq!(offset_of(&p, b), 2048);

        // Freeing `b` alone leaves it on the level-9 list; its buddy is
        // still allocated, so nothing merges.
        p.deallocate(b.cast()).unwrap();
        assert_eq!(p.free_heads[9], Some(tree::node_at(9, 1)));

        // Freeing `a` merges the pair and cascades all the way to level 0.
        p.deallocate(a.cast()).unwrap();
        assert_eq!(p.free_heads[0], Some(0));
        assert!(p.free_heads[1..].iter().all(Option::is_none));
    }

    #[test]
    fn blocks_are_aligned_to_min_block_size() {
        let mut p = pool();

        for size in [0, 1, 17, 1000, 3000, 5000, 100_000] {
            let block = p.allocate(size).unwrap();
            assert_eq!(block.cast::<u8>().as_ptr() as usize % MIN, 0);
        }
    }

    #[test]
    fn undersized_requests_round_up_to_a_min_block() {
        let mut p = pool();

        let a = p.allocate(1).unwrap();
        assert_eq!(p.free_bytes(), POOL - MIN);

        // Zero-sized requests behave like any other undersized request.
        let b = p.allocate(0).unwrap();
        assert_eq!(p.free_bytes(), POOL - 2 * MIN);

        p.deallocate(a.cast()).unwrap();
        p.deallocate(b.cast()).unwrap();
        assert_eq!(p.free_bytes(), POOL);
    }

    #[test]
    fn exhausted_pool_fails_until_a_block_is_freed() {
        let mut p = pool();

        let whole = p.allocate(POOL).unwrap();
        assert_eq!(p.allocate(1), Err(AllocError));

        p.deallocate(whole.cast()).unwrap();
        assert!(p.allocate(1).is_ok());
    }

    #[test]
    fn outstanding_blocks_do_not_overlap() {
        let mut p = pool();

        let blocks: alloc::vec::Vec<_> = (0..8).map(|_| p.allocate(3000).unwrap()).collect();

        for (i, a) in blocks.iter().enumerate() {
            for b in &blocks[i + 1..] {
                let (a, b) = (offset_of(&p, *a), offset_of(&p, *b));
                assert!(a.abs_diff(b) >= 4096);
            }
        }
    }

    #[test]
    fn double_free_is_rejected() {
        let mut p = pool();

        let block = p.allocate(2048).unwrap();
        // Keep the buddy allocated so the freed block stays at level 9.
        let _held = p.allocate(2048).unwrap();

        p.deallocate(block.cast()).unwrap();
        assert_eq!(p.deallocate(block.cast()), Err(FreeError::NotAllocated));
    }

    #[test]
    fn freeing_into_a_fully_free_pool_is_rejected() {
        let mut p = pool();
        let base = p.arena;

        assert_eq!(p.deallocate(base), Err(FreeError::NotAllocated));
    }

    #[test]
    fn foreign_pointer_is_rejected() {
        let mut p = pool();

        let before = NonNull::new(p.arena.as_ptr().wrapping_sub(MIN)).unwrap();
        assert_eq!(p.deallocate(before), Err(FreeError::OutOfBounds));

        let after = NonNull::new(p.arena.as_ptr().wrapping_add(POOL)).unwrap();
        assert_eq!(p.deallocate(after), Err(FreeError::OutOfBounds));
    }

    #[test]
    fn interior_pointer_is_rejected() {
        let mut p = pool();

        let block = p.allocate(4096).unwrap();
        let inside = NonNull::new(block.cast::<u8>().as_ptr().wrapping_add(1024)).unwrap();

        assert_eq!(p.deallocate(inside), Err(FreeError::Misaligned));

        let unaligned = NonNull::new(block.cast::<u8>().as_ptr().wrapping_add(1)).unwrap();
        assert_eq!(p.deallocate(unaligned), Err(FreeError::Misaligned));

        // The block is still live and freeable at its true start.
        p.deallocate(block.cast()).unwrap();
    }

    #[test]
    fn exhaustion_at_one_granularity_leaves_fragments_elsewhere() {
        let mut p = BuddyPool::try_new(4096, 1024).unwrap();

        // Hold one half; the other half is split into 1024-byte fragments
        // of which one stays allocated.
        let _half = p.allocate(2048).unwrap();
        let small = p.allocate(1024).unwrap();
        let _held = p.allocate(1024).unwrap();
        p.deallocate(small.cast()).unwrap();

        // 1024 bytes are free, but no 2048-byte block exists.
        assert_eq!(p.free_bytes(), 1024);
        assert_eq!(p.allocate(2048), Err(AllocError));
        assert!(p.allocate(1024).is_ok());
    }
}
