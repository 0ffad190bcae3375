//! Index arithmetic for the implicit binary tree over the pool.
//!
//! Blocks are the nodes of a full binary tree in standard binary-heap
//! numbering: the root (the whole pool) is node 0, and level `l` spans nodes
//! `2^l - 1 ..= 2^(l+1) - 2`. Splitting a node yields its two children;
//! coalescing two buddies yields their parent.

/// Returns the id of the first node at `level`.
#[inline]
pub(crate) fn first_at_level(level: usize) -> usize {
    (1 << level) - 1
}

/// Returns the id of the node at position `index` within `level`.
#[inline]
pub(crate) fn node_at(level: usize, index: usize) -> usize {
    first_at_level(level) + index
}

/// Returns the position of `node` within `level`.
///
/// `node` must belong to `level`.
#[inline]
pub(crate) fn offset_in_level(level: usize, node: usize) -> usize {
    node - first_at_level(level)
}

/// Returns the id of the parent of `node`.
///
/// `node` must not be the root.
#[inline]
pub(crate) fn parent(node: usize) -> usize {
    (node - 1) / 2
}

/// Returns the id of the buddy of `node`, i.e. its parent's other child.
///
/// `node` must not be the root.
#[inline]
pub(crate) fn buddy(node: usize) -> usize {
    ((node - 1) ^ 1) + 1
}

/// Returns the id of the left child of `node`, the lower-addressed half.
#[inline]
pub(crate) fn left_child(node: usize) -> usize {
    2 * node + 1
}

/// Returns the id of the right child of `node`, the upper-addressed half.
#[inline]
pub(crate) fn right_child(node: usize) -> usize {
    2 * node + 2
}
