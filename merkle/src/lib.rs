//! Merkle digest arrays for chunked byte regions.
//!
//! A region of `C` chunks is summarized by a contiguous array of `2C - 1`
//! SHA-1 digests laid out level-order (BFS): root at index 0, children of
//! node `i` at `2i + 1` and `2i + 2`, leaves occupying `[C - 1, 2C - 2]`.
//! Chunks map to leaves in tree order, so every subtree covers a
//! contiguous chunk span; for a power-of-two `C` the leaf for chunk `c`
//! is simply index `C - 1 + c`. Internal digests hash the concatenation
//! of their two child digests.
//!
//! No intermediate state is kept between builds: the array is a pure
//! function of `(data, chunk_size)`, and each level is filled as one
//! parallel range over disjoint slots.

mod digest;
/// Position arithmetic over the `2C - 1` node array.
pub mod helper;
mod node_id;
mod tree;

pub use digest::{DIGEST_BYTES, Digest};
pub use helper::{
    chunk_of_leaf, first_chunk, last_chunk, leaf_of_chunk, leftmost_leaf, num_leaf_descendants,
    num_leaves, rightmost_leaf, subtree_height,
};
pub use node_id::NodeId;
pub use tree::MerkleTree;
