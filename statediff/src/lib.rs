//! Incremental checkpoint deduplication with bit-exact restore.
//!
//! Given a sequence of snapshots of one fixed-length byte region, a
//! [`Deduplicator`] emits one diff per snapshot such that the first diff
//! reconstructs the first snapshot alone and any prefix of diffs
//! reconstructs its last snapshot exactly. Diffs shrink by exploiting
//! both temporal redundancy (chunks unchanged across snapshots) and
//! spatial redundancy (chunks that reappear at other offsets, in this or
//! any earlier snapshot).
//!
//! Four strategies share the split → fingerprint → classify → emit
//! pipeline:
//!
//! - [`FullDeduplicator`] — no deduplication, the boundary case;
//! - [`BasicDeduplicator`] — per-offset digest compare against the
//!   previous snapshot;
//! - [`ListDeduplicator`] — a flat first-seen digest map, leaf-granular
//!   metadata;
//! - [`TreeDeduplicator`] — the Merkle-forest deduplicator: metadata is
//!   compacted to the maximal roots of single-class subtrees.
//!
//! Restores walk the diff chain newest to oldest, resolving every chunk
//! through (node, snapshot) references until a byte-carrying diff is
//! found; see the `restart` methods on [`Deduplicator`].
//!
//! ```
//! use statediff::{Deduplicator, TreeDeduplicator};
//!
//! let mut dedup = TreeDeduplicator::new(4)?;
//! let (d0, _) = dedup.checkpoint(b"AAAABBBB", true)?;
//! let (d1, _) = dedup.checkpoint(b"AAAACCCC", false)?;
//! assert_eq!(dedup.restart(&[d0, d1], 1)?, b"AAAACCCC");
//! # Ok::<(), statediff::Error>(())
//! ```

mod chunks;
mod dedup;
mod error;
mod header;
mod restore;

pub use chunks::ChunkGrid;
pub use dedup::{
    BasicDeduplicator, CheckpointStats, DedupMode, Deduplicator, FullDeduplicator,
    ListDeduplicator, TreeDeduplicator, TreePolicy, deduplicator_for,
};
pub use error::{Error, Result};
pub use header::{DiffHeader, GLOBAL_WINDOW, HEADER_BYTES};
