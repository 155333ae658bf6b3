//! The four checkpoint strategies behind one trait.
//!
//! Every strategy shares the same pipeline — split the region into
//! chunks, fingerprint them, classify each chunk against what has been
//! seen before, emit a diff — and differs only in what "seen before"
//! means:
//!
//! - **Full**: nothing is; every diff carries the whole region.
//! - **Basic**: a chunk at the same offset in the previous snapshot.
//! - **List**: any chunk seen at any offset in any snapshot, tracked in a
//!   flat digest map.
//! - **Tree**: like list, but metadata is compacted to the maximal roots
//!   of a Merkle forest.

use std::{fs, io::Write, path::Path, str::FromStr};

use crate::error::{Error, Result};

mod basic;
mod full;
mod list;
mod tree;

pub use basic::BasicDeduplicator;
pub use full::FullDeduplicator;
pub use list::ListDeduplicator;
pub use tree::{TreeDeduplicator, TreePolicy};

/// Which checkpoint strategy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupMode {
    Full,
    Basic,
    List,
    Tree,
}

impl FromStr for DedupMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(DedupMode::Full),
            "basic" => Ok(DedupMode::Basic),
            "list" => Ok(DedupMode::List),
            "tree" => Ok(DedupMode::Tree),
            other => Err(Error::Config(format!("unknown dedup mode {other:?}"))),
        }
    }
}

impl std::fmt::Display for DedupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            DedupMode::Full => "full",
            DedupMode::Basic => "basic",
            DedupMode::List => "list",
            DedupMode::Tree => "tree",
        })
    }
}

/// Composition of one emitted diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckpointStats {
    /// Bytes of chunk payload.
    pub data_bytes: u64,
    /// Bytes of header and tables.
    pub metadata_bytes: u64,
    /// Entries in the distinct table.
    pub distinct_entries: u32,
    /// Entries in the repeat tables.
    pub repeat_entries: u32,
}

impl CheckpointStats {
    pub fn diff_bytes(&self) -> u64 {
        self.data_bytes + self.metadata_bytes
    }
}

/// One checkpoint strategy instance, holding whatever cross-snapshot
/// state its classification needs.
///
/// `checkpoint` calls must not run concurrently on one instance; restarts
/// are read-only with respect to that state and may.
pub trait Deduplicator {
    /// The strategy this instance runs.
    fn mode(&self) -> DedupMode;

    /// Chunk size every snapshot of this instance is split by.
    fn chunk_size(&self) -> u32;

    /// Deduplicate one snapshot and stage its diff.
    ///
    /// `make_baseline` forces a self-sufficient diff (`ref_id ==
    /// chkpt_id`) and drops the cross-snapshot state first. The staged
    /// buffer is complete on return; nothing is retained from it on
    /// error.
    fn checkpoint(&mut self, data: &[u8], make_baseline: bool)
    -> Result<(Vec<u8>, CheckpointStats)>;

    /// Deduplicate one snapshot and commit its diff to `path`.
    ///
    /// The diff is staged in memory and moved into place atomically, so a
    /// failed call never leaves a partial file behind.
    fn checkpoint_to_file(
        &mut self,
        data: &[u8],
        path: &Path,
        make_baseline: bool,
    ) -> Result<CheckpointStats> {
        let (diff, stats) = self.checkpoint(data, make_baseline)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut staged = tempfile::NamedTempFile::new_in(dir)?;
        staged.write_all(&diff)?;
        staged
            .persist(path)
            .map_err(|err| Error::Io(err.error))?;
        Ok(stats)
    }

    /// Reconstruct snapshot `target_id` from `diffs`.
    ///
    /// Each diff identifies its snapshot by its header, so order does
    /// not matter; the set must contain the target and its whole chain
    /// back to the baseline. A needed snapshot that is missing is a
    /// corrupt chain.
    fn restart(&self, diffs: &[Vec<u8>], target_id: u32) -> Result<Vec<u8>>;

    /// Reconstruct snapshot `target_id` from diff files; the file-borne
    /// counterpart of [`Deduplicator::restart`].
    fn restart_from_files(&self, paths: &[std::path::PathBuf], target_id: u32) -> Result<Vec<u8>> {
        let diffs = paths
            .iter()
            .map(|path| fs::read(path).map_err(Error::from))
            .collect::<Result<Vec<_>>>()?;
        self.restart(&diffs, target_id)
    }
}

/// Build the deduplicator for `mode`. Tree mode uses the default
/// low-offset root selection; construct [`TreeDeduplicator`] directly for
/// the low-root variant.
pub fn deduplicator_for(mode: DedupMode, chunk_size: u32) -> Result<Box<dyn Deduplicator>> {
    Ok(match mode {
        DedupMode::Full => Box::new(FullDeduplicator::new(chunk_size)?),
        DedupMode::Basic => Box::new(BasicDeduplicator::new(chunk_size)?),
        DedupMode::List => Box::new(ListDeduplicator::new(chunk_size)?),
        DedupMode::Tree => Box::new(TreeDeduplicator::new(chunk_size)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse_roundtrip() {
        for mode in [
            DedupMode::Full,
            DedupMode::Basic,
            DedupMode::List,
            DedupMode::Tree,
        ] {
            assert_eq!(mode.to_string().parse::<DedupMode>().expect("parse"), mode);
        }
        assert!("treeish".parse::<DedupMode>().is_err());
    }
}
