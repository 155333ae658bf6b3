//! The multi-checkpoint restore engine.
//!
//! A restart opens the target diff and resolves every chunk through the
//! chain of prior diffs, newest to oldest, until a byte-carrying diff is
//! found. Each provided diff identifies its snapshot by header, so the
//! caller may pass any superset of the chain in any order; a snapshot id
//! the chain needs but the caller did not provide is a corrupt chain.
//!
//! The per-mode walks (tree, list, basic) share the same skeleton: build
//! the diff's lookup tables once, then resolve all outstanding chunks in
//! one parallel pass. Every pass strictly lowers the snapshot id a chunk
//! is waiting on, so one visit per diff suffices.

use std::collections::BTreeMap;
use std::time::Instant;

use log::debug;

use crate::{
    chunks::ChunkGrid,
    error::{Error, Result},
    header::{self, DiffHeader},
};

mod basic;
mod full;
mod list;
mod tree;

pub(crate) use basic::restart_basic;
pub(crate) use full::restart_full;
pub(crate) use list::restart_list;
pub(crate) use tree::restart_tree;

/// Resolution state of one output chunk during a chain walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    /// Waiting on node `node` of snapshot `tree`.
    Pending { node: u32, tree: u32 },
    /// Bytes copied.
    Filled,
}

/// One diff cut into its table sections. All bounds are validated
/// against the buffer length up front.
pub(crate) struct DiffSections<'a> {
    pub header: DiffHeader,
    pub distinct: &'a [u8],
    pub prior: &'a [u8],
    pub repeats: &'a [u8],
    pub payload: &'a [u8],
}

pub(crate) fn parse_sections(buf: &[u8]) -> Result<DiffSections<'_>> {
    let header = DiffHeader::decode(buf)?;
    let payload_offset = header.payload_offset();
    if buf.len() < payload_offset {
        return Err(Error::Format(format!(
            "diff of {} bytes is shorter than its {} bytes of tables",
            buf.len(),
            payload_offset
        )));
    }
    Ok(DiffSections {
        header,
        distinct: &buf[header.distinct_offset()..header.prior_offset()],
        prior: &buf[header.prior_offset()..header.repeats_offset()],
        repeats: &buf[header.repeats_offset()..payload_offset],
        payload: &buf[payload_offset..],
    })
}

impl DiffSections<'_> {
    /// The `index`-th distinct-table node.
    pub fn distinct_node(&self, index: usize) -> u32 {
        header::table_u32(self.distinct, index)
    }

    /// The `index`-th repeat pair `(node, prev_node)`.
    pub fn repeat_pair(&self, index: usize) -> (u32, u32) {
        (
            header::table_u32(self.repeats, 2 * index),
            header::table_u32(self.repeats, 2 * index + 1),
        )
    }

    /// The prior-checkpoint index expanded to `(source id, entry range)`
    /// per group. Group sizes must cover the repeat table exactly.
    pub fn repeat_groups(&self) -> Result<Vec<(u32, std::ops::Range<usize>)>> {
        let mut groups = Vec::with_capacity(self.header.num_prior_chkpts as usize);
        let mut start = 0usize;
        for g in 0..self.header.num_prior_chkpts as usize {
            let source = header::table_u32(self.prior, 2 * g);
            let count = header::table_u32(self.prior, 2 * g + 1) as usize;
            if source > self.header.chkpt_id {
                return Err(Error::Format(format!(
                    "repeat group references snapshot {} from snapshot {}",
                    source, self.header.chkpt_id
                )));
            }
            groups.push((source, start..start + count));
            start += count;
        }
        if start != self.header.num_repeats() as usize {
            return Err(Error::Format(format!(
                "prior-checkpoint index covers {} entries, repeat table has {}",
                start,
                self.header.num_repeats()
            )));
        }
        Ok(groups)
    }
}

/// Index the provided diffs by the snapshot id in their headers.
pub(crate) fn index_diffs(diffs: &[Vec<u8>]) -> Result<BTreeMap<u32, &[u8]>> {
    let mut by_id = BTreeMap::new();
    for diff in diffs {
        let header = DiffHeader::decode(diff)?;
        if by_id.insert(header.chkpt_id, diff.as_slice()).is_some() {
            return Err(Error::Format(format!(
                "snapshot {} provided twice",
                header.chkpt_id
            )));
        }
    }
    Ok(by_id)
}

/// Locate the target diff and verify its whole ancestor chain is present
/// and consistent, before any output is written.
pub(crate) fn validate_chain<'a>(
    by_id: &BTreeMap<u32, &'a [u8]>,
    target_id: u32,
) -> Result<(DiffHeader, ChunkGrid)> {
    let target = by_id
        .get(&target_id)
        .ok_or_else(|| Error::Config(format!("target snapshot {target_id} not provided")))?;
    let target_header = DiffHeader::decode(target)?;
    let grid = ChunkGrid::new(
        target_header.datalen,
        // An empty region carries no grid; any nonzero stand-in works.
        if target_header.datalen == 0 { target_header.chunk_size.max(1) } else { target_header.chunk_size },
    )?;
    for id in target_header.ref_id..=target_id {
        let diff = by_id.get(&id).ok_or_else(|| {
            Error::CorruptChain(format!(
                "chain of snapshot {target_id} needs snapshot {id}, which was not provided"
            ))
        })?;
        let header = DiffHeader::decode(diff)?;
        if header.datalen != target_header.datalen
            || (header.datalen > 0 && header.chunk_size != target_header.chunk_size)
        {
            return Err(Error::Format(format!(
                "snapshot {} disagrees with the target about the chunk grid",
                id
            )));
        }
        if header.ref_id != target_header.ref_id && id != target_header.ref_id {
            return Err(Error::CorruptChain(format!(
                "snapshot {} references baseline {}, target references {}",
                id, header.ref_id, target_header.ref_id
            )));
        }
    }
    Ok((target_header, grid))
}

/// Shared walk driver: validate the chain, then hand every diff from the
/// target back to the baseline to `process`, newest first.
pub(crate) fn walk_chain<F>(diffs: &[Vec<u8>], target_id: u32, mut process: F) -> Result<Vec<u8>>
where
    F: FnMut(u32, &DiffSections<'_>, &ChunkGrid, &mut [u8], bool) -> Result<()>,
{
    let started = Instant::now();
    let by_id = index_diffs(diffs)?;
    let (target_header, grid) = validate_chain(&by_id, target_id)?;
    let mut out = vec![0u8; target_header.datalen as usize];
    if target_header.datalen == 0 {
        return Ok(out);
    }
    for id in (target_header.ref_id..=target_id).rev() {
        let diff = by_id
            .get(&id)
            .expect("chain membership was validated");
        let sections = parse_sections(diff)?;
        process(id, &sections, &grid, &mut out, id == target_header.ref_id)?;
    }
    debug!(
        "restart of snapshot {} walked {} diffs in {:?}",
        target_id,
        target_id - target_header.ref_id + 1,
        started.elapsed()
    );
    Ok(out)
}
