use std::collections::BTreeMap;

use log::debug;
use rayon::prelude::*;
use statediff_merkle::{Digest, NodeId};
use statediff_primitives::DigestMap;

use crate::{
    chunks::ChunkGrid,
    dedup::{CheckpointStats, DedupMode, Deduplicator},
    error::{Error, Result},
    header::{self, DiffHeader, GLOBAL_WINDOW, HEADER_BYTES},
    restore,
};

/// How one chunk of the new snapshot resolved against the first-seen map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkClass {
    /// Unchanged at this offset since the previous snapshot; implicit.
    Identical,
    /// First occurrence of this digest anywhere; bytes go in the payload.
    Distinct,
    /// Duplicate of a chunk first seen by snapshot `tree` at `chunk`.
    Repeat { chunk: u32, tree: u32 },
}

/// Flat-map deduplication: one digest → (first chunk, first snapshot)
/// entry per distinct digest, compared against every chunk ever seen
/// rather than just the same offset. Metadata stays at leaf granularity;
/// the tree deduplicator is the compacted refinement of this.
pub struct ListDeduplicator {
    chunk_size: u32,
    current_id: u32,
    baseline_id: u32,
    first_seen: Option<DigestMap>,
    /// Digest per chunk offset from the previous snapshot, for the
    /// implicit identical class.
    prev_list: Option<Vec<Digest>>,
}

impl ListDeduplicator {
    pub fn new(chunk_size: u32) -> Result<Self> {
        ChunkGrid::new(0, chunk_size)?;
        Ok(ListDeduplicator {
            chunk_size,
            current_id: 0,
            baseline_id: 0,
            first_seen: None,
            prev_list: None,
        })
    }

    /// Make sure the first-seen map has room for one snapshot's worth of
    /// new digests, re-keying into a larger map when it does not.
    fn ensure_map_capacity(&mut self, num_chunks: u32) {
        let needed = num_chunks as usize;
        let grow = match &self.first_seen {
            None => Some(needed),
            Some(map) if map.len() + needed > map.capacity() => {
                Some((map.len() + needed) * 2)
            }
            Some(_) => None,
        };
        if let Some(capacity) = grow {
            let fresh = DigestMap::with_capacity(capacity);
            if let Some(old) = &self.first_seen {
                for (digest, id) in old.entries() {
                    // Re-keying cannot fail: the new table is larger.
                    let _ = fresh.insert(&digest, id);
                }
            }
            self.first_seen = Some(fresh);
        }
    }
}

impl Deduplicator for ListDeduplicator {
    fn mode(&self) -> DedupMode {
        DedupMode::List
    }

    fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    fn checkpoint(
        &mut self,
        data: &[u8],
        make_baseline: bool,
    ) -> Result<(Vec<u8>, CheckpointStats)> {
        let grid = ChunkGrid::new(data.len() as u64, self.chunk_size)?;
        let num_chunks = grid.num_chunks();

        if make_baseline || self.first_seen.is_none() {
            self.first_seen = None;
            self.prev_list = None;
            self.baseline_id = self.current_id;
        }
        if let Some(prev) = &self.prev_list
            && prev.len() != num_chunks as usize
        {
            return Err(Error::Config(format!(
                "region length changed: {} chunks, expected {}",
                num_chunks,
                prev.len()
            )));
        }
        self.ensure_map_capacity(num_chunks);
        let cur_id = self.current_id;

        let digests: Vec<Digest> = (0..num_chunks)
            .into_par_iter()
            .map(|c| Digest::of_chunk(&data[grid.span(c)]))
            .collect();
        let unchanged: Vec<bool> = {
            let prev_list = self.prev_list.as_deref();
            digests
                .par_iter()
                .enumerate()
                .map(|(c, digest)| prev_list.is_some_and(|prev| prev[c] == *digest))
                .collect()
        };

        // Insert pass: every changed chunk bids for its digest; the map
        // resolves racing bids to the lowest chunk index. Classification
        // reads the settled owners afterwards.
        let inserted = {
            let map = self.first_seen.as_ref().expect("map was just ensured");
            digests
                .par_iter()
                .enumerate()
                .try_for_each(|(c, digest)| -> Result<()> {
                    if !unchanged[c] {
                        map.insert(digest, NodeId::new(c as u32, cur_id))?;
                    }
                    Ok(())
                })
        };
        if let Err(err) = inserted {
            // The first-seen map may hold a partial pass; drop it so the
            // next checkpoint starts from a clean baseline.
            self.first_seen = None;
            self.prev_list = None;
            return Err(err);
        }

        let map = self.first_seen.as_ref().expect("map was just ensured");
        let classes: Vec<ChunkClass> = digests
            .par_iter()
            .enumerate()
            .map(|(c, digest)| {
                if unchanged[c] {
                    return ChunkClass::Identical;
                }
                match map.get(digest) {
                    Some(owner) if owner == NodeId::new(c as u32, cur_id) => ChunkClass::Distinct,
                    Some(owner) => ChunkClass::Repeat {
                        chunk: owner.node,
                        tree: owner.tree,
                    },
                    // The insert above claimed this digest.
                    None => ChunkClass::Distinct,
                }
            })
            .collect();

        let (diff, header) = write_diff_list(data, &grid, &classes, self.baseline_id, cur_id);
        let stats = CheckpointStats {
            data_bytes: (diff.len() - header.payload_offset()) as u64,
            metadata_bytes: header.payload_offset() as u64,
            distinct_entries: header.distinct_size,
            repeat_entries: header.num_repeats(),
        };
        debug!(
            "list checkpoint {}: {} distinct, {} repeats, {} payload bytes",
            cur_id, stats.distinct_entries, stats.repeat_entries, stats.data_bytes
        );

        self.prev_list = Some(digests);
        self.current_id += 1;
        Ok((diff, stats))
    }

    fn restart(&self, diffs: &[Vec<u8>], target_id: u32) -> Result<Vec<u8>> {
        restore::restart_list(diffs, target_id)
    }
}

/// Stage a list-mode diff. Same table shape as tree mode, with chunk
/// indices in the node fields: distinct chunk indices ascending, the
/// prior-checkpoint index, repeat pairs grouped by source snapshot
/// ascending, then the distinct chunks' bytes.
fn write_diff_list(
    data: &[u8],
    grid: &ChunkGrid,
    classes: &[ChunkClass],
    ref_id: u32,
    chkpt_id: u32,
) -> (Vec<u8>, DiffHeader) {
    let mut distinct = Vec::new();
    let mut groups: BTreeMap<u32, Vec<(u32, u32)>> = BTreeMap::new();
    for (c, class) in classes.iter().enumerate() {
        match *class {
            ChunkClass::Identical => {}
            ChunkClass::Distinct => distinct.push(c as u32),
            ChunkClass::Repeat { chunk, tree } => {
                groups.entry(tree).or_default().push((c as u32, chunk));
            }
        }
    }
    let curr_repeat_size = groups.get(&chkpt_id).map_or(0, |g| g.len() as u32);
    let num_repeats: usize = groups.values().map(Vec::len).sum();

    let header = DiffHeader {
        ref_id,
        chkpt_id,
        datalen: grid.datalen(),
        chunk_size: grid.chunk_size(),
        window_size: GLOBAL_WINDOW,
        num_prior_chkpts: groups.len() as u32,
        distinct_size: distinct.len() as u32,
        curr_repeat_size,
        prev_repeat_size: num_repeats as u32 - curr_repeat_size,
    };

    let payload_bytes: usize = distinct.iter().map(|&c| grid.chunk_bytes(c)).sum();
    let mut diff =
        Vec::with_capacity(HEADER_BYTES + 4 * distinct.len() + 8 * groups.len() + 8 * num_repeats + payload_bytes);
    header.encode_into(&mut diff);
    for &chunk in &distinct {
        header::push_u32(&mut diff, chunk);
    }
    for (&tree, entries) in &groups {
        header::push_u32(&mut diff, tree);
        header::push_u32(&mut diff, entries.len() as u32);
    }
    for entries in groups.values() {
        for &(chunk, prev_chunk) in entries {
            header::push_u32(&mut diff, chunk);
            header::push_u32(&mut diff, prev_chunk);
        }
    }
    for &chunk in &distinct {
        diff.extend_from_slice(&data[grid.span(chunk)]);
    }
    (diff, header)
}
