use log::debug;
use rayon::prelude::*;
use statediff_merkle::Digest;
use statediff_primitives::AtomicBitset;

use crate::{
    chunks::ChunkGrid,
    dedup::{CheckpointStats, DedupMode, Deduplicator},
    error::{Error, Result},
    header::{self, DiffHeader, HEADER_BYTES},
    restore,
};

/// Per-offset deduplication: a chunk is emitted when its digest differs
/// from the digest at the same offset in the previous snapshot. Only the
/// time dimension is exploited; a chunk that moved is a changed chunk.
pub struct BasicDeduplicator {
    chunk_size: u32,
    current_id: u32,
    baseline_id: u32,
    /// Digest per chunk offset, carried across snapshots.
    hash_list: Option<Vec<Digest>>,
}

impl BasicDeduplicator {
    pub fn new(chunk_size: u32) -> Result<Self> {
        ChunkGrid::new(0, chunk_size)?;
        Ok(BasicDeduplicator {
            chunk_size,
            current_id: 0,
            baseline_id: 0,
            hash_list: None,
        })
    }
}

impl Deduplicator for BasicDeduplicator {
    fn mode(&self) -> DedupMode {
        DedupMode::Basic
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

        let baseline = make_baseline || self.hash_list.is_none();
        if baseline {
            self.hash_list = None;
            self.baseline_id = self.current_id;
        }
        if let Some(list) = &self.hash_list
            && list.len() != num_chunks as usize
        {
            return Err(Error::Config(format!(
                "region length changed: {} chunks, expected {}",
                num_chunks,
                list.len()
            )));
        }

        let digests: Vec<Digest> = (0..num_chunks)
            .into_par_iter()
            .map(|c| Digest::of_chunk(&data[grid.span(c)]))
            .collect();

        let changed = AtomicBitset::new(num_chunks as usize);
        match &self.hash_list {
            None => (0..num_chunks as usize).into_par_iter().for_each(|c| {
                changed.set(c);
            }),
            Some(list) => {
                digests
                    .par_iter()
                    .zip(list.par_iter())
                    .enumerate()
                    .for_each(|(c, (new, old))| {
                        if new != old {
                            changed.set(c);
                        }
                    });
            }
        }

        let changed_chunks = changed.to_sorted_indices();
        let diff = write_diff_basic(data, &grid, &changed_chunks, self.baseline_id, self.current_id);

        let stats = CheckpointStats {
            data_bytes: (diff.len() - HEADER_BYTES - 4 * changed_chunks.len()) as u64,
            metadata_bytes: (HEADER_BYTES + 4 * changed_chunks.len()) as u64,
            distinct_entries: changed_chunks.len() as u32,
            repeat_entries: 0,
        };
        debug!(
            "basic checkpoint {}: {} of {} chunks changed, {} payload bytes",
            self.current_id,
            changed_chunks.len(),
            num_chunks,
            stats.data_bytes
        );

        self.hash_list = Some(digests);
        self.current_id += 1;
        Ok((diff, stats))
    }

    fn restart(&self, diffs: &[Vec<u8>], target_id: u32) -> Result<Vec<u8>> {
        restore::restart_basic(diffs, target_id)
    }
}

/// Stage a basic-mode diff: header, changed chunk indices ascending, then
/// the changed chunks' bytes in the same order.
fn write_diff_basic(
    data: &[u8],
    grid: &ChunkGrid,
    changed_chunks: &[u32],
    ref_id: u32,
    chkpt_id: u32,
) -> Vec<u8> {
    let header = DiffHeader {
        ref_id,
        chkpt_id,
        datalen: grid.datalen(),
        chunk_size: grid.chunk_size(),
        distinct_size: changed_chunks.len() as u32,
        ..DiffHeader::default()
    };
    let payload_bytes: usize = changed_chunks
        .iter()
        .map(|&c| grid.chunk_bytes(c))
        .sum();
    let mut diff = Vec::with_capacity(HEADER_BYTES + 4 * changed_chunks.len() + payload_bytes);
    header.encode_into(&mut diff);
    for &chunk in changed_chunks {
        header::push_u32(&mut diff, chunk);
    }
    for &chunk in changed_chunks {
        diff.extend_from_slice(&data[grid.span(chunk)]);
    }
    diff
}
