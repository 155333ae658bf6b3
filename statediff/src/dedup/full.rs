use log::debug;

use crate::{
    chunks::ChunkGrid,
    dedup::{CheckpointStats, DedupMode, Deduplicator},
    error::Result,
    header::{DiffHeader, HEADER_BYTES},
    restore,
};

/// The no-deduplication boundary case: every checkpoint stores the whole
/// region and restores from itself alone.
pub struct FullDeduplicator {
    chunk_size: u32,
    current_id: u32,
}

impl FullDeduplicator {
    pub fn new(chunk_size: u32) -> Result<Self> {
        ChunkGrid::new(0, chunk_size)?;
        Ok(FullDeduplicator {
            chunk_size,
            current_id: 0,
        })
    }
}

impl Deduplicator for FullDeduplicator {
    fn mode(&self) -> DedupMode {
        DedupMode::Full
    }

    fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    fn checkpoint(
        &mut self,
        data: &[u8],
        _make_baseline: bool,
    ) -> Result<(Vec<u8>, CheckpointStats)> {
        ChunkGrid::new(data.len() as u64, self.chunk_size)?;
        let header = DiffHeader {
            ref_id: self.current_id,
            chkpt_id: self.current_id,
            datalen: data.len() as u64,
            chunk_size: self.chunk_size,
            ..DiffHeader::default()
        };
        let mut diff = Vec::with_capacity(HEADER_BYTES + data.len());
        header.encode_into(&mut diff);
        diff.extend_from_slice(data);

        let stats = CheckpointStats {
            data_bytes: data.len() as u64,
            metadata_bytes: HEADER_BYTES as u64,
            ..CheckpointStats::default()
        };
        debug!(
            "full checkpoint {}: {} payload bytes",
            self.current_id, stats.data_bytes
        );
        self.current_id += 1;
        Ok((diff, stats))
    }

    fn restart(&self, diffs: &[Vec<u8>], target_id: u32) -> Result<Vec<u8>> {
        restore::restart_full(diffs, target_id)
    }
}
