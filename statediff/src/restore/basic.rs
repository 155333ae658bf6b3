use std::collections::HashMap;

use rayon::prelude::*;

use crate::{
    error::{Error, Result},
    restore::walk_chain,
};

/// Basic-mode restart: every diff carries the chunks that changed at
/// that snapshot, so each chunk's bytes come from the newest diff in the
/// chain that lists it. The baseline lists every chunk.
pub(crate) fn restart_basic(diffs: &[Vec<u8>], target_id: u32) -> Result<Vec<u8>> {
    let mut filled: Vec<bool> = Vec::new();

    walk_chain(diffs, target_id, |_id, sections, grid, out, is_baseline| {
        if filled.is_empty() {
            filled = vec![false; grid.num_chunks() as usize];
        }

        // Chunk index -> payload offset, honoring the short tail chunk.
        let mut offsets: HashMap<u32, usize> =
            HashMap::with_capacity(sections.header.distinct_size as usize);
        let mut offset = 0usize;
        for k in 0..sections.header.distinct_size as usize {
            let chunk = sections.distinct_node(k);
            if chunk >= grid.num_chunks() {
                return Err(Error::Format(format!(
                    "changed-chunk index {chunk} out of range"
                )));
            }
            offsets.insert(chunk, offset);
            offset += grid.chunk_bytes(chunk);
        }
        if offset != sections.payload.len() {
            return Err(Error::Format(format!(
                "changed chunks cover {} bytes, payload has {}",
                offset,
                sections.payload.len()
            )));
        }

        let payload = sections.payload;
        out.par_chunks_mut(grid.chunk_size() as usize)
            .zip(filled.par_iter_mut())
            .enumerate()
            .try_for_each(|(c, (chunk_out, done))| -> Result<()> {
                if *done {
                    return Ok(());
                }
                if let Some(&off) = offsets.get(&(c as u32)) {
                    chunk_out.copy_from_slice(&payload[off..off + chunk_out.len()]);
                    *done = true;
                } else if is_baseline {
                    return Err(Error::CorruptChain(format!(
                        "chunk {c} is absent from the baseline diff"
                    )));
                }
                Ok(())
            })
    })
}
