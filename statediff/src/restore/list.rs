use std::collections::HashMap;

use rayon::prelude::*;
use statediff_merkle::NodeId;

use crate::{
    error::{Error, Result},
    restore::{Slot, tree::copy_chunk, walk_chain},
};

/// List-mode restart: the tree walk specialized to leaf granularity.
/// Node fields in the tables are chunk indices, so no subtree expansion
/// is needed; everything else — payload regions, repeat groups, implicit
/// identical chunks — resolves the same way.
pub(crate) fn restart_list(diffs: &[Vec<u8>], target_id: u32) -> Result<Vec<u8>> {
    let mut slots: Vec<Slot> = Vec::new();

    walk_chain(diffs, target_id, |id, sections, grid, out, is_baseline| {
        let num_chunks = grid.num_chunks();
        if slots.is_empty() {
            slots = (0..num_chunks)
                .map(|c| Slot::Pending {
                    node: c,
                    tree: target_id,
                })
                .collect();
        }

        // Distinct chunk -> payload offset, honoring the short tail.
        let mut distinct_map: HashMap<u32, usize> =
            HashMap::with_capacity(sections.header.distinct_size as usize);
        let mut offset = 0usize;
        for k in 0..sections.header.distinct_size as usize {
            let chunk = sections.distinct_node(k);
            if chunk >= num_chunks {
                return Err(Error::Format(format!(
                    "distinct chunk {chunk} out of range"
                )));
            }
            distinct_map.insert(chunk, offset);
            offset += grid.chunk_bytes(chunk);
        }
        if offset != sections.payload.len() {
            return Err(Error::Format(format!(
                "distinct chunks cover {} bytes, payload has {}",
                offset,
                sections.payload.len()
            )));
        }

        let mut repeat_map: HashMap<u32, NodeId> =
            HashMap::with_capacity(sections.header.num_repeats() as usize);
        for (source_tree, entries) in sections.repeat_groups()? {
            for k in entries {
                let (chunk, prev) = sections.repeat_pair(k);
                if chunk >= num_chunks || prev >= num_chunks {
                    return Err(Error::Format(format!(
                        "repeat pair ({chunk},{prev}) out of range"
                    )));
                }
                repeat_map.insert(chunk, NodeId::new(prev, source_tree));
            }
        }

        let payload = sections.payload;
        out.par_chunks_mut(grid.chunk_size() as usize)
            .zip(slots.par_iter_mut())
            .try_for_each(|(chunk_out, slot)| -> Result<()> {
                let Slot::Pending { node, tree } = *slot else {
                    return Ok(());
                };
                if tree != id {
                    if is_baseline {
                        return Err(Error::CorruptChain(format!(
                            "reference to chunk {node} of snapshot {tree} survives past the baseline"
                        )));
                    }
                    return Ok(());
                }
                if let Some(&off) = distinct_map.get(&node) {
                    copy_chunk(chunk_out, payload, off)?;
                    *slot = Slot::Filled;
                } else if let Some(&owner) = repeat_map.get(&node) {
                    if owner.tree == id {
                        let off = *distinct_map.get(&owner.node).ok_or_else(|| {
                            Error::CorruptChain(format!(
                                "repeat of chunk {node} points at chunk {} outside the distinct set",
                                owner.node
                            ))
                        })?;
                        copy_chunk(chunk_out, payload, off)?;
                        *slot = Slot::Filled;
                    } else {
                        *slot = Slot::Pending {
                            node: owner.node,
                            tree: owner.tree,
                        };
                    }
                } else if is_baseline {
                    return Err(Error::CorruptChain(format!(
                        "chunk {node} resolves through neither table of the baseline diff"
                    )));
                } else {
                    *slot = Slot::Pending {
                        node,
                        tree: id - 1,
                    };
                }
                Ok(())
            })
    })
}
