use std::collections::HashMap;

use rayon::prelude::*;
use statediff_merkle::{NodeId, first_chunk, leaf_of_chunk, num_leaf_descendants};

use crate::{
    chunks::ChunkGrid,
    error::{Error, Result},
    restore::{DiffSections, Slot, walk_chain},
};

/// Tree-mode restart.
///
/// Every output chunk starts out waiting on its own leaf in the target
/// snapshot. Visiting a diff resolves the chunks waiting on it: a leaf
/// found under a distinct root copies bytes out of the payload, a leaf
/// found in the repeat table either copies (owner in this snapshot) or
/// re-waits on the owner's snapshot, and a leaf in neither table is
/// implicitly identical and re-waits on the snapshot before. Anything
/// still unresolved past the baseline is a corrupt chain.
pub(crate) fn restart_tree(diffs: &[Vec<u8>], target_id: u32) -> Result<Vec<u8>> {
    let mut slots: Vec<Slot> = Vec::new();

    let out = walk_chain(diffs, target_id, |id, sections, grid, out, is_baseline| {
        let num_nodes = grid.num_nodes();
        if slots.is_empty() {
            slots = (0..grid.num_chunks())
                .map(|c| Slot::Pending {
                    node: leaf_of_chunk(c, num_nodes),
                    tree: target_id,
                })
                .collect();
        }

        let distinct_map = expand_distinct(sections, grid)?;
        let repeat_map = expand_repeats(sections, grid)?;

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
                            "reference to node {node} of snapshot {tree} survives past the baseline"
                        )));
                    }
                    return Ok(());
                }
                if let Some(&offset) = distinct_map.get(&node) {
                    copy_chunk(chunk_out, payload, offset)?;
                    *slot = Slot::Filled;
                } else if let Some(&owner) = repeat_map.get(&node) {
                    if owner.tree == id {
                        let offset = *distinct_map.get(&owner.node).ok_or_else(|| {
                            Error::CorruptChain(format!(
                                "repeat of node {node} points at node {} outside the distinct regions",
                                owner.node
                            ))
                        })?;
                        copy_chunk(chunk_out, payload, offset)?;
                        *slot = Slot::Filled;
                    } else {
                        *slot = Slot::Pending {
                            node: owner.node,
                            tree: owner.tree,
                        };
                    }
                } else if is_baseline {
                    return Err(Error::CorruptChain(format!(
                        "node {node} resolves through neither table of the baseline diff"
                    )));
                } else {
                    // Not listed: identical to the snapshot before, at
                    // the same leaf.
                    *slot = Slot::Pending {
                        node,
                        tree: id - 1,
                    };
                }
                Ok(())
            })
    })?;

    debug_assert!(slots.iter().all(|s| *s == Slot::Filled));
    Ok(out)
}

/// Map every node under every distinct root to its payload byte offset.
///
/// Regions are laid out in table order; a region reaching the end of the
/// data is trimmed, and offsets of later regions account for that.
fn expand_distinct(sections: &DiffSections<'_>, grid: &ChunkGrid) -> Result<HashMap<u32, usize>> {
    let num_nodes = grid.num_nodes();
    let mut map = HashMap::with_capacity(num_nodes as usize);
    let mut offset = 0usize;
    for k in 0..sections.header.distinct_size as usize {
        let root = sections.distinct_node(k);
        if root >= num_nodes {
            return Err(Error::Format(format!("distinct node {root} out of range")));
        }
        let root_first = first_chunk(root, num_nodes);
        // The whole subtree resolves into this region, so repeats may
        // reference any node under it, not just the root.
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            let delta = (first_chunk(node, num_nodes) - root_first) as usize
                * grid.chunk_size() as usize;
            if map.insert(node, offset + delta).is_some() {
                return Err(Error::Format(format!(
                    "distinct regions overlap at node {node}"
                )));
            }
            if 2 * node + 1 < num_nodes {
                stack.push(2 * node + 1);
                stack.push(2 * node + 2);
            }
        }
        offset += grid.span_bytes(root_first, num_leaf_descendants(root, num_nodes));
    }
    if offset != sections.payload.len() {
        return Err(Error::Format(format!(
            "distinct regions cover {} bytes, payload has {}",
            offset,
            sections.payload.len()
        )));
    }
    Ok(map)
}

/// Expand the repeat table to leaf granularity: every leaf under an
/// emitted node maps to the same-rank leaf under its owner, tagged with
/// the owner's snapshot from the prior-checkpoint index.
fn expand_repeats(sections: &DiffSections<'_>, grid: &ChunkGrid) -> Result<HashMap<u32, NodeId>> {
    let num_nodes = grid.num_nodes();
    let mut map = HashMap::with_capacity(grid.num_chunks() as usize);
    for (source_tree, entries) in sections.repeat_groups()? {
        for k in entries {
            let (node, prev) = sections.repeat_pair(k);
            if node >= num_nodes || prev >= num_nodes {
                return Err(Error::Format(format!(
                    "repeat pair ({node},{prev}) out of range"
                )));
            }
            let len = num_leaf_descendants(node, num_nodes);
            if num_leaf_descendants(prev, num_nodes) != len {
                return Err(Error::Format(format!(
                    "repeat pair ({node},{prev}) covers mismatched spans"
                )));
            }
            let node_start = first_chunk(node, num_nodes);
            let prev_start = first_chunk(prev, num_nodes);
            for j in 0..len {
                map.insert(
                    leaf_of_chunk(node_start + j, num_nodes),
                    NodeId::new(leaf_of_chunk(prev_start + j, num_nodes), source_tree),
                );
            }
        }
    }
    Ok(map)
}

pub(crate) fn copy_chunk(chunk_out: &mut [u8], payload: &[u8], offset: usize) -> Result<()> {
    let end = offset + chunk_out.len();
    if end > payload.len() {
        return Err(Error::Format(format!(
            "payload read of {}..{} overruns {} payload bytes",
            offset,
            end,
            payload.len()
        )));
    }
    chunk_out.copy_from_slice(&payload[offset..end]);
    Ok(())
}
