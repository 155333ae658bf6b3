use std::sync::{
    OnceLock,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use statediff_merkle::{Digest, NodeId};

use crate::CapacityError;

/// Unclaimed value slot; greater than any real packed id, so the first
/// `fetch_min` always lands.
const VACANT: u64 = u64::MAX;

struct Slot {
    key: OnceLock<Digest>,
    value: AtomicU64,
}

/// What an insert found at the key's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The digest was not present; this call claimed the slot.
    Inserted,
    /// The digest was already claimed by an earlier insert.
    Existing,
}

/// A fixed-capacity open-addressed map from chunk digests to [`NodeId`]s,
/// shared across a parallel classification pass.
///
/// Slots are claimed by a compare-and-set on an empty key; racing inserts
/// of the same digest all resolve the value with a monotonic minimum over
/// the packed `(tree, node)` id. Two properties fall out:
///
/// - across snapshots the map is first-wins append-only, because an older
///   snapshot id packs smaller than any newer one and is never displaced;
/// - within one snapshot's insert pass the smallest node index owns the
///   digest, no matter how the threads interleave.
///
/// The result read after a pass is therefore a pure function of the
/// inserted set.
pub struct DigestMap {
    slots: Box<[Slot]>,
    mask: usize,
    capacity: usize,
    len: AtomicUsize,
}

impl DigestMap {
    /// Create a map able to hold `capacity` distinct digests. The backing
    /// table is oversized to keep probe chains short; `capacity` itself
    /// is the hard limit reported by [`DigestMap::insert`].
    pub fn with_capacity(capacity: usize) -> Self {
        let table = (capacity.max(1) * 2).next_power_of_two();
        let slots = (0..table)
            .map(|_| Slot {
                key: OnceLock::new(),
                value: AtomicU64::new(VACANT),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        DigestMap {
            slots,
            mask: table - 1,
            capacity,
            len: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of distinct digests claimed so far.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn start_index(digest: &Digest) -> usize {
        // SHA-1 output is uniform; the first eight bytes are as good a
        // probe start as any rehash.
        let bytes = digest.as_bytes();
        u64::from_le_bytes(bytes[..8].try_into().expect("digest is 20 bytes")) as usize
    }

    /// Insert `id` for `digest`, resolving collisions by packed minimum.
    ///
    /// Safe to call concurrently; the final value for a digest is the
    /// smallest id any caller presented since the last clear.
    pub fn insert(&self, digest: &Digest, id: NodeId) -> Result<InsertOutcome, CapacityError> {
        let mut idx = Self::start_index(digest) & self.mask;
        for _ in 0..=self.mask {
            let slot = &self.slots[idx];
            match slot.key.set(*digest) {
                Ok(()) => {
                    slot.value.fetch_min(id.pack(), Ordering::AcqRel);
                    self.len.fetch_add(1, Ordering::AcqRel);
                    return Ok(InsertOutcome::Inserted);
                }
                Err(_) => {
                    if slot.key.get() == Some(digest) {
                        slot.value.fetch_min(id.pack(), Ordering::AcqRel);
                        return Ok(InsertOutcome::Existing);
                    }
                }
            }
            idx = (idx + 1) & self.mask;
        }
        Err(CapacityError {
            structure: "digest map",
            capacity: self.capacity,
        })
    }

    /// Look up the current owner of `digest`.
    ///
    /// Meaningful after the insert pass that may race with it has
    /// completed; a slot whose value was never resolved reads as absent.
    pub fn get(&self, digest: &Digest) -> Option<NodeId> {
        let mut idx = Self::start_index(digest) & self.mask;
        for _ in 0..=self.mask {
            let slot = &self.slots[idx];
            match slot.key.get() {
                None => return None,
                Some(key) if key == digest => {
                    let packed = slot.value.load(Ordering::Acquire);
                    return (packed != VACANT).then(|| NodeId::unpack(packed));
                }
                Some(_) => idx = (idx + 1) & self.mask,
            }
        }
        None
    }

    /// Drop every entry, keeping the allocation.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.key = OnceLock::new();
            *slot.value.get_mut() = VACANT;
        }
        *self.len.get_mut() = 0;
    }

    /// Iterate the claimed entries in table order.
    ///
    /// Meaningful between insert passes; the order is an implementation
    /// detail, callers re-keying into a larger map do not depend on it.
    pub fn entries(&self) -> impl Iterator<Item = (Digest, NodeId)> + '_ {
        self.slots.iter().filter_map(|slot| {
            let key = slot.key.get()?;
            let packed = slot.value.load(Ordering::Acquire);
            (packed != VACANT).then(|| (*key, NodeId::unpack(packed)))
        })
    }
}

#[cfg(test)]
mod tests {
    use rayon::prelude::*;

    use super::*;

    fn digest(label: u8) -> Digest {
        Digest::of_chunk(&[label])
    }

    #[test]
    fn test_insert_then_get() {
        let map = DigestMap::with_capacity(8);
        let d = digest(1);
        assert_eq!(map.insert(&d, NodeId::new(5, 0)), Ok(InsertOutcome::Inserted));
        assert_eq!(map.get(&d), Some(NodeId::new(5, 0)));
        assert_eq!(map.get(&digest(2)), None);
    }

    #[test]
    fn test_collision_keeps_smallest_node() {
        let map = DigestMap::with_capacity(8);
        let d = digest(1);
        map.insert(&d, NodeId::new(9, 3)).expect("insert");
        assert_eq!(map.insert(&d, NodeId::new(4, 3)), Ok(InsertOutcome::Existing));
        assert_eq!(map.get(&d), Some(NodeId::new(4, 3)));
        // A later snapshot never displaces an earlier one.
        map.insert(&d, NodeId::new(0, 7)).expect("insert");
        assert_eq!(map.get(&d), Some(NodeId::new(4, 3)));
    }

    #[test]
    fn test_parallel_inserts_resolve_to_minimum() {
        let map = DigestMap::with_capacity(64);
        let d = digest(7);
        (0..1024u32)
            .into_par_iter()
            .for_each(|node| {
                map.insert(&d, NodeId::new(node, 2)).expect("insert");
            });
        assert_eq!(map.get(&d), Some(NodeId::new(0, 2)));
    }

    #[test]
    fn test_full_table_reports_capacity() {
        let map = DigestMap::with_capacity(2);
        // Table holds 4 slots; the fifth distinct digest cannot land.
        let mut result = Ok(InsertOutcome::Inserted);
        for label in 0..5 {
            result = map.insert(&digest(label), NodeId::new(u32::from(label), 0));
            if result.is_err() {
                break;
            }
        }
        assert!(result.is_err());
    }

    #[test]
    fn test_len_and_entries() {
        let map = DigestMap::with_capacity(8);
        map.insert(&digest(1), NodeId::new(1, 0)).expect("insert");
        map.insert(&digest(2), NodeId::new(2, 0)).expect("insert");
        map.insert(&digest(1), NodeId::new(9, 1)).expect("insert");
        assert_eq!(map.len(), 2);
        let mut entries: Vec<_> = map.entries().collect();
        entries.sort_by_key(|(_, id)| id.pack());
        assert_eq!(
            entries,
            vec![
                (digest(1), NodeId::new(1, 0)),
                (digest(2), NodeId::new(2, 0)),
            ]
        );
    }

    #[test]
    fn test_clear_resets_entries() {
        let mut map = DigestMap::with_capacity(4);
        map.insert(&digest(1), NodeId::new(1, 0)).expect("insert");
        map.clear();
        assert_eq!(map.get(&digest(1)), None);
        map.insert(&digest(1), NodeId::new(2, 1)).expect("insert");
        assert_eq!(map.get(&digest(1)), Some(NodeId::new(2, 1)));
    }
}
