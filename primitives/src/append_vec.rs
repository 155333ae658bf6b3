use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::CapacityError;

/// A preallocated append-only vector of node indices.
///
/// Parallel workers reserve slots with an atomic cursor, so the physical
/// order depends on scheduling; callers that need a canonical order drain
/// with [`AppendVec::into_sorted_vec`], which is what the diff writers do
/// before emitting.
pub struct AppendVec {
    slots: Box<[AtomicU32]>,
    len: AtomicUsize,
}

impl AppendVec {
    pub fn with_capacity(capacity: usize) -> Self {
        AppendVec {
            slots: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            len: AtomicUsize::new(0),
        }
    }

    /// Append `value`, failing if the pinned capacity is exhausted.
    pub fn push(&self, value: u32) -> Result<(), CapacityError> {
        let idx = self.len.fetch_add(1, Ordering::Relaxed);
        if idx >= self.slots.len() {
            return Err(CapacityError {
                structure: "append vector",
                capacity: self.slots.len(),
            });
        }
        self.slots[idx].store(value, Ordering::Release);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire).min(self.slots.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain into an ascending `Vec`.
    pub fn into_sorted_vec(self) -> Vec<u32> {
        let len = self.len();
        let mut out: Vec<u32> = self.slots[..len]
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .collect();
        out.sort_unstable();
        out
    }
}

#[cfg(test)]
mod tests {
    use rayon::prelude::*;

    use super::*;

    #[test]
    fn test_push_and_drain_sorted() {
        let vec = AppendVec::with_capacity(4);
        for v in [3u32, 1, 2] {
            vec.push(v).expect("push");
        }
        assert_eq!(vec.len(), 3);
        assert_eq!(vec.into_sorted_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn test_capacity_is_pinned() {
        let vec = AppendVec::with_capacity(2);
        vec.push(1).expect("push");
        vec.push(2).expect("push");
        assert!(vec.push(3).is_err());
        assert_eq!(vec.into_sorted_vec(), vec![1, 2]);
    }

    #[test]
    fn test_parallel_appends_drain_deterministically() {
        let vec = AppendVec::with_capacity(512);
        (0..512u32)
            .into_par_iter()
            .for_each(|v| vec.push(v).expect("push"));
        let drained = vec.into_sorted_vec();
        assert_eq!(drained, (0..512).collect::<Vec<u32>>());
    }
}
