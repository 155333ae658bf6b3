use std::sync::atomic::{AtomicU64, Ordering};

/// A fixed-width bitset with atomic set, for marking chunks from a
/// parallel compare pass.
pub struct AtomicBitset {
    words: Box<[AtomicU64]>,
    bits: usize,
}

impl AtomicBitset {
    pub fn new(bits: usize) -> Self {
        AtomicBitset {
            words: (0..bits.div_ceil(64)).map(|_| AtomicU64::new(0)).collect(),
            bits,
        }
    }

    pub fn len(&self) -> usize {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn set(&self, bit: usize) {
        debug_assert!(bit < self.bits);
        self.words[bit / 64].fetch_or(1 << (bit % 64), Ordering::Relaxed);
    }

    pub fn test(&self, bit: usize) -> bool {
        debug_assert!(bit < self.bits);
        self.words[bit / 64].load(Ordering::Relaxed) & (1 << (bit % 64)) != 0
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Indices of all set bits, ascending.
    pub fn to_sorted_indices(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.count());
        for (w, word) in self.words.iter().enumerate() {
            let mut bits = word.load(Ordering::Relaxed);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                out.push((w * 64 + bit) as u32);
                bits &= bits - 1;
            }
        }
        out
    }

    /// Clear every bit, keeping the allocation.
    pub fn reset(&mut self) {
        for word in &mut self.words {
            *word.get_mut() = 0;
        }
    }
}
