use alloc::{vec, vec::Vec};

const WORD_BITS: usize = u64::BITS as usize;

/// A fixed-length array of bits, stored in 64-bit words.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitArray {
    words: Vec<u64>,
    len: usize,
}

impl BitArray {
    /// A bit array of `len` bits, all clear.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, idx: usize) -> bool {
        assert!(idx < self.len, "bit {idx} out of range (len {})", self.len);
        self.words[idx / WORD_BITS] >> (idx % WORD_BITS) & 1 != 0
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        assert!(idx < self.len, "bit {idx} out of range (len {})", self.len);
        let mask = 1 << (idx % WORD_BITS);
        if value {
            self.words[idx / WORD_BITS] |= mask;
        } else {
            self.words[idx / WORD_BITS] &= !mask;
        }
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Finds the first clear bit at or after `start`, sets it and returns its index.
    pub fn scan_and_flip(&mut self, start: usize) -> Option<usize> {
        let mut idx = start;
        while idx < self.len {
            let word = self.words[idx / WORD_BITS] | ((1 << (idx % WORD_BITS)) - 1);
            if word == u64::MAX {
                idx = (idx / WORD_BITS + 1) * WORD_BITS;
                continue;
            }
            let found = idx / WORD_BITS * WORD_BITS + word.trailing_ones() as usize;
            if found >= self.len {
                return None;
            }
            self.set(found, true);
            return Some(found);
        }
        None
    }
}
