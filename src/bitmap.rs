//! Growable bitmap of used sectors.

use serde::{Deserialize, Serialize};

/// One bit per sector; set = in use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorBitmap {
    words: Vec<u64>,
}

impl SectorBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: u64) -> bool {
        let (word, bit) = Self::locate(index);
        self.words
            .get(word)
            .map_or(false, |w| w & (1u64 << bit) != 0)
    }

    pub fn set(&mut self, index: u64) {
        let (word, bit) = Self::locate(index);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << bit;
    }

    pub fn clear(&mut self, index: u64) {
        let (word, bit) = Self::locate(index);
        if let Some(w) = self.words.get_mut(word) {
            *w &= !(1u64 << bit);
        }
    }

    /// Lowest clear bit at or after `from`
    pub fn next_clear(&self, from: u64) -> u64 {
        let mut index = from;
        loop {
            let (word, bit) = Self::locate(index);
            match self.words.get(word) {
                None => return index,
                Some(&w) => {
                    let free = !w & (u64::MAX << bit);
                    if free != 0 {
                        return (word as u64) * 64 + free.trailing_zeros() as u64;
                    }
                    index = (word as u64 + 1) * 64;
                }
            }
        }
    }

    /// Start of the first run of `len` clear bits at or after `from`
    pub fn find_clear_run(&self, from: u64, len: u64) -> u64 {
        let mut start = self.next_clear(from);
        loop {
            match (start..start + len).find(|&i| self.get(i)) {
                None => return start,
                Some(used) => start = self.next_clear(used + 1),
            }
        }
    }

    pub fn reset(&mut self) {
        self.words.clear();
    }

    pub fn count_ones(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    fn locate(index: u64) -> (usize, u32) {
        ((index / 64) as usize, (index % 64) as u32)
    }
}
