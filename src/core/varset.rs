//! Bit sets over tracked local variables.
//!
//! A [`VarSet`] holds one bit per tracked variable index. Snapshots stored on
//! instruction groups and call records are plain word slices in the arena;
//! [`VarSet::words`] and [`VarSet::from_words`] convert between the two.

use std::fmt;

/// Growable bit set indexed by tracked-variable number.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct VarSet {
    words: Vec<u64>,
}

impl VarSet {
    /// Empty set with room for `count` variables.
    pub fn with_capacity(count: usize) -> Self {
        Self {
            words: Vec::with_capacity(count.div_ceil(64)),
        }
    }

    /// Rebuild a set from a stored snapshot.
    pub fn from_words(words: &[u64]) -> Self {
        let mut set = Self {
            words: words.to_vec(),
        };
        set.trim();
        set
    }

    /// Build a set from variable indices.
    pub fn from_indices(indices: &[u32]) -> Self {
        let mut set = Self::default();
        for &idx in indices {
            set.insert(idx);
        }
        set
    }

    pub fn insert(&mut self, idx: u32) {
        let word = (idx / 64) as usize;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (idx % 64);
    }

    pub fn remove(&mut self, idx: u32) {
        let word = (idx / 64) as usize;
        if let Some(w) = self.words.get_mut(word) {
            *w &= !(1u64 << (idx % 64));
        }
        self.trim();
    }

    pub fn contains(&self, idx: u32) -> bool {
        self.words
            .get((idx / 64) as usize)
            .is_some_and(|w| w & (1u64 << (idx % 64)) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    /// Raw words; trailing zero words are never stored.
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Iterate set members in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut bits = word;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let bit = bits.trailing_zeros();
                bits &= bits - 1;
                Some(i as u32 * 64 + bit)
            })
        })
    }

    fn trim(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }
}

impl fmt::Debug for VarSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
