use serde::{Deserialize, Serialize};

/// N-gram lengths hashed into the filter
pub const NGRAM_LENGTHS: [usize; 2] = [2, 4];

/// Per-checkpoint bloom filter over keyword n-grams, used to prune
/// checkpoint spans during infix expansion. Each checkpoint owns
/// `hashes × per_entry` 64-bit words; every n-gram sets one bit per hash
/// region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfixBloom {
    per_entry: usize,
    hashes: usize,
    bits: Vec<u64>,
}

impl InfixBloom {
    pub fn new(checkpoint_count: usize, per_entry: u8, hashes: u8) -> Self {
        let per_entry = per_entry.max(1) as usize;
        let hashes = hashes.max(1) as usize;
        InfixBloom {
            per_entry,
            hashes,
            bits: vec![0; checkpoint_count * per_entry * hashes],
        }
    }

    pub fn from_parts(bits: Vec<u64>, per_entry: u8, hashes: u8) -> Self {
        InfixBloom {
            per_entry: per_entry.max(1) as usize,
            hashes: hashes.max(1) as usize,
            bits,
        }
    }

    pub fn raw(&self) -> &[u64] {
        &self.bits
    }

    pub fn per_entry(&self) -> u8 {
        self.per_entry as u8
    }

    pub fn hashes(&self) -> u8 {
        self.hashes as u8
    }

    pub fn memory_bytes(&self) -> usize {
        self.bits.len() * 8
    }

    fn words_per_checkpoint(&self) -> usize {
        self.per_entry * self.hashes
    }

    pub fn checkpoint_count(&self) -> usize {
        if self.words_per_checkpoint() == 0 {
            0
        } else {
            self.bits.len() / self.words_per_checkpoint()
        }
    }

    fn bit_slot(&self, checkpoint: usize, seed: usize, hash: u64) -> (usize, u64) {
        let region_bits = (self.per_entry * 64) as u64;
        let bit = hash % region_bits;
        let word = checkpoint * self.words_per_checkpoint()
            + seed * self.per_entry
            + (bit / 64) as usize;
        (word, 1u64 << (bit % 64))
    }

    /// Hash every n-gram of `word` into the checkpoint's filter
    pub fn add_word(&mut self, checkpoint: usize, word: &[u8]) {
        for_each_ngram(word, |ngram| {
            for seed in 0..self.hashes {
                let (slot, mask) = self.bit_slot(checkpoint, seed, seeded_hash(ngram, seed));
                self.bits[slot] |= mask;
            }
        });
    }

    /// False means the checkpoint span definitely contains no word with
    /// this infix; true means it may
    pub fn may_match(&self, checkpoint: usize, infix: &[u8]) -> bool {
        let mut possible = true;
        for_each_ngram(infix, |ngram| {
            if !possible {
                return;
            }
            for seed in 0..self.hashes {
                let (slot, mask) = self.bit_slot(checkpoint, seed, seeded_hash(ngram, seed));
                if self.bits[slot] & mask == 0 {
                    possible = false;
                    return;
                }
            }
        });
        possible
    }
}

/// Build the filter for an encoded wordlist, one entry per checkpoint span
pub fn build_infix_bloom(
    words: &[u8],
    checkpoints: &[crate::codec::wordlist::Checkpoint],
    mode: crate::core::config::DictMode,
    per_entry: u8,
    hashes: u8,
) -> InfixBloom {
    use crate::codec::wordlist::{WordlistReader, span_end};

    let mut bloom = InfixBloom::new(checkpoints.len(), per_entry, hashes);
    for (cp_idx, cp) in checkpoints.iter().enumerate() {
        let end = span_end(checkpoints, cp_idx, words.len());
        for entry in WordlistReader::span(words, mode, cp.offset, end) {
            bloom.add_word(cp_idx, entry.key.keyword_bytes());
        }
    }
    bloom
}

/// Slice `word` into character n-grams of every configured length
fn for_each_ngram(word: &[u8], mut f: impl FnMut(&[u8])) {
    let Ok(text) = std::str::from_utf8(word) else {
        return;
    };
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let char_count = boundaries.len() - 1;
    for &n in &NGRAM_LENGTHS {
        if char_count < n {
            continue;
        }
        for start in 0..=char_count - n {
            f(&word[boundaries[start]..boundaries[start + n]]);
        }
    }
}

fn seeded_hash(bytes: &[u8], seed: usize) -> u64 {
    let mut hash = 0xcbf29ce484222325u64 ^ (seed as u64).wrapping_mul(0x9e3779b97f4a7c15);
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bloom_prunes_absent_infix() {
        let mut bloom = InfixBloom::new(2, 8, 2);
        bloom.add_word(0, b"alpha");
        bloom.add_word(0, b"alphanumeric");
        bloom.add_word(1, b"omega");

        assert!(bloom.may_match(0, b"lpha"));
        assert!(bloom.may_match(1, b"mega"));
        // "lpha" n-grams were never hashed into checkpoint 1
        assert!(!bloom.may_match(1, b"lpha"));
    }

    #[test]
    fn test_short_infix_never_prunes() {
        let bloom = InfixBloom::new(1, 8, 2);
        assert!(bloom.may_match(0, b"x"));
    }

    #[test]
    fn test_round_trip_raw() {
        let mut bloom = InfixBloom::new(3, 8, 2);
        bloom.add_word(2, b"keyword");
        let restored = InfixBloom::from_parts(bloom.raw().to_vec(), 8, 2);
        assert!(restored.may_match(2, b"eywor"));
        assert_eq!(restored.checkpoint_count(), 3);
    }
}
