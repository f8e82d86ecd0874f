use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::types::RowId;

/// Fixed-size atomic bitset over a segment's rows; bit set means "killed".
/// Sized once at segment build and never restructured afterwards, so kills
/// need no lock.
#[derive(Debug)]
pub struct DeadRowMap {
    bits: Vec<AtomicU64>,
    len: u32,
}

impl DeadRowMap {
    pub fn new(row_count: u32) -> Self {
        let words = (row_count as usize).div_ceil(64);
        DeadRowMap {
            bits: (0..words).map(|_| AtomicU64::new(0)).collect(),
            len: row_count,
        }
    }

    /// Restore from persisted words
    pub fn from_words(words: Vec<u64>, row_count: u32) -> Self {
        debug_assert!(words.len() >= (row_count as usize).div_ceil(64));
        DeadRowMap {
            bits: words.into_iter().map(AtomicU64::new).collect(),
            len: row_count,
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mark a row dead; returns false if it already was
    pub fn kill(&self, row_id: RowId) -> bool {
        debug_assert!(row_id < self.len);
        let mask = 1u64 << (row_id % 64);
        let prev = self.bits[row_id as usize / 64].fetch_or(mask, Ordering::AcqRel);
        prev & mask == 0
    }

    pub fn is_dead(&self, row_id: RowId) -> bool {
        debug_assert!(row_id < self.len);
        self.bits[row_id as usize / 64].load(Ordering::Acquire) & (1u64 << (row_id % 64)) != 0
    }

    pub fn dead_count(&self) -> u32 {
        self.bits
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones())
            .sum()
    }

    /// Snapshot the raw words for persistence
    pub fn to_words(&self) -> Vec<u64> {
        self.bits.iter().map(|w| w.load(Ordering::Acquire)).collect()
    }

    pub fn memory_bytes(&self) -> usize {
        self.bits.len() * 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kill_once() {
        let map = DeadRowMap::new(100);
        assert!(!map.is_dead(70));
        assert!(map.kill(70));
        assert!(!map.kill(70));
        assert!(map.is_dead(70));
        assert_eq!(map.dead_count(), 1);
    }

    #[test]
    fn test_round_trip_words() {
        let map = DeadRowMap::new(130);
        map.kill(0);
        map.kill(64);
        map.kill(129);
        let restored = DeadRowMap::from_words(map.to_words(), 130);
        assert!(restored.is_dead(0));
        assert!(restored.is_dead(64));
        assert!(restored.is_dead(129));
        assert_eq!(restored.dead_count(), 3);
    }

    #[test]
    fn test_concurrent_kills_count_once() {
        use std::sync::Arc;
        let map = Arc::new(DeadRowMap::new(1024));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let map = Arc::clone(&map);
            handles.push(std::thread::spawn(move || {
                let mut newly = 0u32;
                for row in 0..1024 {
                    if map.kill(row) {
                        newly += 1;
                    }
                }
                newly
            }));
        }
        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 1024);
        assert_eq!(map.dead_count(), 1024);
    }
}
