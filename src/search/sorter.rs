use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::core::types::{AttrValue, DocId};

/// What a sorter orders by; attribute sorts read the named column
#[derive(Debug, Clone)]
pub enum SortKey {
    Score,
    Attr { name: String, ascending: bool },
}

/// One result row, detached from any segment: attribute values are owned
/// copies, never blob-pool pointers
#[derive(Debug, Clone)]
pub struct StoredMatch {
    pub doc: DocId,
    pub score: f32,
    /// Parallel to the sorter's select list
    pub values: Vec<AttrValue>,
    /// Packed ranking factors (export ranker only)
    pub factors: Option<Vec<u8>>,
    /// Precomputed ordering value, larger wins
    pub sort_value: f64,
}

struct HeapEntry(StoredMatch);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Worst entry at the top of the min-heap; doc id breaks ties so
        // ordering is deterministic
        other
            .0
            .sort_value
            .total_cmp(&self.0.sort_value)
            .then(other.0.doc.0.cmp(&self.0.doc.0))
    }
}

/// Top-K priority queue of matches. Each query carries one or more of
/// these; disk-chunk workers fill clones that merge back into the
/// caller's set.
pub struct MatchSorter {
    limit: usize,
    key: SortKey,
    /// Demanded output attributes, resolved by the executor
    pub select: Vec<String>,
    heap: BinaryHeap<HeapEntry>,
}

impl MatchSorter {
    pub fn new(limit: usize, key: SortKey, select: Vec<String>) -> Self {
        MatchSorter {
            limit: limit.max(1),
            key,
            select,
            heap: BinaryHeap::new(),
        }
    }

    pub fn key(&self) -> &SortKey {
        &self.key
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Same shape, empty heap; for per-worker sorters
    pub fn fresh_clone(&self) -> MatchSorter {
        MatchSorter::new(self.limit, self.key.clone(), self.select.clone())
    }

    pub fn push(&mut self, m: StoredMatch) {
        if self.heap.len() < self.limit {
            self.heap.push(HeapEntry(m));
            return;
        }
        // Reject anything not beating the current worst
        if let Some(worst) = self.heap.peek()
            && m.sort_value > worst.0.sort_value
        {
            self.heap.pop();
            self.heap.push(HeapEntry(m));
        }
    }

    /// Fold a worker's results into this sorter
    pub fn merge(&mut self, other: MatchSorter) {
        for entry in other.heap {
            self.push(entry.0);
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Best first
    pub fn into_sorted(self) -> Vec<StoredMatch> {
        let mut matches: Vec<StoredMatch> = self.heap.into_iter().map(|e| e.0).collect();
        matches.sort_by(|a, b| {
            b.sort_value
                .total_cmp(&a.sort_value)
                .then(a.doc.0.cmp(&b.doc.0))
        });
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(doc: u64, sort_value: f64) -> StoredMatch {
        StoredMatch {
            doc: DocId(doc),
            score: sort_value as f32,
            values: Vec::new(),
            factors: None,
            sort_value,
        }
    }

    #[test]
    fn test_top_k_keeps_best() {
        let mut sorter = MatchSorter::new(2, SortKey::Score, Vec::new());
        sorter.push(entry(1, 1.0));
        sorter.push(entry(2, 5.0));
        sorter.push(entry(3, 3.0));
        let result = sorter.into_sorted();
        let docs: Vec<u64> = result.iter().map(|m| m.doc.0).collect();
        assert_eq!(docs, vec![2, 3]);
    }

    #[test]
    fn test_tie_breaks_by_doc_id() {
        let mut sorter = MatchSorter::new(3, SortKey::Score, Vec::new());
        sorter.push(entry(9, 1.0));
        sorter.push(entry(3, 1.0));
        sorter.push(entry(7, 1.0));
        let docs: Vec<u64> = sorter.into_sorted().iter().map(|m| m.doc.0).collect();
        assert_eq!(docs, vec![3, 7, 9]);
    }

    #[test]
    fn test_merge_worker_results() {
        let mut main = MatchSorter::new(2, SortKey::Score, Vec::new());
        main.push(entry(1, 10.0));
        let mut worker = main.fresh_clone();
        worker.push(entry(2, 20.0));
        worker.push(entry(3, 5.0));
        main.merge(worker);
        let docs: Vec<u64> = main.into_sorted().iter().map(|m| m.doc.0).collect();
        assert_eq!(docs, vec![2, 1]);
    }
}
