use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::wordlist::WordKey;
use crate::core::types::RowId;
use crate::search::qword::Qword;
use crate::segment::PostingsView;

/// Reserved marker keywords. Tokenizers that support zones and sentence
/// boundaries emit these as ordinary hits around the wrapped content.
pub fn zone_start_term(name: &str) -> String {
    format!("__zone_{name}")
}

pub fn zone_end_term(name: &str) -> String {
    format!("__endzone_{name}")
}

pub const SENTENCE_TERM: &str = "__sent";
pub const PARAGRAPH_TERM: &str = "__para";

enum SpanSource<'a> {
    /// Paired start/end markers
    Zone {
        start: Option<Qword<'a>>,
        end: Option<Qword<'a>>,
    },
    /// Single boundary marker partitioning the position space
    Boundary { marker: Option<Qword<'a>> },
}

/// Lazily answers "is this hit inside the span" per document by
/// streaming the marker posting lists and pairing them with a simple
/// state machine. Spans are cached per row; rows must arrive ascending,
/// which the extended-node iteration guarantees.
pub struct SpanOracle<'a> {
    source: SpanSource<'a>,
    cache: HashMap<RowId, Arc<Vec<(u32, u32)>>>,
}

impl<'a> SpanOracle<'a> {
    pub fn zone(view: &'a dyn PostingsView, start_key: &WordKey, end_key: &WordKey) -> Self {
        SpanOracle {
            source: SpanSource::Zone {
                start: Qword::open(view, start_key, 0),
                end: Qword::open(view, end_key, 0),
            },
            cache: HashMap::new(),
        }
    }

    pub fn boundary(view: &'a dyn PostingsView, marker_key: &WordKey) -> Self {
        SpanOracle {
            source: SpanSource::Boundary {
                marker: Qword::open(view, marker_key, 0),
            },
            cache: HashMap::new(),
        }
    }

    fn spans(&mut self, row: RowId) -> Arc<Vec<(u32, u32)>> {
        if let Some(cached) = self.cache.get(&row) {
            return Arc::clone(cached);
        }
        let spans = Arc::new(match &mut self.source {
            SpanSource::Zone { start, end } => {
                let starts = positions_at(start, row);
                let ends = positions_at(end, row);
                pair_spans(&starts, &ends)
            }
            SpanSource::Boundary { marker } => {
                let boundaries = positions_at(marker, row);
                partition_spans(&boundaries)
            }
        });
        self.cache.insert(row, Arc::clone(&spans));
        spans
    }

    /// Is the hit position inside any span of this document
    pub fn check(&mut self, row: RowId, pos: u32) -> bool {
        self.spans(row).iter().any(|&(lo, hi)| lo <= pos && pos <= hi)
    }

    /// Do all positions share one span (sentence/paragraph constraint)
    pub fn same_span(&mut self, row: RowId, positions: &[u32]) -> bool {
        if positions.is_empty() {
            return true;
        }
        self.spans(row)
            .iter()
            .any(|&(lo, hi)| positions.iter().all(|&p| lo <= p && p <= hi))
    }
}

fn positions_at(qword: &mut Option<Qword<'_>>, row: RowId) -> Vec<u32> {
    let Some(qword) = qword.as_mut() else {
        return Vec::new();
    };
    let at_row = matches!(qword.seek(row), Some(entry) if entry.row_id == row);
    if at_row {
        qword.hits().collect()
    } else {
        Vec::new()
    }
}

/// Pair start and end markers in position order
fn pair_spans(starts: &[u32], ends: &[u32]) -> Vec<(u32, u32)> {
    let mut spans = Vec::new();
    let mut open: Vec<u32> = Vec::new();
    let (mut si, mut ei) = (0usize, 0usize);
    while si < starts.len() || ei < ends.len() {
        let take_start = match (starts.get(si), ends.get(ei)) {
            (Some(&s), Some(&e)) => s < e,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if take_start {
            open.push(starts[si]);
            si += 1;
        } else {
            if let Some(start) = open.pop() {
                spans.push((start, ends[ei]));
            }
            ei += 1;
        }
    }
    spans.sort_unstable();
    spans
}

/// Boundary markers split the position space into maximal marker-free
/// spans
fn partition_spans(boundaries: &[u32]) -> Vec<(u32, u32)> {
    let mut spans = Vec::with_capacity(boundaries.len() + 1);
    let mut lo = 0u32;
    for &b in boundaries {
        if b > lo {
            spans.push((lo, b - 1));
        }
        lo = b + 1;
    }
    spans.push((lo, u32::MAX));
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_spans_nested_and_sequential() {
        // <a> 1..4 </a> <a> 6..9 </a>
        assert_eq!(pair_spans(&[1, 6], &[4, 9]), vec![(1, 4), (6, 9)]);
        // nested: outer 1..10, inner 3..5
        assert_eq!(pair_spans(&[1, 3], &[5, 10]), vec![(1, 10), (3, 5)]);
        // unbalanced start is dropped
        assert_eq!(pair_spans(&[1, 6], &[4]), vec![(1, 4)]);
    }

    #[test]
    fn test_partition_spans() {
        let spans = partition_spans(&[5, 9]);
        assert_eq!(spans, vec![(0, 4), (6, 8), (10, u32::MAX)]);
        assert_eq!(partition_spans(&[]), vec![(0, u32::MAX)]);
    }
}
