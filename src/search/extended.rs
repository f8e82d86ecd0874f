use crate::codec::wordlist::WordKey;
use crate::core::types::{RowId, position_field, position_in_field};
use crate::query::tree::{QueryNode, TermNode};
use crate::search::qword::Qword;
use crate::search::zones::{
    PARAGRAPH_TERM, SENTENCE_TERM, SpanOracle, zone_end_term, zone_start_term,
};
use crate::segment::PostingsView;

/// One matched keyword occurrence attributed to its query position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchHit {
    pub position: u32,
    pub query_pos: u16,
}

/// One candidate document produced by the extended-node tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtMatch {
    pub row_id: RowId,
    pub fields_mask: u32,
    /// Sorted by position
    pub hits: Vec<MatchHit>,
}

/// Forward-only document stream. `advance(target)` positions the stream
/// on the first match with `row_id >= target`; targets never decrease.
pub trait MatchStream {
    fn advance(&mut self, target: RowId) -> Option<&ExtMatch>;
}

/// Term/keyword resolution the executor supplies while building streams:
/// exact word keys plus wildcard expansion against the current view
pub struct BuildContext<'a, 'b> {
    pub view: &'a dyn PostingsView,
    pub resolve: &'b dyn Fn(&str) -> WordKey,
    pub expand: &'b dyn Fn(&TermNode) -> Vec<WordKey>,
    next_query_pos: u16,
}

impl<'a, 'b> BuildContext<'a, 'b> {
    pub fn new(
        view: &'a dyn PostingsView,
        resolve: &'b dyn Fn(&str) -> WordKey,
        expand: &'b dyn Fn(&TermNode) -> Vec<WordKey>,
    ) -> Self {
        BuildContext {
            view,
            resolve,
            expand,
            next_query_pos: 0,
        }
    }

    fn alloc_query_pos(&mut self) -> u16 {
        let pos = self.next_query_pos;
        self.next_query_pos += 1;
        pos
    }

    fn term_stream(&mut self, term: &TermNode) -> Box<dyn MatchStream + 'a> {
        let query_pos = self.alloc_query_pos();
        let keys = (self.expand)(term);
        let qwords: Vec<Qword<'a>> = keys
            .iter()
            .filter_map(|key| Qword::open(self.view, key, query_pos))
            .collect();
        Box::new(MultiTermStream {
            qwords,
            fields: term.fields,
            query_pos,
            current: None,
        })
    }
}

/// Build the evaluation tree for one segment or chunk view
pub fn build_stream<'a>(
    ctx: &mut BuildContext<'a, '_>,
    node: &QueryNode,
) -> Box<dyn MatchStream + 'a> {
    match node {
        QueryNode::Term(term) => ctx.term_stream(term),
        QueryNode::MatchAll => Box::new(MatchAllStream {
            view: ctx.view,
            current: None,
        }),
        QueryNode::And(children) => Box::new(AndStream {
            children: children.iter().map(|c| build_stream(ctx, c)).collect(),
            current: None,
        }),
        QueryNode::Or(children) => Box::new(OrStream {
            children: children.iter().map(|c| build_stream(ctx, c)).collect(),
            current: None,
        }),
        QueryNode::AndNot { include, exclude } => Box::new(AndNotStream {
            include: build_stream(ctx, include),
            exclude: build_stream(ctx, exclude),
            current: None,
        }),
        QueryNode::Maybe { main, boost } => Box::new(MaybeStream {
            main: build_stream(ctx, main),
            boost: build_stream(ctx, boost),
            current: None,
        }),
        QueryNode::Quorum { terms, min_match } => Box::new(QuorumStream {
            children: terms.iter().map(|t| ctx.term_stream(t)).collect(),
            min: (*min_match).max(1) as usize,
            current: None,
        }),
        QueryNode::Phrase(terms) => positional(ctx, terms, PositionalKind::Phrase),
        QueryNode::Proximity { terms, window } => {
            positional(ctx, terms, PositionalKind::Proximity(*window))
        }
        QueryNode::Near { terms, distance } => {
            positional(ctx, terms, PositionalKind::Near(*distance))
        }
        QueryNode::Before(terms) => positional(ctx, terms, PositionalKind::Before),
        QueryNode::Zone { name, node } => {
            let start = (ctx.resolve)(&zone_start_term(name));
            let end = (ctx.resolve)(&zone_end_term(name));
            let oracle = SpanOracle::zone(ctx.view, &start, &end);
            Box::new(SpanStream {
                inner: build_stream(ctx, node),
                oracle,
                same_span: false,
                current: None,
            })
        }
        QueryNode::Sentence(node) => boundary_stream(ctx, node, SENTENCE_TERM),
        QueryNode::Paragraph(node) => boundary_stream(ctx, node, PARAGRAPH_TERM),
    }
}

fn boundary_stream<'a>(
    ctx: &mut BuildContext<'a, '_>,
    node: &QueryNode,
    marker: &str,
) -> Box<dyn MatchStream + 'a> {
    let key = (ctx.resolve)(marker);
    let oracle = SpanOracle::boundary(ctx.view, &key);
    Box::new(SpanStream {
        inner: build_stream(ctx, node),
        oracle,
        same_span: true,
        current: None,
    })
}

fn positional<'a>(
    ctx: &mut BuildContext<'a, '_>,
    terms: &[TermNode],
    kind: PositionalKind,
) -> Box<dyn MatchStream + 'a> {
    Box::new(PositionalStream {
        children: terms.iter().map(|t| ctx.term_stream(t)).collect(),
        kind,
        current: None,
    })
}

// --- leaves ---

/// A keyword leaf, possibly expanded to several dictionary entries that
/// all share one query position
struct MultiTermStream<'a> {
    qwords: Vec<Qword<'a>>,
    fields: Option<u32>,
    query_pos: u16,
    current: Option<ExtMatch>,
}

impl MatchStream for MultiTermStream<'_> {
    fn advance(&mut self, target: RowId) -> Option<&ExtMatch> {
        if let Some(current) = &self.current
            && current.row_id >= target
        {
            return self.current.as_ref();
        }
        let mut target = target;
        loop {
            // Smallest row at or past the target across all expansions
            let mut best: Option<RowId> = None;
            for qword in &mut self.qwords {
                if let Some(entry) = qword.seek(target) {
                    best = Some(best.map_or(entry.row_id, |b: RowId| b.min(entry.row_id)));
                }
            }
            let row = best?;

            let mut fields_mask = 0u32;
            let mut hits: Vec<MatchHit> = Vec::new();
            let mut any_hitless = false;
            for qword in &mut self.qwords {
                let Some(entry) = qword.current() else { continue };
                if entry.row_id != row {
                    continue;
                }
                fields_mask |= entry.fields_mask;
                any_hitless |= !qword.has_hitlist;
                let query_pos = self.query_pos;
                hits.extend(qword.hits().map(|position| MatchHit {
                    position,
                    query_pos,
                }));
            }

            if let Some(restrict) = self.fields {
                if !hits.is_empty() {
                    hits.retain(|h| restrict & (1 << position_field(h.position).min(31)) != 0);
                }
                if fields_mask & restrict == 0 || (hits.is_empty() && !any_hitless) {
                    target = row + 1;
                    continue;
                }
                fields_mask &= restrict;
            }

            hits.sort_unstable_by_key(|h| h.position);
            hits.dedup();
            self.current = Some(ExtMatch {
                row_id: row,
                fields_mask,
                hits,
            });
            return self.current.as_ref();
        }
    }
}

/// Every alive row, no hits (MATCH_ALL)
struct MatchAllStream<'a> {
    view: &'a dyn PostingsView,
    current: Option<ExtMatch>,
}

impl MatchStream for MatchAllStream<'_> {
    fn advance(&mut self, target: RowId) -> Option<&ExtMatch> {
        if let Some(current) = &self.current
            && current.row_id >= target
        {
            return self.current.as_ref();
        }
        let mut row = target;
        while row < self.view.row_count() {
            if !self.view.is_row_dead(row) {
                self.current = Some(ExtMatch {
                    row_id: row,
                    fields_mask: 0,
                    hits: Vec::new(),
                });
                return self.current.as_ref();
            }
            row += 1;
        }
        None
    }
}

// --- combinators ---

struct AndStream<'a> {
    children: Vec<Box<dyn MatchStream + 'a>>,
    current: Option<ExtMatch>,
}

impl MatchStream for AndStream<'_> {
    fn advance(&mut self, target: RowId) -> Option<&ExtMatch> {
        if let Some(current) = &self.current
            && current.row_id >= target
        {
            return self.current.as_ref();
        }
        let mut target = target;
        // Zig-zag to a common row
        loop {
            let mut row = target;
            let mut aligned = true;
            for child in &mut self.children {
                let m = child.advance(row)?;
                if m.row_id > row {
                    row = m.row_id;
                    aligned = false;
                }
            }
            if !aligned {
                target = row;
                continue;
            }

            let mut fields_mask = 0u32;
            let mut hits = Vec::new();
            for child in &mut self.children {
                let m = child.advance(row).expect("aligned child");
                fields_mask |= m.fields_mask;
                hits.extend_from_slice(&m.hits);
            }
            hits.sort_unstable_by_key(|h: &MatchHit| h.position);
            self.current = Some(ExtMatch {
                row_id: row,
                fields_mask,
                hits,
            });
            return self.current.as_ref();
        }
    }
}

struct OrStream<'a> {
    children: Vec<Box<dyn MatchStream + 'a>>,
    current: Option<ExtMatch>,
}

impl MatchStream for OrStream<'_> {
    fn advance(&mut self, target: RowId) -> Option<&ExtMatch> {
        if let Some(current) = &self.current
            && current.row_id >= target
        {
            return self.current.as_ref();
        }
        let mut row: Option<RowId> = None;
        for child in &mut self.children {
            if let Some(m) = child.advance(target) {
                row = Some(row.map_or(m.row_id, |r: RowId| r.min(m.row_id)));
            }
        }
        let row = row?;

        let mut fields_mask = 0u32;
        let mut hits = Vec::new();
        for child in &mut self.children {
            if let Some(m) = child.advance(target)
                && m.row_id == row
            {
                fields_mask |= m.fields_mask;
                hits.extend_from_slice(&m.hits);
            }
        }
        hits.sort_unstable_by_key(|h: &MatchHit| h.position);
        hits.dedup();
        self.current = Some(ExtMatch {
            row_id: row,
            fields_mask,
            hits,
        });
        self.current.as_ref()
    }
}

struct AndNotStream<'a> {
    include: Box<dyn MatchStream + 'a>,
    exclude: Box<dyn MatchStream + 'a>,
    current: Option<ExtMatch>,
}

impl MatchStream for AndNotStream<'_> {
    fn advance(&mut self, target: RowId) -> Option<&ExtMatch> {
        if let Some(current) = &self.current
            && current.row_id >= target
        {
            return self.current.as_ref();
        }
        let mut target = target;
        loop {
            let candidate = self.include.advance(target)?.clone();
            match self.exclude.advance(candidate.row_id) {
                Some(excluded) if excluded.row_id == candidate.row_id => {
                    target = candidate.row_id + 1;
                }
                _ => {
                    self.current = Some(candidate);
                    return self.current.as_ref();
                }
            }
        }
    }
}

struct MaybeStream<'a> {
    main: Box<dyn MatchStream + 'a>,
    boost: Box<dyn MatchStream + 'a>,
    current: Option<ExtMatch>,
}

impl MatchStream for MaybeStream<'_> {
    fn advance(&mut self, target: RowId) -> Option<&ExtMatch> {
        if let Some(current) = &self.current
            && current.row_id >= target
        {
            return self.current.as_ref();
        }
        let mut m = self.main.advance(target)?.clone();
        if let Some(extra) = self.boost.advance(m.row_id)
            && extra.row_id == m.row_id
        {
            m.fields_mask |= extra.fields_mask;
            m.hits.extend_from_slice(&extra.hits);
            m.hits.sort_unstable_by_key(|h| h.position);
            m.hits.dedup();
        }
        self.current = Some(m);
        self.current.as_ref()
    }
}

struct QuorumStream<'a> {
    children: Vec<Box<dyn MatchStream + 'a>>,
    min: usize,
    current: Option<ExtMatch>,
}

impl MatchStream for QuorumStream<'_> {
    fn advance(&mut self, target: RowId) -> Option<&ExtMatch> {
        if let Some(current) = &self.current
            && current.row_id >= target
        {
            return self.current.as_ref();
        }
        let mut target = target;
        loop {
            let mut row: Option<RowId> = None;
            for child in &mut self.children {
                if let Some(m) = child.advance(target) {
                    row = Some(row.map_or(m.row_id, |r: RowId| r.min(m.row_id)));
                }
            }
            let row = row?;

            let mut present = 0usize;
            let mut fields_mask = 0u32;
            let mut hits = Vec::new();
            for child in &mut self.children {
                if let Some(m) = child.advance(target)
                    && m.row_id == row
                {
                    present += 1;
                    fields_mask |= m.fields_mask;
                    hits.extend_from_slice(&m.hits);
                }
            }
            if present < self.min {
                target = row + 1;
                continue;
            }
            hits.sort_unstable_by_key(|h: &MatchHit| h.position);
            self.current = Some(ExtMatch {
                row_id: row,
                fields_mask,
                hits,
            });
            return self.current.as_ref();
        }
    }
}

/// Zone/sentence/paragraph constraint around a sub-stream
struct SpanStream<'a> {
    inner: Box<dyn MatchStream + 'a>,
    oracle: SpanOracle<'a>,
    /// true: all hits must share one span; false: each hit individually
    /// inside some span
    same_span: bool,
    current: Option<ExtMatch>,
}

impl MatchStream for SpanStream<'_> {
    fn advance(&mut self, target: RowId) -> Option<&ExtMatch> {
        if let Some(current) = &self.current
            && current.row_id >= target
        {
            return self.current.as_ref();
        }
        let mut target = target;
        loop {
            let mut m = self.inner.advance(target)?.clone();
            let row = m.row_id;
            if self.same_span {
                let positions: Vec<u32> = m.hits.iter().map(|h| h.position).collect();
                if self.oracle.same_span(row, &positions) {
                    self.current = Some(m);
                    return self.current.as_ref();
                }
            } else {
                m.hits.retain(|h| self.oracle.check(row, h.position));
                if !m.hits.is_empty() {
                    self.current = Some(m);
                    return self.current.as_ref();
                }
            }
            target = row + 1;
        }
    }
}

// --- positional operators ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionalKind {
    /// Adjacent, in order, same field
    Phrase,
    /// All terms in one field within a window of `w + terms - 1`
    /// positions, any order
    Proximity(u32),
    /// In order, each within `d + 1` positions of the previous, same
    /// field
    Near(u32),
    /// In order by packed position, any gap
    Before,
}

struct PositionalStream<'a> {
    children: Vec<Box<dyn MatchStream + 'a>>,
    kind: PositionalKind,
    current: Option<ExtMatch>,
}

impl MatchStream for PositionalStream<'_> {
    fn advance(&mut self, target: RowId) -> Option<&ExtMatch> {
        if let Some(current) = &self.current
            && current.row_id >= target
        {
            return self.current.as_ref();
        }
        let mut target = target;
        'rows: loop {
            // Doc-level AND first
            let mut row = target;
            loop {
                let mut aligned = true;
                for child in &mut self.children {
                    let m = child.advance(row)?;
                    if m.row_id > row {
                        row = m.row_id;
                        aligned = false;
                    }
                }
                if aligned {
                    break;
                }
            }

            let mut per_child: Vec<Vec<u32>> = Vec::with_capacity(self.children.len());
            let mut child_qpos: Vec<u16> = Vec::with_capacity(self.children.len());
            for (i, child) in self.children.iter_mut().enumerate() {
                match child.advance(row) {
                    Some(m) => {
                        per_child.push(m.hits.iter().map(|h| h.position).collect());
                        child_qpos.push(m.hits.first().map_or(i as u16, |h| h.query_pos));
                    }
                    None => {
                        per_child.push(Vec::new());
                        child_qpos.push(i as u16);
                    }
                }
            }

            if let Some(span) = find_span(self.kind, &per_child) {
                let mut fields_mask = 0u32;
                for &pos in &span {
                    fields_mask |= 1 << position_field(pos).min(31);
                }
                let mut hits: Vec<MatchHit> = span
                    .iter()
                    .enumerate()
                    .map(|(i, &position)| MatchHit {
                        position,
                        query_pos: child_qpos[i],
                    })
                    .collect();
                hits.sort_unstable_by_key(|h| h.position);
                self.current = Some(ExtMatch {
                    row_id: row,
                    fields_mask,
                    hits,
                });
                return self.current.as_ref();
            }

            target = row + 1;
            continue 'rows;
        }
    }
}

/// Select one position per term satisfying the operator; returns the
/// chosen positions in term order
pub fn find_span(kind: PositionalKind, per_child: &[Vec<u32>]) -> Option<Vec<u32>> {
    if per_child.iter().any(|p| p.is_empty()) {
        return None;
    }
    match kind {
        PositionalKind::Phrase => {
            for &start in &per_child[0] {
                let field = position_field(start);
                let base = position_in_field(start);
                let ok = per_child.iter().enumerate().skip(1).all(|(i, positions)| {
                    positions.iter().any(|&p| {
                        position_field(p) == field && position_in_field(p) == base + i as u32
                    })
                });
                if ok {
                    let span = per_child
                        .iter()
                        .enumerate()
                        .map(|(i, positions)| {
                            *positions
                                .iter()
                                .find(|&&p| {
                                    position_field(p) == field
                                        && position_in_field(p) == base + i as u32
                                })
                                .expect("checked above")
                        })
                        .collect();
                    return Some(span);
                }
            }
            None
        }
        PositionalKind::Proximity(window) => {
            let k = per_child.len() as u32;
            let limit = window + k.saturating_sub(1);
            // Field-local minimal window over the merged position list
            let mut merged: Vec<(u32, usize)> = Vec::new();
            for (child, positions) in per_child.iter().enumerate() {
                merged.extend(positions.iter().map(|&p| (p, child)));
            }
            merged.sort_unstable();
            let mut counts = vec![0usize; per_child.len()];
            let mut have = 0usize;
            let mut lo = 0usize;
            for hi in 0..merged.len() {
                // Restart the window at field boundaries
                if hi > 0 && position_field(merged[hi].0) != position_field(merged[lo].0) {
                    while lo < hi {
                        let (_, child) = merged[lo];
                        counts[child] -= 1;
                        if counts[child] == 0 {
                            have -= 1;
                        }
                        lo += 1;
                    }
                }
                let (_, child) = merged[hi];
                counts[child] += 1;
                if counts[child] == 1 {
                    have += 1;
                }
                while have == per_child.len() {
                    let width =
                        position_in_field(merged[hi].0) - position_in_field(merged[lo].0) + 1;
                    if width <= limit {
                        // Pick one position per child inside the window
                        let mut span = vec![None; per_child.len()];
                        for &(p, c) in &merged[lo..=hi] {
                            if span[c].is_none() {
                                span[c] = Some(p);
                            }
                        }
                        return span.into_iter().collect();
                    }
                    let (_, child) = merged[lo];
                    counts[child] -= 1;
                    if counts[child] == 0 {
                        have -= 1;
                    }
                    lo += 1;
                }
            }
            None
        }
        PositionalKind::Near(distance) => {
            // Greedy ordered chain within one field
            'starts: for &start in &per_child[0] {
                let field = position_field(start);
                let mut span = vec![start];
                let mut prev = position_in_field(start);
                for positions in &per_child[1..] {
                    let next = positions
                        .iter()
                        .filter(|&&p| position_field(p) == field)
                        .map(|&p| (position_in_field(p), p))
                        .filter(|&(ip, _)| ip > prev && ip - prev <= distance + 1)
                        .min();
                    match next {
                        Some((ip, p)) => {
                            span.push(p);
                            prev = ip;
                        }
                        None => continue 'starts,
                    }
                }
                return Some(span);
            }
            None
        }
        PositionalKind::Before => {
            let mut prev = 0u64;
            let mut span = Vec::with_capacity(per_child.len());
            for positions in per_child {
                let next = positions
                    .iter()
                    .map(|&p| p as u64)
                    .filter(|&p| p > prev)
                    .min();
                match next {
                    Some(p) => {
                        span.push(p as u32);
                        prev = p;
                    }
                    None => return None,
                }
            }
            Some(span)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::pack_position;

    fn p(field: u32, pos: u32) -> u32 {
        pack_position(field, pos)
    }

    #[test]
    fn test_phrase_span() {
        let children = vec![
            vec![p(0, 3), p(1, 9)],
            vec![p(0, 4), p(1, 2)],
            vec![p(0, 5)],
        ];
        let span = find_span(PositionalKind::Phrase, &children).unwrap();
        assert_eq!(span, vec![p(0, 3), p(0, 4), p(0, 5)]);

        let broken = vec![vec![p(0, 3)], vec![p(0, 5)]];
        assert!(find_span(PositionalKind::Phrase, &broken).is_none());
    }

    #[test]
    fn test_phrase_requires_same_field() {
        let children = vec![vec![p(0, 3)], vec![p(1, 4)]];
        assert!(find_span(PositionalKind::Phrase, &children).is_none());
    }

    #[test]
    fn test_proximity_window() {
        let children = vec![vec![p(0, 1)], vec![p(0, 5)]];
        // span width 5, k=2, allowed width = window + 1
        assert!(find_span(PositionalKind::Proximity(4), &children).is_some());
        assert!(find_span(PositionalKind::Proximity(3), &children).is_none());
        // order does not matter
        let reversed = vec![vec![p(0, 5)], vec![p(0, 1)]];
        assert!(find_span(PositionalKind::Proximity(4), &reversed).is_some());
    }

    #[test]
    fn test_near_is_ordered() {
        let children = vec![vec![p(0, 5)], vec![p(0, 1)]];
        assert!(find_span(PositionalKind::Near(10), &children).is_none());
        let ordered = vec![vec![p(0, 1)], vec![p(0, 5)]];
        assert!(find_span(PositionalKind::Near(4), &ordered).is_some());
        assert!(find_span(PositionalKind::Near(2), &ordered).is_none());
    }

    #[test]
    fn test_before_crosses_fields() {
        let children = vec![vec![p(0, 9)], vec![p(2, 1)]];
        assert_eq!(
            find_span(PositionalKind::Before, &children).unwrap(),
            vec![p(0, 9), p(2, 1)]
        );
        let wrong_order = vec![vec![p(2, 1)], vec![p(0, 9)]];
        assert!(find_span(PositionalKind::Before, &wrong_order).is_none());
    }
}
