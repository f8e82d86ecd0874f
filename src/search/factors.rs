use std::collections::HashMap;

use crate::core::types::{position_field, position_in_field, position_is_field_end};
use crate::search::extended::ExtMatch;

/// Per-query, per-view ranking inputs shared by every match
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub num_terms: u16,
    /// Normalized IDF per query position, 0..1
    pub idf: Vec<f32>,
    /// Per-field user weights; fields beyond the vector weigh 1
    pub field_weights: Vec<f32>,
    pub total_docs: u64,
    /// Average hits per document across the view, BM25 length proxy
    pub avg_doc_hits: f32,
}

impl QueryContext {
    pub fn field_weight(&self, field: u32) -> f32 {
        self.field_weights
            .get(field as usize)
            .copied()
            .unwrap_or(1.0)
    }

    pub fn term_idf(&self, query_pos: u16) -> f32 {
        self.idf.get(query_pos as usize).copied().unwrap_or(0.0)
    }
}

/// Normalized IDF: `ln((N - df + 0.5) / (df + 0.5)) / ln(N + 1)`
pub fn normalized_idf(doc_freq: u64, total_docs: u64) -> f32 {
    if doc_freq == 0 || total_docs == 0 {
        return 0.0;
    }
    let n = total_docs as f32;
    let df = doc_freq as f32;
    (((n - df + 0.5) / (df + 0.5)).ln() / (n + 1.0).ln()).max(0.0)
}

/// Per-field ranking factors for one match
#[derive(Debug, Clone, Default)]
pub struct FieldFactors {
    pub field: u32,
    pub hit_count: u32,
    /// Distinct query terms present
    pub word_count: u32,
    /// Longest run of adjacent positions with consecutive query terms
    pub lcs: u32,
    /// In-field position the best LCS run starts at
    pub min_best_span_pos: u32,
    /// Longest common contiguous subsequence by query position
    pub lccs: u32,
    /// IDF-weighted LCCS
    pub wlccs: f32,
    /// Aggregate term closeness
    pub atc: f32,
    /// Minimal gaps in a window covering every present term
    pub min_gaps: u32,
    /// Most hits inside any window of `ATC_WINDOW` positions
    pub max_window_hits: u32,
    pub exact_hit: bool,
    pub exact_order: bool,
    pub sum_idf: f32,
}

/// Doc-level factors plus the per-field breakdown
#[derive(Debug, Clone, Default)]
pub struct DocFactors {
    pub field_mask: u32,
    pub doc_hit_count: u32,
    /// Distinct query terms matched anywhere in the doc
    pub doc_word_count: u32,
    pub bm25: f32,
    pub bm25a: f32,
    pub bm25f: f32,
    pub fields: Vec<FieldFactors>,
}

impl DocFactors {
    pub fn field(&self, field: u32) -> Option<&FieldFactors> {
        self.fields.iter().find(|f| f.field == field)
    }
}

const ATC_WINDOW: u32 = 10;
const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

/// Evaluate every factor for one matched document
pub fn compute_factors(m: &ExtMatch, ctx: &QueryContext) -> DocFactors {
    // Group hits per field, keeping (in-field pos, query pos, end flag)
    let mut by_field: Vec<(u32, Vec<(u32, u16, bool)>)> = Vec::new();
    for hit in &m.hits {
        let field = position_field(hit.position);
        let idx = match by_field.iter().position(|(f, _)| *f == field) {
            Some(idx) => idx,
            None => {
                by_field.push((field, Vec::new()));
                by_field.len() - 1
            }
        };
        by_field[idx].1.push((
            position_in_field(hit.position),
            hit.query_pos,
            position_is_field_end(hit.position),
        ));
    }

    let mut doc = DocFactors {
        field_mask: m.fields_mask,
        doc_hit_count: m.hits.len() as u32,
        ..DocFactors::default()
    };

    // Doc-level term frequencies and the per-field/per-term matrix
    let mut doc_tf: HashMap<u16, u32> = HashMap::new();
    for hit in &m.hits {
        *doc_tf.entry(hit.query_pos).or_insert(0) += 1;
    }
    doc.doc_word_count = doc_tf.len() as u32;

    for (field, mut hits) in by_field {
        hits.sort_unstable();
        doc.fields.push(field_factors(field, &hits, ctx));
    }

    // BM25 family over doc-level term frequencies. The saturation-only
    // form needs no document length; the A and F variants use the match
    // hit count against the view average as the length proxy.
    let dl = doc.doc_hit_count as f32;
    let avgdl = ctx.avg_doc_hits.max(1.0);
    for (&qpos, &tf) in &doc_tf {
        let idf = ctx.term_idf(qpos);
        let tf = tf as f32;
        doc.bm25 += idf * tf / (tf + BM25_K1);
        doc.bm25a += idf * tf * (BM25_K1 + 1.0)
            / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avgdl));
    }
    // BM25F: field-weighted term frequencies folded before saturation
    let mut weighted_tf: HashMap<u16, f32> = HashMap::new();
    for hit in &m.hits {
        let weight = ctx.field_weight(position_field(hit.position));
        *weighted_tf.entry(hit.query_pos).or_insert(0.0) += weight;
    }
    for (&qpos, &tf) in &weighted_tf {
        let idf = ctx.term_idf(qpos);
        doc.bm25f +=
            idf * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avgdl));
    }

    doc
}

/// `hits` sorted by in-field position: (pos, query_pos, field_end)
fn field_factors(field: u32, hits: &[(u32, u16, bool)], ctx: &QueryContext) -> FieldFactors {
    let mut f = FieldFactors {
        field,
        hit_count: hits.len() as u32,
        ..FieldFactors::default()
    };

    let mut present: Vec<u16> = hits.iter().map(|&(_, q, _)| q).collect();
    present.sort_unstable();
    present.dedup();
    f.word_count = present.len() as u32;
    f.sum_idf = present.iter().map(|&q| ctx.term_idf(q)).sum();

    // LCS and its best-span start: runs where both the position and the
    // query position advance by one
    let mut best_run = 0u32;
    let mut best_start = 0u32;
    let mut run = 0u32;
    let mut run_start = 0u32;
    let mut prev: Option<(u32, u16)> = None;
    for &(pos, qpos, _) in hits {
        run = match prev {
            Some((ppos, pq)) if pos == ppos + 1 && qpos == pq + 1 => run + 1,
            _ => {
                run_start = pos;
                1
            }
        };
        if run > best_run {
            best_run = run;
            best_start = run_start;
        }
        prev = Some((pos, qpos));
    }
    f.lcs = best_run;
    f.min_best_span_pos = best_start;

    // LCCS / WLCCS: query positions contiguous, field positions merely
    // ascending
    let mut lccs = 0u32;
    let mut wlccs = 0.0f32;
    let mut chain = 0u32;
    let mut chain_w = 0.0f32;
    let mut prev_q: Option<u16> = None;
    for &(_, qpos, _) in hits {
        match prev_q {
            Some(pq) if qpos == pq + 1 => {
                chain += 1;
                chain_w += ctx.term_idf(qpos);
            }
            Some(pq) if qpos == pq => {}
            _ => {
                chain = 1;
                chain_w = ctx.term_idf(qpos);
            }
        }
        lccs = lccs.max(chain);
        if chain_w > wlccs {
            wlccs = chain_w;
        }
        prev_q = Some(qpos);
    }
    f.lccs = lccs;
    f.wlccs = wlccs;

    // exact_order: present terms occur in query order
    f.exact_order = hits.windows(2).all(|w| w[0].1 <= w[1].1);

    // exact_hit: the query covers the whole field
    f.exact_hit = hits.first().is_some_and(|&(pos, _, _)| pos == 1)
        && hits.iter().any(|&(_, _, end)| end)
        && f.lcs == ctx.num_terms as u32;

    // min_gaps: smallest window containing every present term, minus the
    // hits themselves
    if present.len() > 1 {
        let mut counts: HashMap<u16, u32> = HashMap::new();
        let mut have = 0usize;
        let mut lo = 0usize;
        let mut min_gaps = u32::MAX;
        for hi in 0..hits.len() {
            let q = hits[hi].1;
            let slot = counts.entry(q).or_insert(0);
            *slot += 1;
            if *slot == 1 {
                have += 1;
            }
            while have == present.len() {
                let width = hits[hi].0 - hits[lo].0 + 1;
                min_gaps = min_gaps.min(width - present.len() as u32);
                let lq = hits[lo].1;
                let slot = counts.get_mut(&lq).expect("tracked");
                *slot -= 1;
                if *slot == 0 {
                    have -= 1;
                }
                lo += 1;
            }
        }
        f.min_gaps = if min_gaps == u32::MAX { 0 } else { min_gaps };
    }

    // max_window_hits over a fixed window
    let mut lo = 0usize;
    for hi in 0..hits.len() {
        while hits[hi].0 - hits[lo].0 >= ATC_WINDOW {
            lo += 1;
        }
        f.max_window_hits = f.max_window_hits.max((hi - lo + 1) as u32);
    }

    // ATC: distance-weighted IDF closeness inside the window
    let mut atc_sum = 0.0f32;
    for (i, &(pos_i, q_i, _)) in hits.iter().enumerate() {
        let mut closeness = 0.0f32;
        for (j, &(pos_j, q_j, _)) in hits.iter().enumerate() {
            if i == j {
                continue;
            }
            let dist = pos_i.abs_diff(pos_j);
            if dist < ATC_WINDOW {
                closeness += ctx.term_idf(q_j) / (1.0 + dist as f32);
            }
        }
        atc_sum += ctx.term_idf(q_i) * closeness;
    }
    f.atc = (1.0 + atc_sum).ln();

    f
}

/// Pack the factors into the blob surfaced per match by the export
/// ranker. Layout, little-endian u32 cells:
///   [field_mask, doc_hit_count, doc_word_count, bm25, bm25a, bm25f,
///    field_count, then per field:
///    field, hit_count, word_count, lcs, lccs, min_gaps, max_window_hits,
///    min_best_span_pos, flags(bit0 exact_hit, bit1 exact_order),
///    wlccs, atc, sum_idf]
/// Float cells carry `f32::to_bits`.
pub fn pack_factors(doc: &DocFactors) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 * (7 + doc.fields.len() * 12));
    let mut push = |v: u32| out.extend_from_slice(&v.to_le_bytes());
    push(doc.field_mask);
    push(doc.doc_hit_count);
    push(doc.doc_word_count);
    push(doc.bm25.to_bits());
    push(doc.bm25a.to_bits());
    push(doc.bm25f.to_bits());
    push(doc.fields.len() as u32);
    for f in &doc.fields {
        push(f.field);
        push(f.hit_count);
        push(f.word_count);
        push(f.lcs);
        push(f.lccs);
        push(f.min_gaps);
        push(f.max_window_hits);
        push(f.min_best_span_pos);
        push(f.exact_hit as u32 | ((f.exact_order as u32) << 1));
        push(f.wlccs.to_bits());
        push(f.atc.to_bits());
        push(f.sum_idf.to_bits());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{pack_position, position_set_field_end};
    use crate::search::extended::MatchHit;

    fn ctx(num_terms: u16) -> QueryContext {
        QueryContext {
            num_terms,
            idf: vec![0.5; num_terms as usize],
            field_weights: vec![1.0, 2.0],
            total_docs: 100,
            avg_doc_hits: 4.0,
        }
    }

    fn hit(field: u32, pos: u32, qpos: u16) -> MatchHit {
        MatchHit {
            position: pack_position(field, pos),
            query_pos: qpos,
        }
    }

    #[test]
    fn test_lcs_counts_adjacent_runs() {
        let m = ExtMatch {
            row_id: 0,
            fields_mask: 1,
            hits: vec![hit(0, 3, 0), hit(0, 4, 1), hit(0, 9, 0)],
        };
        let doc = compute_factors(&m, &ctx(2));
        let field = doc.field(0).unwrap();
        assert_eq!(field.lcs, 2);
        assert_eq!(field.min_best_span_pos, 3);
        assert_eq!(field.word_count, 2);
        assert_eq!(field.hit_count, 3);
        assert!(doc.bm25 > 0.0);
    }

    #[test]
    fn test_exact_hit_needs_full_cover() {
        let mut end_hit = hit(0, 2, 1);
        end_hit.position = position_set_field_end(end_hit.position);
        let m = ExtMatch {
            row_id: 0,
            fields_mask: 1,
            hits: vec![hit(0, 1, 0), end_hit],
        };
        let doc = compute_factors(&m, &ctx(2));
        assert!(doc.field(0).unwrap().exact_hit);

        // Same match with three query terms cannot be exact
        let doc = compute_factors(&m, &ctx(3));
        assert!(!doc.field(0).unwrap().exact_hit);
    }

    #[test]
    fn test_exact_order() {
        let ordered = ExtMatch {
            row_id: 0,
            fields_mask: 1,
            hits: vec![hit(0, 1, 0), hit(0, 5, 1)],
        };
        assert!(compute_factors(&ordered, &ctx(2)).field(0).unwrap().exact_order);

        let reversed = ExtMatch {
            row_id: 0,
            fields_mask: 1,
            hits: vec![hit(0, 1, 1), hit(0, 5, 0)],
        };
        assert!(!compute_factors(&reversed, &ctx(2)).field(0).unwrap().exact_order);
    }

    #[test]
    fn test_min_gaps() {
        let m = ExtMatch {
            row_id: 0,
            fields_mask: 1,
            hits: vec![hit(0, 1, 0), hit(0, 4, 1)],
        };
        // window [1..4] holds 2 hits over width 4: two gap positions
        assert_eq!(compute_factors(&m, &ctx(2)).field(0).unwrap().min_gaps, 2);
    }

    #[test]
    fn test_pack_factors_layout() {
        let m = ExtMatch {
            row_id: 0,
            fields_mask: 1,
            hits: vec![hit(0, 1, 0)],
        };
        let doc = compute_factors(&m, &ctx(1));
        let blob = pack_factors(&doc);
        assert_eq!(blob.len(), 4 * (7 + 12));
        let field_mask = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
        assert_eq!(field_mask, 1);
    }
}
