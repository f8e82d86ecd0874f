use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use log::debug;
use rayon::prelude::*;

use crate::analysis::Dictionary;
use crate::codec::wordlist::WordKey;
use crate::core::config::{DictMode, RtSettings};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::globals::StopSignal;
use crate::core::types::{AttrType, AttrValue, RowId, Schema};
use crate::dataset::DatasetSnapshot;
use crate::query::tree::{QueryNode, TermExpand, TermNode};
use crate::search::expansion::{expand_infix, expand_prefix};
use crate::search::extended::{BuildContext, build_stream};
use crate::search::factors::{QueryContext, normalized_idf};
use crate::search::qword::lookup_word;
use crate::search::ranker::{Ranker, RankerKind, ScoredMatch};
use crate::search::sorter::{MatchSorter, SortKey, StoredMatch};
use crate::segment::PostingsView;

/// Attribute filter over candidate matches
#[derive(Debug, Clone)]
pub struct QueryFilter {
    pub attr: String,
    pub op: FilterOp,
    pub exclude: bool,
}

#[derive(Debug, Clone)]
pub enum FilterOp {
    Equals(u64),
    Range { min: u64, max: u64 },
    In(Vec<u64>),
}

/// Everything a `multi_query` call carries besides the tree and sorters
#[derive(Debug, Clone)]
pub struct QueryArgs {
    pub ranker: RankerKind,
    pub filters: Vec<QueryFilter>,
    /// Stop collecting after this many matches per view; 0 disables
    pub cutoff: u64,
    pub max_query_time_ms: Option<u64>,
    /// Restrict to these disk chunks (RAM layer always included)
    pub from_chunks: Option<Vec<u32>>,
    pub field_weights: Vec<f32>,
}

impl Default for QueryArgs {
    fn default() -> Self {
        QueryArgs {
            ranker: RankerKind::ProximityBm25,
            filters: Vec::new(),
            cutoff: 0,
            max_query_time_ms: None,
            from_chunks: None,
            field_weights: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct KeywordStats {
    pub term: String,
    pub docs: u64,
    pub hits: u64,
}

/// Result meta surfaced to the caller after a query
#[derive(Debug, Clone, Default)]
pub struct QueryMeta {
    pub query_time_ms: u64,
    pub cpu_time_us: u64,
    pub matches_returned: u64,
    pub total_matches: u64,
    pub warning: Option<String>,
    pub per_keyword: Vec<KeywordStats>,
}

/// Ranked keyword search across the whole snapshot: disk chunks run on
/// the bounded worker pool with per-worker sorters, the RAM layer runs
/// on the calling thread, and everything merges into the caller's
/// sorters.
pub fn multi_query(
    snapshot: &DatasetSnapshot,
    schema: &Schema,
    settings: &RtSettings,
    dict: &dyn Dictionary,
    tree: &QueryNode,
    args: &QueryArgs,
    sorters: &mut [MatchSorter],
) -> Result<QueryMeta> {
    let started = Instant::now();
    let stop = StopSignal::default();
    let total = AtomicU64::new(0);
    let timed_out = std::sync::atomic::AtomicBool::new(false);
    let terms = tree.collect_terms();

    let chunks: Vec<_> = match &args.from_chunks {
        Some(ids) => snapshot
            .chunks
            .iter()
            .filter(|c| ids.contains(&c.id()))
            .cloned()
            .collect(),
        None => snapshot.chunks.to_vec(),
    };

    // Disk chunks in parallel, each worker with its own sorter set
    let worker_results: Vec<Result<(Vec<MatchSorter>, Vec<KeywordStats>)>> = chunks
        .par_iter()
        .map(|chunk| {
            let mut local: Vec<MatchSorter> = sorters.iter().map(|s| s.fresh_clone()).collect();
            let stats = run_view(
                chunk.as_ref(),
                schema,
                settings,
                dict,
                tree,
                &terms,
                args,
                &mut local,
                &stop,
                &total,
                &timed_out,
                started,
            )?;
            Ok((local, stats))
        })
        .collect();

    let mut keyword_stats: Vec<KeywordStats> = terms
        .iter()
        .map(|t| KeywordStats {
            term: t.word.clone(),
            ..KeywordStats::default()
        })
        .collect();
    for result in worker_results {
        let (locals, stats) = result?;
        for (sorter, local) in sorters.iter_mut().zip(locals) {
            sorter.merge(local);
        }
        merge_keyword_stats(&mut keyword_stats, &stats);
    }

    // RAM segments, oldest first, on the calling thread. An explicit
    // chunk restriction addresses the disk layer only.
    let ram_segments: &[_] = if args.from_chunks.is_some() {
        &[]
    } else {
        &snapshot.segments[..]
    };
    for segment in ram_segments.iter() {
        let stats = run_view(
            segment.as_ref(),
            schema,
            settings,
            dict,
            tree,
            &terms,
            args,
            sorters,
            &stop,
            &total,
            &timed_out,
            started,
        )?;
        merge_keyword_stats(&mut keyword_stats, &stats);
    }

    let meta = QueryMeta {
        query_time_ms: started.elapsed().as_millis() as u64,
        cpu_time_us: started.elapsed().as_micros() as u64,
        matches_returned: sorters.iter().map(|s| s.len() as u64).max().unwrap_or(0),
        total_matches: total.load(Ordering::Relaxed),
        warning: timed_out
            .load(Ordering::Relaxed)
            .then(|| "query time exceeded, partial results returned".to_string()),
        per_keyword: keyword_stats,
    };
    debug!(
        "query: {} total matches in {}ms",
        meta.total_matches, meta.query_time_ms
    );
    Ok(meta)
}

fn merge_keyword_stats(into: &mut [KeywordStats], from: &[KeywordStats]) {
    for (dst, src) in into.iter_mut().zip(from) {
        dst.docs += src.docs;
        dst.hits += src.hits;
    }
}

/// Per-term doc/hit statistics for `get_keywords`
pub fn keyword_stats(
    snapshot: &DatasetSnapshot,
    settings: &RtSettings,
    dict: &dyn Dictionary,
    terms: &[TermNode],
) -> Vec<KeywordStats> {
    let mut stats: Vec<KeywordStats> = terms
        .iter()
        .map(|t| KeywordStats {
            term: t.word.clone(),
            ..KeywordStats::default()
        })
        .collect();
    let views: Vec<&dyn PostingsView> = snapshot
        .chunks
        .iter()
        .map(|c| c.as_ref() as &dyn PostingsView)
        .chain(snapshot.segments.iter().map(|s| s.as_ref() as _))
        .collect();
    for view in views {
        for (term, stat) in terms.iter().zip(stats.iter_mut()) {
            for key in expand_term(view, settings, dict, term) {
                if let Some(entry) = lookup_word(view, &key) {
                    stat.docs += entry.doc_count as u64;
                    stat.hits += entry.hit_count;
                }
            }
        }
    }
    stats
}

/// Resolve one term to its dictionary keys in this view, applying
/// wildcard expansion with the per-segment cap
pub fn expand_term(
    view: &dyn PostingsView,
    settings: &RtSettings,
    dict: &dyn Dictionary,
    term: &TermNode,
) -> Vec<WordKey> {
    let word = term.word.as_bytes();
    match (term.expand, settings.dict_mode) {
        (TermExpand::Exact, DictMode::Crc) => vec![WordKey::Id(dict.word_id(word))],
        (TermExpand::Exact, DictMode::Keywords) => vec![WordKey::Keyword(word.to_vec())],
        // Wildcards need keyword bytes in the dictionary
        (_, DictMode::Crc) => vec![WordKey::Id(dict.word_id(word))],
        (TermExpand::Prefix, DictMode::Keywords) => {
            if (word.len() as u32) < settings.min_prefix_len.max(1) {
                return Vec::new();
            }
            expand_prefix(view, word, settings.expansion_limit)
        }
        (TermExpand::Infix, DictMode::Keywords) => {
            if (word.len() as u32) < settings.min_infix_len.max(1) {
                return Vec::new();
            }
            expand_infix(view, word, settings.expansion_limit)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_view(
    view: &dyn PostingsView,
    schema: &Schema,
    settings: &RtSettings,
    dict: &dyn Dictionary,
    tree: &QueryNode,
    terms: &[TermNode],
    args: &QueryArgs,
    sorters: &mut [MatchSorter],
    stop: &StopSignal,
    total: &AtomicU64,
    timed_out: &std::sync::atomic::AtomicBool,
    started: Instant,
) -> Result<Vec<KeywordStats>> {
    // Per-term statistics drive both IDF and the result meta
    let mut stats: Vec<KeywordStats> = Vec::with_capacity(terms.len());
    let mut idf = Vec::with_capacity(terms.len());
    let alive = view.alive_rows() as u64;
    for term in terms {
        let mut stat = KeywordStats {
            term: term.word.clone(),
            ..KeywordStats::default()
        };
        for key in expand_term(view, settings, dict, term) {
            if let Some(entry) = lookup_word(view, &key) {
                stat.docs += entry.doc_count as u64;
                stat.hits += entry.hit_count;
            }
        }
        idf.push(normalized_idf(stat.docs.min(alive), alive));
        stats.push(stat);
    }

    let row_count = view.row_count().max(1) as f32;
    let ctx = QueryContext {
        num_terms: terms.len() as u16,
        idf,
        field_weights: args.field_weights.clone(),
        total_docs: alive,
        avg_doc_hits: view.total_hits() as f32 / row_count,
    };

    let resolve = |word: &str| -> WordKey {
        match settings.dict_mode {
            DictMode::Crc => WordKey::Id(dict.word_id(word.as_bytes())),
            DictMode::Keywords => WordKey::Keyword(word.as_bytes().to_vec()),
        }
    };
    let expand = |term: &TermNode| expand_term(view, settings, dict, term);
    let mut build_ctx = BuildContext::new(view, &resolve, &expand);
    let root = build_stream(&mut build_ctx, tree);
    let mut ranker = Ranker::new(root, ctx, args.ranker.clone(), None)?;

    let resolved_filters = resolve_filters(schema, &args.filters)?;
    let resolved_selects: Vec<Vec<usize>> = sorters
        .iter()
        .map(|s| {
            s.select
                .iter()
                .filter_map(|name| schema.attr_index(name))
                .collect()
        })
        .collect();

    let mut block: Vec<ScoredMatch> = Vec::with_capacity(crate::search::ranker::MAX_BLOCK_DOCS);
    loop {
        // Timeout and cancellation are polled at block boundaries
        if stop.is_stopped() {
            break;
        }
        if let Some(limit) = args.max_query_time_ms
            && started.elapsed().as_millis() as u64 > limit
        {
            timed_out.store(true, Ordering::Release);
            stop.send();
            break;
        }
        if ranker.get_matches(&mut block) == 0 {
            break;
        }

        let attrs = view.attrs().read();
        for m in &block {
            if view.is_row_dead(m.row_id) {
                continue;
            }
            if !passes_filters(schema, &attrs, &resolved_filters, m.row_id, view) {
                continue;
            }
            total.fetch_add(1, Ordering::Relaxed);

            let doc = attrs.docid(m.row_id);
            for (sorter, select) in sorters.iter_mut().zip(&resolved_selects) {
                let values: Vec<AttrValue> = select
                    .iter()
                    .map(|&idx| read_attr_value(schema, view, &attrs, m.row_id, idx))
                    .collect();
                let sort_value = match sorter.key() {
                    SortKey::Score => m.score as f64,
                    SortKey::Attr { name, ascending } => {
                        let raw = schema
                            .attr_index(name)
                            .map(|idx| read_attr_numeric(schema, view, &attrs, m.row_id, idx))
                            .unwrap_or(0.0);
                        if *ascending { -raw } else { raw }
                    }
                };
                sorter.push(StoredMatch {
                    doc,
                    score: m.score,
                    values,
                    factors: m.factors.clone(),
                    sort_value,
                });
            }
        }
        drop(attrs);

        if args.cutoff > 0 && total.load(Ordering::Relaxed) >= args.cutoff {
            break;
        }
    }
    Ok(stats)
}

struct ResolvedFilter {
    attr_idx: usize,
    op: FilterOp,
    exclude: bool,
}

fn resolve_filters(schema: &Schema, filters: &[QueryFilter]) -> Result<Vec<ResolvedFilter>> {
    filters
        .iter()
        .map(|f| {
            let attr_idx = schema.attr_index(&f.attr).ok_or_else(|| {
                Error::new(
                    ErrorKind::NotFound,
                    format!("unknown filter attribute '{}'", f.attr),
                )
            })?;
            Ok(ResolvedFilter {
                attr_idx,
                op: f.op.clone(),
                exclude: f.exclude,
            })
        })
        .collect()
}

fn passes_filters(
    schema: &Schema,
    attrs: &crate::segment::AttrStore,
    filters: &[ResolvedFilter],
    row: RowId,
    view: &dyn PostingsView,
) -> bool {
    filters.iter().all(|f| {
        let matched = filter_values(schema, view, attrs, f.attr_idx, row)
            .iter()
            .any(|&v| match &f.op {
                FilterOp::Equals(target) => v == *target,
                FilterOp::Range { min, max } => *min <= v && v <= *max,
                FilterOp::In(set) => set.contains(&v),
            });
        matched != f.exclude
    })
}

/// The attribute's value(s) as u64; multi-value attributes contribute
/// every element, non-numeric attributes never match
fn filter_values(
    schema: &Schema,
    view: &dyn PostingsView,
    attrs: &crate::segment::AttrStore,
    attr_idx: usize,
    row: RowId,
) -> Vec<u64> {
    match read_attr_value(schema, view, attrs, row, attr_idx) {
        AttrValue::Uint(v) => vec![v as u64],
        AttrValue::Bigint(v) => vec![v],
        AttrValue::Bool(v) => vec![v as u64],
        AttrValue::Float(v) => vec![v as u64],
        AttrValue::MultiUint(values) => values.into_iter().map(|v| v as u64).collect(),
        AttrValue::MultiBigint(values) => values,
        AttrValue::None | AttrValue::String(_) | AttrValue::Json(_) => Vec::new(),
    }
}

fn read_attr_numeric(
    schema: &Schema,
    view: &dyn PostingsView,
    attrs: &crate::segment::AttrStore,
    row: RowId,
    attr_idx: usize,
) -> f64 {
    match read_attr_value(schema, view, attrs, row, attr_idx) {
        AttrValue::Uint(v) => v as f64,
        AttrValue::Bigint(v) => v as f64,
        AttrValue::Float(v) => v as f64,
        AttrValue::Bool(v) => v as u8 as f64,
        _ => 0.0,
    }
}

/// Owned copy of one attribute value; blob payloads are copied out so
/// results stay valid after the snapshot is gone
pub fn read_attr_value(
    schema: &Schema,
    view: &dyn PostingsView,
    attrs: &crate::segment::AttrStore,
    row: RowId,
    attr_idx: usize,
) -> AttrValue {
    let attr = &schema.attrs[attr_idx];
    if attr.columnar {
        let column = schema
            .attrs
            .iter()
            .take(attr_idx)
            .filter(|a| a.columnar)
            .count();
        let raw = view.columnar()[column].get(row);
        return match attr.ty {
            AttrType::Float => AttrValue::Float(f32::from_bits(raw as u32)),
            AttrType::Bool => AttrValue::Bool(raw != 0),
            AttrType::Uint => AttrValue::Uint(raw as u32),
            _ => AttrValue::Bigint(raw),
        };
    }
    let offset = schema.attr_offset(attr_idx);
    match attr.ty {
        AttrType::Uint => AttrValue::Uint(attrs.row(row)[offset]),
        AttrType::Bigint => AttrValue::Bigint(attrs.get_u64(row, offset)),
        AttrType::Float => AttrValue::Float(f32::from_bits(attrs.row(row)[offset])),
        AttrType::Bool => AttrValue::Bool(attrs.row(row)[offset] != 0),
        AttrType::String => {
            let blob = attrs.get_u64(row, offset);
            AttrValue::String(attrs.blobs.get_string(blob).unwrap_or_default().to_string())
        }
        AttrType::Json => {
            let blob = attrs.get_u64(row, offset);
            AttrValue::Json(
                attrs
                    .blobs
                    .get_json(blob)
                    .unwrap_or(serde_json::Value::Null),
            )
        }
        AttrType::MultiUint => {
            let blob = attrs.get_u64(row, offset);
            AttrValue::MultiUint(attrs.blobs.get_mva_u32(blob).unwrap_or_default())
        }
        AttrType::MultiBigint => {
            let blob = attrs.get_u64(row, offset);
            AttrValue::MultiBigint(attrs.blobs.get_mva_u64(blob).unwrap_or_default())
        }
    }
}
