use std::sync::Arc;

use log::{debug, warn};

use crate::codec::doclist::{DocEntry, DoclistReader, DoclistWriter, HitRef};
use crate::codec::hitlist::{HitlistReader, HitlistWriter};
use crate::codec::wordlist::{WordEntry, WordlistWriter, iter_words};
use crate::core::config::RtSettings;
use crate::core::error::Result;
use crate::core::types::{INVALID_ROWID, RowId, Schema, read_u64_cells, write_u64_cells};
use crate::index::rt_index::IndexInner;
use crate::merge::chunk_saver;
use crate::segment::blob::BlobPool;
use crate::segment::columnar::{ColumnarBuilder, SimpleColumnarBuilder};
use crate::segment::deadmap::DeadRowMap;
use crate::segment::docstore::DocStore;
use crate::segment::infix_bloom::build_infix_bloom;
use crate::segment::ram_segment::{RamSegment, SegmentParts};
use crate::segment::{KillHook, PostingsView};
use crate::update::engine::{apply_batch_to_view, resolve_batch};

/// Outcome of one merge-policy evaluation over the unlocked RAM segments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// RAM layer over budget: promote it to a disk chunk
    Flush,
    NoMerge,
    /// Merge these two candidates (indexes into the candidate list)
    Merge(usize, usize),
}

/// Merge policy. `rows[i]` is the row count of unlocked candidate `i`.
pub fn decide_merge(
    rows: &[u32],
    ram_bytes: i64,
    ram_budget: i64,
    max_segments: usize,
    max_progression: usize,
) -> MergeDecision {
    if ram_bytes > ram_budget {
        return MergeDecision::Flush;
    }
    let count = rows.len();
    if count <= max_segments.saturating_sub(max_progression) {
        return MergeDecision::NoMerge;
    }

    // Two smallest by row count
    let mut smallest = usize::MAX;
    let mut second = usize::MAX;
    for (idx, &r) in rows.iter().enumerate() {
        if smallest == usize::MAX || r < rows[smallest] {
            second = smallest;
            smallest = idx;
        } else if second == usize::MAX || r < rows[second] {
            second = idx;
        }
    }
    if second == usize::MAX {
        return MergeDecision::NoMerge;
    }

    // Wildly uneven candidates are left to grow unless the segment cap
    // forces the issue
    if count < max_segments && rows[second] > rows[smallest].saturating_mul(2) {
        return MergeDecision::NoMerge;
    }
    MergeDecision::Merge(smallest, second)
}

/// Build one segment out of several source views, rows copied in source
/// order (A first, then B) so kill-list chronology is preserved.
pub fn merge_segment_views(
    sources: &[&dyn PostingsView],
    schema: &Schema,
    settings: &RtSettings,
) -> Result<Option<SegmentParts>> {
    let stride = schema.stride();
    let blob_attrs: Vec<usize> = schema
        .attrs
        .iter()
        .enumerate()
        .filter(|(_, a)| a.ty.is_blob() && !a.columnar)
        .map(|(i, _)| schema.attr_offset(i))
        .collect();
    let columnar_count = schema.attrs.iter().filter(|a| a.columnar).count();

    // Copy alive rows source by source, assigning fresh row ids
    let mut row_maps: Vec<Vec<RowId>> = sources
        .iter()
        .map(|s| vec![INVALID_ROWID; s.row_count() as usize])
        .collect();
    let mut rows = Vec::new();
    let mut blobs = BlobPool::new();
    let mut columnar_builders: Vec<Box<SimpleColumnarBuilder>> = (0..columnar_count)
        .map(|_| Box::new(SimpleColumnarBuilder::new()))
        .collect();
    let keep_docstore =
        settings.stored_fields && sources.iter().all(|s| s.docstore().is_some());
    let mut docstore = keep_docstore.then(|| DocStore::new(settings.docstore_compression));
    let mut next_row = 0u32;

    for (source_idx, source) in sources.iter().enumerate() {
        let attrs = source.attrs().read();
        for old_row in 0..source.row_count() {
            if source.is_row_dead(old_row) {
                continue;
            }
            row_maps[source_idx][old_row as usize] = next_row;
            next_row += 1;

            let row_start = rows.len();
            rows.extend_from_slice(attrs.row(old_row));
            for &cell_offset in &blob_attrs {
                let old_offset = read_u64_cells(&rows[row_start..], cell_offset);
                let new_offset = blobs.copy_from(&attrs.blobs, old_offset);
                write_u64_cells(&mut rows[row_start..], cell_offset, new_offset);
            }
            for (column, builder) in columnar_builders.iter_mut().enumerate() {
                builder.push(source.columnar()[column].get(old_row));
            }
            if let Some(store) = docstore.as_mut()
                && let Some(src_store) = source.docstore()
            {
                store.append_from(src_store, old_row)?;
            }
        }
    }
    if next_row == 0 {
        return Ok(None);
    }

    // Lockstep wordlist walk; surviving doc entries concatenate in source
    // order, which keeps the fresh row ids ascending
    let dict_mode = settings.dict_mode;
    let mut readers: Vec<_> = sources
        .iter()
        .map(|s| iter_words(s.words(), s.checkpoints(), dict_mode).peekable())
        .collect();
    let mut words_out = Vec::new();
    let mut docs_out = Vec::new();
    let mut hits_out = Vec::new();
    let mut wordlist = WordlistWriter::new(dict_mode, settings.checkpoint_interval);
    let mut doclist = DoclistWriter::new();
    let mut hitlist = HitlistWriter::new();
    let mut total_hits = 0u64;

    loop {
        let Some(min_key) = readers
            .iter_mut()
            .filter_map(|r| r.peek().map(|e| e.key.clone()))
            .min()
        else {
            break;
        };

        let doclist_offset = docs_out.len() as u64;
        doclist.restart();
        let mut word_doc_count = 0u32;
        let mut word_hit_count = 0u64;
        let mut has_hitlist = true;

        for (source_idx, reader) in readers.iter_mut().enumerate() {
            if reader.peek().map(|e| &e.key) != Some(&min_key) {
                continue;
            }
            let entry = reader.next().expect("peeked entry");
            has_hitlist &= entry.has_hitlist;
            let source = sources[source_idx];
            for doc in
                DoclistReader::new(source.docs(), entry.doclist_offset as usize, entry.doc_count)
            {
                let new_row = row_maps[source_idx][doc.row_id as usize];
                if new_row == INVALID_ROWID {
                    continue;
                }
                let (hit_ref, hit_count) = match doc.hit_ref {
                    HitRef::Inline(pos) => (HitRef::Inline(pos), 1),
                    HitRef::Offset(offset) if doc.hit_count > 0 => {
                        let new_offset = hits_out.len() as u64;
                        for pos in HitlistReader::new(source.hits(), offset as usize) {
                            hitlist.push(&mut hits_out, pos);
                        }
                        hitlist.finish_doc(&mut hits_out);
                        (HitRef::Offset(new_offset), doc.hit_count)
                    }
                    HitRef::Offset(_) => (HitRef::Offset(0), doc.hit_count),
                };
                doclist.push(
                    &mut docs_out,
                    &DocEntry {
                        row_id: new_row,
                        fields_mask: doc.fields_mask,
                        hit_count,
                        hit_ref,
                    },
                );
                word_doc_count += 1;
                word_hit_count += hit_count as u64;
            }
        }
        if word_doc_count == 0 {
            continue;
        }
        total_hits += word_hit_count;
        wordlist.push(
            &mut words_out,
            &WordEntry {
                key: min_key,
                doc_count: word_doc_count,
                hit_count: word_hit_count,
                doclist_offset,
                has_hitlist,
            },
        );
    }

    let word_count = wordlist.word_count();
    let checkpoints = wordlist.finish();
    let bloom = (settings.infix_enabled() && !checkpoints.is_empty()).then(|| {
        build_infix_bloom(
            &words_out,
            &checkpoints,
            dict_mode,
            settings.bloom_per_entry,
            settings.bloom_hashes,
        )
    });

    Ok(Some(SegmentParts {
        dict_mode,
        words: words_out,
        checkpoints,
        word_count,
        docs: docs_out,
        hits: hits_out,
        total_hits,
        rows,
        stride,
        row_count: next_row,
        blobs,
        deadmap: DeadRowMap::new(next_row),
        columnar: columnar_builders
            .into_iter()
            .map(|b| {
                let builder: Box<dyn ColumnarBuilder> = b;
                builder.finish()
            })
            .collect(),
        docstore,
        bloom,
    }))
}

/// Policy pass over the RAM layer: drop empty segments, then either kick
/// a save (over budget) or queue a two-segment merge. Must run on the
/// serial executor; reschedules itself after each background completion.
pub fn run_merge_cycle(inner: &Arc<IndexInner>) {
    debug_assert!(inner.serial.is_current());
    if inner.stop.is_stopped() {
        return;
    }

    // Empty segments (everything killed) leave the dataset immediately
    let snapshot = inner.dataset.snapshot();
    if snapshot
        .segments
        .iter()
        .any(|s| s.alive_rows() == 0 && !s.is_locked())
    {
        inner.dataset.swap(|current| crate::dataset::DatasetSnapshot {
            chunks: Arc::clone(&current.chunks),
            segments: Arc::new(
                current
                    .segments
                    .iter()
                    .filter(|s| s.alive_rows() > 0 || s.is_locked())
                    .cloned()
                    .collect(),
            ),
        });
    }

    let snapshot = inner.dataset.snapshot();
    let candidates: Vec<Arc<RamSegment>> = snapshot
        .segments
        .iter()
        .filter(|s| !s.is_locked())
        .cloned()
        .collect();
    if candidates.is_empty() {
        return;
    }

    let settings = inner.settings.read().clone();
    let ram_budget = if inner.save_running() {
        settings.double_buffer_limit()
    } else {
        settings.soft_ram_limit
    };
    let rows: Vec<u32> = candidates.iter().map(|s| s.alive_rows()).collect();
    let ram_bytes = snapshot.ram_bytes();

    match decide_merge(
        &rows,
        ram_bytes,
        ram_budget,
        settings.max_segments,
        settings.max_progression,
    ) {
        MergeDecision::NoMerge => {}
        MergeDecision::Flush => {
            debug!("merge policy: RAM layer at {ram_bytes} bytes, requesting save");
            chunk_saver::schedule_save(inner);
        }
        MergeDecision::Merge(a, b) => {
            let (first, second) = (Arc::clone(&candidates[a]), Arc::clone(&candidates[b]));
            // The older segment is always the first input so kill-list
            // chronology survives the merge
            let (first, second) = order_by_dataset(&snapshot.segments, first, second);
            start_segment_merge(inner, first, second);
        }
    }
}

fn order_by_dataset(
    segments: &[Arc<RamSegment>],
    a: Arc<RamSegment>,
    b: Arc<RamSegment>,
) -> (Arc<RamSegment>, Arc<RamSegment>) {
    let pos = |needle: &Arc<RamSegment>| {
        segments
            .iter()
            .position(|s| Arc::ptr_eq(s, needle))
            .unwrap_or(usize::MAX)
    };
    if pos(&a) <= pos(&b) { (a, b) } else { (b, a) }
}

/// Reserve two segments and hand the heavy work to the merge scheduler
fn start_segment_merge(inner: &Arc<IndexInner>, first: Arc<RamSegment>, second: Arc<RamSegment>) {
    let ticket = inner.dataset.alloc_ticket();
    if !first.try_lock_op(ticket) {
        return;
    }
    if !second.try_lock_op(ticket) {
        first.unlock_op();
        inner.dataset.notify_unlock();
        return;
    }
    let hook = Arc::new(KillHook::default());
    first.install_kill_hook(Arc::clone(&hook));
    second.install_kill_hook(Arc::clone(&hook));
    debug!(
        "merging segments ({} + {} rows) under ticket {ticket}",
        first.alive_rows(),
        second.alive_rows()
    );

    let worker_inner = Arc::clone(inner);
    inner.merger.spawn(move || {
        let schema = worker_inner.schema.read().clone();
        let settings = worker_inner.settings.read().clone();
        let result = merge_segment_views(
            &[first.as_ref() as &dyn PostingsView, second.as_ref()],
            &schema,
            &settings,
        );

        let serial_inner = Arc::clone(&worker_inner);
        worker_inner.serial.run(move || {
            finish_segment_merge(&serial_inner, ticket, first, second, hook, result);
        });
    });
}

/// Publication step, on the serial executor: replay raced kills and
/// postponed updates onto the output, then swap the dataset
fn finish_segment_merge(
    inner: &Arc<IndexInner>,
    ticket: u64,
    first: Arc<RamSegment>,
    second: Arc<RamSegment>,
    hook: Arc<KillHook>,
    result: Result<Option<SegmentParts>>,
) {
    let merged = match result {
        Ok(parts) => parts.map(RamSegment::build),
        Err(err) => {
            warn!("segment merge failed, keeping sources: {err}");
            first.clear_kill_hook();
            second.clear_kill_hook();
            first.unlock_op();
            second.unlock_op();
            inner.dataset.notify_unlock();
            return;
        }
    };

    if let Some(merged) = &merged {
        // Kills recorded while the merge ran
        let raced = hook.take();
        if !raced.is_empty() {
            merged.kill_multi(&raced);
        }
        // Attribute updates that landed on the reserved sources
        let schema = inner.schema.read().clone();
        for batch in first
            .drain_postponed()
            .into_iter()
            .chain(second.drain_postponed())
        {
            if let Ok(resolved) = resolve_batch(&schema, &batch) {
                let _ = apply_batch_to_view(&schema, merged.as_ref(), &batch, &resolved);
            }
        }
    }

    let publish = merged.filter(|m| m.alive_rows() > 0);
    inner.dataset.swap(|current| {
        let mut segments: Vec<Arc<RamSegment>> = current
            .segments
            .iter()
            .filter(|s| s.locked_ticket() != ticket)
            .cloned()
            .collect();
        if let Some(merged) = &publish {
            segments.push(Arc::clone(merged));
        }
        crate::dataset::DatasetSnapshot {
            chunks: Arc::clone(&current.chunks),
            segments: Arc::new(segments),
        }
    });

    // Hook window stays open until after the swap so no kill can slip
    // between attribute replay and publication
    first.clear_kill_hook();
    second.clear_kill_hook();
    first.unlock_op();
    second.unlock_op();
    inner.dataset.notify_unlock();
    debug!(
        "segment merge ticket {ticket} published ({} alive rows)",
        publish.as_ref().map_or(0, |m| m.alive_rows())
    );

    run_merge_cycle(inner);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accum::Accumulator;
    use crate::analysis::PlainDictionary;
    use crate::core::types::{
        AttrDef, AttrType, AttrValue, DocId, Document, FieldDef, pack_position,
    };
    use crate::dataset::DatasetSnapshot;
    use crate::search::executor::{QueryArgs, multi_query};
    use crate::search::sorter::{MatchSorter, SortKey};

    fn test_schema() -> Schema {
        Schema::new(
            vec![AttrDef::new("price", AttrType::Uint)],
            vec![FieldDef::new("title")],
        )
        .unwrap()
    }

    fn build_segment(ids: std::ops::RangeInclusive<u64>) -> Arc<RamSegment> {
        let schema = test_schema();
        let settings = RtSettings::default();
        let dict = PlainDictionary::default();
        let mut accum = Accumulator::new();
        accum.bind(1, &schema, &settings).unwrap();
        for id in ids {
            let doc = Document::new(DocId(id))
                .with_attr(AttrValue::Uint(id as u32))
                .with_field("shared words");
            let terms = vec![
                ("shared".to_string(), pack_position(0, 1)),
                ("words".to_string(), pack_position(0, 2)),
                (format!("tag{id}"), pack_position(0, 3)),
            ];
            accum.add_document(&doc, false, &terms, &dict).unwrap();
        }
        accum.commit(schema.fingerprint()).unwrap().0.unwrap()
    }

    fn query_docs(segments: Vec<Arc<RamSegment>>, word: &str) -> Vec<u64> {
        let snapshot = DatasetSnapshot {
            chunks: Arc::new(Vec::new()),
            segments: Arc::new(segments),
        };
        let mut sorters = vec![MatchSorter::new(1000, SortKey::Score, vec![])];
        multi_query(
            &snapshot,
            &test_schema(),
            &RtSettings::default(),
            &PlainDictionary::default(),
            &crate::query::tree::QueryNode::Term(crate::query::tree::TermNode::new(word)),
            &QueryArgs::default(),
            &mut sorters,
        )
        .unwrap();
        let mut docs: Vec<u64> = sorters
            .pop()
            .unwrap()
            .into_sorted()
            .into_iter()
            .map(|m| m.doc.0)
            .collect();
        docs.sort_unstable();
        docs
    }

    #[test]
    fn test_merge_with_kills_in_both_sources() {
        let first = build_segment(1..=100);
        let second = build_segment(101..=200);
        first.kill(DocId(50));
        second.kill(DocId(150));

        let parts = merge_segment_views(
            &[first.as_ref() as &dyn PostingsView, second.as_ref()],
            &test_schema(),
            &RtSettings::default(),
        )
        .unwrap()
        .unwrap();
        let merged = RamSegment::build(parts);

        assert_eq!(merged.alive_rows(), 198);
        assert!(merged.find_alive_row(DocId(50)).is_none());
        assert!(merged.find_alive_row(DocId(150)).is_none());
        assert!(merged.find_alive_row(DocId(51)).is_some());
        assert!(merged.find_alive_row(DocId(200)).is_some());
    }

    #[test]
    fn test_kills_during_merge_replay_through_hook() {
        let first = build_segment(1..=100);
        let second = build_segment(101..=200);
        let hook = Arc::new(KillHook::default());
        first.install_kill_hook(Arc::clone(&hook));
        second.install_kill_hook(Arc::clone(&hook));

        let parts = merge_segment_views(
            &[first.as_ref() as &dyn PostingsView, second.as_ref()],
            &test_schema(),
            &RtSettings::default(),
        )
        .unwrap()
        .unwrap();
        let merged = RamSegment::build(parts);

        // Kills land on the sources after their rows were copied
        first.kill(DocId(50));
        second.kill(DocId(150));
        let raced = hook.take();
        assert_eq!(raced.len(), 2);
        merged.kill_multi(&raced);

        assert_eq!(merged.alive_rows(), 198);
        assert!(merged.find_alive_row(DocId(50)).is_none());
        assert!(merged.find_alive_row(DocId(150)).is_none());
    }

    #[test]
    fn test_merged_segment_queries_like_the_union() {
        let first = build_segment(1..=30);
        let second = build_segment(31..=60);
        first.kill(DocId(7));

        let separate = query_docs(vec![Arc::clone(&first), Arc::clone(&second)], "shared");
        let separate_tagged = query_docs(vec![Arc::clone(&first), Arc::clone(&second)], "tag42");

        let parts = merge_segment_views(
            &[first.as_ref() as &dyn PostingsView, second.as_ref()],
            &test_schema(),
            &RtSettings::default(),
        )
        .unwrap()
        .unwrap();
        let merged = RamSegment::build(parts);

        assert_eq!(query_docs(vec![Arc::clone(&merged)], "shared"), separate);
        assert_eq!(query_docs(vec![merged], "tag42"), separate_tagged);
    }

    #[test]
    fn test_merge_of_fully_killed_sources_yields_nothing() {
        let first = build_segment(1..=5);
        for id in 1..=5 {
            first.kill(DocId(id));
        }
        let result = merge_segment_views(
            &[first.as_ref() as &dyn PostingsView],
            &test_schema(),
            &RtSettings::default(),
        )
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_decide_flush_on_budget() {
        assert_eq!(
            decide_merge(&[10, 20], 200, 100, 32, 8),
            MergeDecision::Flush
        );
    }

    #[test]
    fn test_decide_nomerge_under_headroom() {
        let rows = vec![100; 24];
        assert_eq!(
            decide_merge(&rows, 10, 100, 32, 8),
            MergeDecision::NoMerge
        );
    }

    #[test]
    fn test_decide_merge_picks_two_smallest() {
        let mut rows = vec![500; 25];
        rows[7] = 10;
        rows[19] = 12;
        assert_eq!(
            decide_merge(&rows, 10, 100, 32, 8),
            MergeDecision::Merge(7, 19)
        );
    }

    #[test]
    fn test_decide_nomerge_when_sizes_diverge() {
        let mut rows = vec![500; 25];
        rows[0] = 10;
        // Second smallest is more than twice the smallest and the cap is
        // not yet reached
        assert_eq!(decide_merge(&rows, 10, 100, 32, 8), MergeDecision::NoMerge);

        // At the cap the merge happens regardless
        let mut at_cap = vec![500; 32];
        at_cap[0] = 10;
        assert!(matches!(
            decide_merge(&at_cap, 10, 100, 32, 8),
            MergeDecision::Merge(0, _)
        ));
    }
}
