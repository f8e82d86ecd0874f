use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::{debug, info, warn};

use crate::chunk::DiskChunk;
use crate::chunk::writer::write_chunk;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{DocId, Schema};
use crate::dataset::DatasetSnapshot;
use crate::index::rt_index::IndexInner;
use crate::segment::{KillHook, PostingsView};
use crate::update::engine::{apply_batch_to_view, resolve_batch};

/// Value filter splitting a chunk in two: rows whose attribute value is
/// listed go to the "included" output
#[derive(Debug, Clone)]
pub struct SplitFilter {
    pub attr: String,
    pub values: Vec<u64>,
}

/// Optimizer verbs, executed one at a time on the merge scheduler
#[derive(Debug, Clone)]
pub enum OptimizeTask {
    /// Remove an empty chunk
    Drop(u32),
    /// Rewrite one chunk through the merge pipeline, purging dead rows
    /// and compacting blobs
    Compress(u32),
    /// Rewrite two chunks into one; the first must be the older
    Merge(u32, u32),
    /// Produce two chunks covering the source's alive rows
    Split(u32, SplitFilter),
    /// Merge smallest pairs until at most `cutoff` chunks remain
    /// (default `2 × cpu threads`), then compress what is left
    AutoOptimize(Option<usize>),
    /// Merge chunks 0 and 1 repeatedly until one remains
    Classic,
}

/// Run one optimize task to completion. A cooperative stop is not an
/// error: the index simply stays at whatever shape was reached.
pub fn optimize(inner: &Arc<IndexInner>, task: OptimizeTask) -> Result<()> {
    let worker = Arc::clone(inner);
    let outcome = inner.merger.run(move || run_task(&worker, task));
    match outcome {
        Err(err) if err.kind == ErrorKind::Interrupted => {
            info!("optimize stopped cooperatively");
            Ok(())
        }
        other => other,
    }
}

fn run_task(inner: &Arc<IndexInner>, task: OptimizeTask) -> Result<()> {
    match task {
        OptimizeTask::Drop(id) => drop_chunk(inner, id),
        OptimizeTask::Compress(id) => {
            let chunk = find_chunk(inner, id)?;
            rewrite_chunks(inner, &[chunk], &[None])
        }
        OptimizeTask::Merge(a, b) => {
            let first = find_chunk(inner, a)?;
            let second = find_chunk(inner, b)?;
            rewrite_chunks(inner, &[first, second], &[None])
        }
        OptimizeTask::Split(id, filter) => split_chunk(inner, id, filter),
        OptimizeTask::AutoOptimize(cutoff) => auto_optimize(inner, cutoff),
        OptimizeTask::Classic => classic_optimize(inner),
    }
}

fn find_chunk(inner: &Arc<IndexInner>, id: u32) -> Result<Arc<DiskChunk>> {
    inner
        .dataset
        .snapshot()
        .chunks
        .iter()
        .find(|c| c.id() == id)
        .cloned()
        .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no disk chunk {id}")))
}

fn drop_chunk(inner: &Arc<IndexInner>, id: u32) -> Result<()> {
    let chunk = find_chunk(inner, id)?;
    if chunk.alive_rows() > 0 {
        return Err(Error::invalid(format!(
            "chunk {id} still has {} alive rows",
            chunk.alive_rows()
        )));
    }
    let publish_inner = Arc::clone(inner);
    inner.serial.run(move || -> Result<()> {
        publish_inner.dataset.swap(|current| DatasetSnapshot {
            chunks: Arc::new(
                current
                    .chunks
                    .iter()
                    .filter(|c| c.id() != id)
                    .cloned()
                    .collect(),
            ),
            segments: Arc::clone(&current.segments),
        });
        chunk.set_delete_on_drop();
        publish_inner.write_meta()
    })?;
    info!("dropped empty chunk {id}");
    Ok(())
}

type KeepFn = Box<dyn Fn(DocId) -> bool + Send + Sync>;

/// Claim `sources`, write one output chunk per entry of `outputs` (None
/// keeps every alive row), then atomically replace the sources with the
/// outputs at the older position. Kills racing in through the hook are
/// replayed onto every output; postponed updates likewise.
fn rewrite_chunks(
    inner: &Arc<IndexInner>,
    sources: &[Arc<DiskChunk>],
    outputs: &[Option<KeepFn>],
) -> Result<()> {
    // The optimizing flag is what makes a chunk claimable by exactly one
    // verb; the attrs RW lock stays free for queries and updates
    for (idx, chunk) in sources.iter().enumerate() {
        if !chunk.try_set_optimizing() {
            for claimed in &sources[..idx] {
                claimed.clear_optimizing();
            }
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!("chunk {} is already being optimized", chunk.id()),
            ));
        }
    }
    let hook = Arc::new(KillHook::default());
    for chunk in sources {
        chunk.install_kill_hook(Arc::clone(&hook));
    }

    let release = || {
        for chunk in sources {
            chunk.clear_kill_hook();
            chunk.clear_optimizing();
        }
    };

    let schema = inner.schema.read().clone();
    let settings = inner.settings.read().clone();
    let views: Vec<&dyn PostingsView> = sources.iter().map(|c| c.as_ref() as _).collect();

    let mut new_chunks: Vec<Arc<DiskChunk>> = Vec::new();
    for keep in outputs {
        if inner.stop.is_stopped() {
            release();
            return Err(Error::new(ErrorKind::Interrupted, "optimize interrupted"));
        }
        let new_id = inner.dataset.alloc_chunk_id();
        let stats = match write_chunk(
            &inner.layout,
            new_id,
            &views,
            &schema,
            &settings,
            keep.as_ref()
                .map(|f| f.as_ref() as &(dyn Fn(DocId) -> bool + Sync)),
            &inner.stop,
        ) {
            Ok(stats) => stats,
            Err(err) => {
                release();
                for path in inner.layout.chunk_files(new_id) {
                    let _ = std::fs::remove_file(path);
                }
                return Err(err);
            }
        };
        if stats.rows > 0 {
            let chunk = DiskChunk::open(&inner.layout, new_id)?;
            chunk.warm();
            new_chunks.push(chunk);
        }
    }

    // Publication on the serial executor
    let publish_inner = Arc::clone(inner);
    let publish_sources: Vec<Arc<DiskChunk>> = sources.to_vec();
    let publish_new = new_chunks.clone();
    let publish_hook = Arc::clone(&hook);
    inner.serial.run(move || -> Result<()> {
        let inner = publish_inner;
        let schema = inner.schema.read().clone();

        let raced: Vec<DocId> = publish_hook.take();
        for chunk in &publish_new {
            let killed = chunk.kill_multi(&raced);
            let mut updated = false;
            for source in &publish_sources {
                for batch in source.drain_postponed() {
                    if let Ok(resolved) = resolve_batch(&schema, &batch)
                        && let Ok(result) =
                            apply_batch_to_view(&schema, chunk.as_ref(), &batch, &resolved)
                    {
                        updated |= result.affected > 0;
                    }
                }
            }
            if killed > 0 {
                chunk.save_deadmap()?;
            }
            if updated {
                chunk.save_attrs()?;
            }
        }

        let source_ids: Vec<u32> = publish_sources.iter().map(|c| c.id()).collect();
        inner.dataset.swap(|current| {
            let mut chunks: Vec<Arc<DiskChunk>> = Vec::with_capacity(current.chunks.len());
            let mut inserted = false;
            for chunk in current.chunks.iter() {
                if source_ids.contains(&chunk.id()) {
                    if !inserted {
                        chunks.extend(publish_new.iter().cloned());
                        inserted = true;
                    }
                    continue;
                }
                chunks.push(Arc::clone(chunk));
            }
            if !inserted {
                chunks.extend(publish_new.iter().cloned());
            }
            DatasetSnapshot {
                chunks: Arc::new(chunks),
                segments: Arc::clone(&current.segments),
            }
        });

        for source in &publish_sources {
            source.clear_kill_hook();
            source.clear_optimizing();
            source.set_delete_on_drop();
        }
        inner.write_meta()
    })?;

    debug!(
        "optimize: rewrote chunks {:?} into {:?}",
        sources.iter().map(|c| c.id()).collect::<Vec<_>>(),
        new_chunks.iter().map(|c| c.id()).collect::<Vec<_>>()
    );
    Ok(())
}

/// Split runs the rewrite twice over one source: first with the filter
/// as an exclusion, then as an inclusion. The matching doc-id set is
/// computed up front so the keep callbacks never touch the source's
/// attribute lock mid-write.
fn split_chunk(inner: &Arc<IndexInner>, id: u32, filter: SplitFilter) -> Result<()> {
    let chunk = find_chunk(inner, id)?;
    let schema = inner.schema.read().clone();
    let attr_idx = schema.attr_index(&filter.attr).ok_or_else(|| {
        Error::new(
            ErrorKind::NotFound,
            format!("unknown split attribute '{}'", filter.attr),
        )
    })?;

    let included = collect_matching_docs(&schema, &chunk, attr_idx, &filter);
    let included = Arc::new(included);
    let excluded_set = Arc::clone(&included);
    let exclude: KeepFn = Box::new(move |doc| !excluded_set.contains(doc.0));
    let include: KeepFn = Box::new(move |doc| included.contains(doc.0));

    rewrite_chunks(inner, &[chunk], &[Some(exclude), Some(include)])
}

fn collect_matching_docs(
    schema: &Schema,
    chunk: &Arc<DiskChunk>,
    attr_idx: usize,
    filter: &SplitFilter,
) -> roaring::RoaringTreemap {
    let attr = &schema.attrs[attr_idx];
    let column = attr.columnar.then(|| {
        schema
            .attrs
            .iter()
            .take(attr_idx)
            .filter(|a| a.columnar)
            .count()
    });
    let offset = schema.attr_offset(attr_idx);

    let mut matching = roaring::RoaringTreemap::new();
    let attrs = chunk.attrs().read();
    for row in 0..chunk.row_count() {
        if chunk.is_row_dead(row) {
            continue;
        }
        let value = match column {
            Some(column) => chunk.columnar()[column].get(row),
            None => match attr.ty.cell_width() {
                1 => attrs.row(row)[offset] as u64,
                _ => attrs.get_u64(row, offset),
            },
        };
        if filter.values.contains(&value) {
            matching.insert(attrs.docid(row).0);
        }
    }
    matching
}

fn auto_optimize(inner: &Arc<IndexInner>, cutoff: Option<usize>) -> Result<()> {
    let cutoff = cutoff.unwrap_or_else(|| 2 * num_cpus::get());
    info!("auto-optimize: cutoff {cutoff}");

    loop {
        if inner.stop.is_stopped() {
            return Err(Error::new(ErrorKind::Interrupted, "optimize interrupted"));
        }
        let snapshot = inner.dataset.snapshot();

        // Empty chunks go first
        if let Some(empty) = snapshot
            .chunks
            .iter()
            .find(|c| c.alive_rows() == 0 && !c.is_optimizing())
        {
            drop_chunk(inner, empty.id())?;
            continue;
        }

        let mut live: Vec<Arc<DiskChunk>> = snapshot
            .chunks
            .iter()
            .filter(|c| !c.is_optimizing())
            .cloned()
            .collect();
        if live.len() <= cutoff {
            break;
        }
        // Two smallest by on-disk effective size
        live.sort_by_key(|c| c.disk_bytes());
        let (older, newer) = order_by_position(&snapshot, &live[0], &live[1]);
        match rewrite_chunks(inner, &[older, newer], &[None]) {
            Ok(()) => {}
            Err(err) if err.kind == ErrorKind::InvalidState => {
                // Raced with another verb; re-evaluate
                warn!("auto-optimize: {err}");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    // Final pass: purge dead rows from whatever remains
    let snapshot = inner.dataset.snapshot();
    for chunk in snapshot.chunks.iter() {
        if inner.stop.is_stopped() {
            return Err(Error::new(ErrorKind::Interrupted, "optimize interrupted"));
        }
        if chunk.row_count() > chunk.alive_rows() && !chunk.is_optimizing() {
            rewrite_chunks(inner, &[Arc::clone(chunk)], &[None])?;
        }
    }
    Ok(())
}

fn order_by_position(
    snapshot: &DatasetSnapshot,
    a: &Arc<DiskChunk>,
    b: &Arc<DiskChunk>,
) -> (Arc<DiskChunk>, Arc<DiskChunk>) {
    let pos = |needle: &Arc<DiskChunk>| {
        snapshot
            .chunks
            .iter()
            .position(|c| c.id() == needle.id())
            .unwrap_or(usize::MAX)
    };
    if pos(a) <= pos(b) {
        (Arc::clone(a), Arc::clone(b))
    } else {
        (Arc::clone(b), Arc::clone(a))
    }
}

fn classic_optimize(inner: &Arc<IndexInner>) -> Result<()> {
    loop {
        if inner.stop.is_stopped() {
            return Err(Error::new(ErrorKind::Interrupted, "optimize interrupted"));
        }
        let snapshot = inner.dataset.snapshot();
        if snapshot.chunks.len() <= 1 {
            return Ok(());
        }
        let first = Arc::clone(&snapshot.chunks[0]);
        let second = Arc::clone(&snapshot.chunks[1]);
        rewrite_chunks(inner, &[first, second], &[None])?;
    }
}
