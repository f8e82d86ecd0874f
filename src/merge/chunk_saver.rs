use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::Utc;
use log::{info, warn};

use crate::chunk::writer::write_chunk;
use crate::chunk::DiskChunk;
use crate::core::error::Result;
use crate::core::types::DocId;
use crate::dataset::DatasetSnapshot;
use crate::index::rt_index::IndexInner;
use crate::merge::segment_merger;
use crate::segment::ram_segment::RamSegment;
use crate::segment::{KillHook, PostingsView};
use crate::storage::ram_snapshot;
use crate::update::engine::{apply_batch_to_view, resolve_batch};

/// Queue a background save decided by the merge policy; collapses into
/// one pending run when a save is already in flight
pub fn schedule_save(inner: &Arc<IndexInner>) {
    if inner.stop.is_stopped() {
        return;
    }
    if inner.save_in_progress.load(Ordering::Acquire) {
        inner.save_pending.store(true, Ordering::Release);
        return;
    }
    let worker_inner = Arc::clone(inner);
    inner.merger.spawn(move || {
        if let Err(err) = save_disk_chunk(&worker_inner, false) {
            warn!("background save failed, RAM layer preserved: {err}");
        }
    });
}

/// Promote the RAM layer into a new disk chunk. Forced saves wait for
/// every reserved segment and take the whole layer; policy saves take
/// whatever is unlocked. Runs on the caller's thread for the IO-heavy
/// part and enters the serial executor for selection and publication.
pub fn save_disk_chunk(inner: &Arc<IndexInner>, forced: bool) -> Result<()> {
    // One save at a time; a raced request is remembered and re-run
    while inner
        .save_in_progress
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        if !forced {
            inner.save_pending.store(true, Ordering::Release);
            return Ok(());
        }
        inner.wait_save_done();
    }

    let result = perform_save(inner, forced);

    inner.save_in_progress.store(false, Ordering::Release);
    inner.notify_save_done();
    if inner.save_pending.swap(false, Ordering::AcqRel) {
        schedule_save(inner);
    }
    // Progression may now be possible again
    let cycle_inner = Arc::clone(inner);
    inner.serial.spawn(move || {
        segment_merger::run_merge_cycle(&cycle_inner);
    });
    result
}

fn perform_save(inner: &Arc<IndexInner>, forced: bool) -> Result<()> {
    if forced {
        inner.dataset.wait_segments_unlocked();
    }

    let ticket = inner.dataset.alloc_ticket();
    let hook = Arc::new(KillHook::default());

    // Selection, on the serial executor: stamp every unlocked non-empty
    // segment and capture the TID this save will cover
    let select_inner = Arc::clone(inner);
    let select_hook = Arc::clone(&hook);
    let (selected, covered_tid, chunk_id) = inner.serial.run(move || {
        let snapshot = select_inner.dataset.snapshot();
        let mut selected: Vec<Arc<RamSegment>> = Vec::new();
        for segment in snapshot.segments.iter() {
            if segment.row_count() == 0 || !segment.try_lock_op(ticket) {
                continue;
            }
            segment.install_kill_hook(Arc::clone(&select_hook));
            selected.push(Arc::clone(segment));
        }
        (
            selected,
            select_inner.committed_tid.load(Ordering::Acquire),
            select_inner.dataset.alloc_chunk_id(),
        )
    });

    if selected.is_empty() {
        info!("save: RAM layer empty, nothing to promote");
        finish_save(inner, ticket, &selected, hook, None, covered_tid)?;
        return Ok(());
    }

    let schema = inner.schema.read().clone();
    let settings = inner.settings.read().clone();
    let views: Vec<&dyn PostingsView> = selected.iter().map(|s| s.as_ref() as _).collect();
    let stats = match write_chunk(
        &inner.layout,
        chunk_id,
        &views,
        &schema,
        &settings,
        None,
        &inner.stop,
    ) {
        Ok(stats) => stats,
        Err(err) => {
            // Abandon: sources stay published, files are best-effort
            // removed, the RAM layer survives
            release_segments(inner, &selected);
            for path in inner.layout.chunk_files(chunk_id) {
                let _ = std::fs::remove_file(path);
            }
            return Err(err);
        }
    };

    let chunk = if stats.rows > 0 {
        let chunk = DiskChunk::open(&inner.layout, chunk_id)?;
        // Prealloc pass so the first queries hit a warm cache
        chunk.warm();
        Some(chunk)
    } else {
        None
    };

    finish_save(inner, ticket, &selected, hook, chunk, covered_tid)
}

/// Publication, on the serial executor: replay raced kills and postponed
/// updates onto the new chunk, swap the dataset, rewrite `.meta`, and
/// drop the now redundant `.ram` snapshot
fn finish_save(
    inner: &Arc<IndexInner>,
    ticket: u64,
    selected: &[Arc<RamSegment>],
    hook: Arc<KillHook>,
    chunk: Option<Arc<DiskChunk>>,
    covered_tid: u64,
) -> Result<()> {
    let publish_inner = Arc::clone(inner);
    let selected: Vec<Arc<RamSegment>> = selected.to_vec();
    inner.serial.run(move || -> Result<()> {
        let inner = publish_inner;
        let schema = inner.schema.read().clone();

        if let Some(chunk) = &chunk {
            let raced: Vec<DocId> = hook.take();
            let killed = chunk.kill_multi(&raced);

            let mut updates_applied = false;
            for segment in &selected {
                for batch in segment.drain_postponed() {
                    if let Ok(resolved) = resolve_batch(&schema, &batch) {
                        if let Ok(result) =
                            apply_batch_to_view(&schema, chunk.as_ref(), &batch, &resolved)
                        {
                            updates_applied |= result.affected > 0;
                        }
                    }
                }
            }
            if killed > 0 {
                chunk.save_deadmap()?;
            }
            if updates_applied {
                chunk.save_attrs()?;
            }
        }

        inner.dataset.swap(|current| {
            let mut chunks = current.chunks.as_ref().clone();
            if let Some(chunk) = &chunk {
                chunks.push(Arc::clone(chunk));
            }
            DatasetSnapshot {
                chunks: Arc::new(chunks),
                segments: Arc::new(
                    current
                        .segments
                        .iter()
                        .filter(|s| s.locked_ticket() != ticket)
                        .cloned()
                        .collect(),
                ),
            }
        });

        for segment in &selected {
            segment.clear_kill_hook();
            segment.unlock_op();
        }
        inner.dataset.notify_unlock();

        // The covered TID only advances when the whole RAM layer made it
        // to disk; segments skipped because a merge held them keep their
        // transaction-log records replayable
        let ram_drained = inner.dataset.snapshot().segments.is_empty();
        if ram_drained {
            inner.saved_tid.store(covered_tid, Ordering::Release);
        }
        inner.write_meta()?;
        if ram_drained && inner.committed_tid.load(Ordering::Acquire) == covered_tid {
            inner.txlog.reset()?;
        }
        ram_snapshot::delete_ram(&inner.layout);
        *inner.last_flush.lock() = Some(Utc::now());

        info!(
            "save ticket {ticket}: promoted {} segments{}",
            selected.len(),
            chunk
                .as_ref()
                .map(|c| format!(" into chunk {}", c.id()))
                .unwrap_or_default()
        );
        Ok(())
    })
}

fn release_segments(inner: &Arc<IndexInner>, selected: &[Arc<RamSegment>]) {
    for segment in selected {
        segment.clear_kill_hook();
        segment.unlock_op();
    }
    inner.dataset.notify_unlock();
}
