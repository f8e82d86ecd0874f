use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::info;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::accum::Accumulator;
use crate::analysis::{Dictionary, FieldFilter, Tokenizer};
use crate::chunk::DiskChunk;
use crate::core::config::RtSettings;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::globals::StopSignal;
use crate::core::stats::IndexStatus;
use crate::core::types::{
    AttrDef, AttrType, DocId, Document, MAX_FIELD_POS, Schema, pack_position,
    position_set_field_end,
};
use crate::dataset::{DatasetSnapshot, HybridDataset, TaskExecutor};
use crate::merge::optimizer::OptimizeTask;
use crate::merge::{chunk_saver, optimizer, segment_merger};
use crate::query::tree::{QueryNode, TermNode};
use crate::search::KeywordStats;
use crate::search::executor::{QueryArgs, QueryMeta, keyword_stats, multi_query};
use crate::search::sorter::MatchSorter;
use crate::segment::PostingsView;
use crate::segment::ram_segment::RamSegment;
use crate::storage::file_lock::FileLock;
use crate::storage::files::{read_file, write_file};
use crate::storage::layout::IndexLayout;
use crate::storage::meta::IndexMeta;
use crate::storage::ram_snapshot;
use crate::storage::txlog::{TxLog, TxLogOp};
use crate::update::engine::{apply_batch_to_view, resolve_batch};
use crate::update::{UpdateBatch, UpdateResult};

const SETTINGS_MAGIC: u32 = 0x5452_5354; // "TRST"
const SETTINGS_VERSION: u32 = 1;
const INDEX_FORMAT_VERSION: u32 = 1;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Shared core of one index instance. The background machinery (segment
/// merger, chunk saver, optimizer, update engine) all operate on this
/// through an `Arc`.
pub struct IndexInner {
    pub layout: IndexLayout,
    pub dataset: HybridDataset,
    /// All dataset mutations run here
    pub serial: TaskExecutor,
    /// One in-flight merge or save at a time
    pub merger: TaskExecutor,
    pub schema: RwLock<Schema>,
    pub settings: RwLock<RtSettings>,
    pub tokenizer: RwLock<Box<dyn Tokenizer>>,
    pub dictionary: RwLock<Box<dyn Dictionary>>,
    pub field_filter: RwLock<Option<Box<dyn FieldFilter>>>,
    pub txlog: TxLog,
    /// Allocator for transaction ids; bumped when a transaction starts
    pub next_tid: AtomicU64,
    /// Last committed transaction
    pub committed_tid: AtomicU64,
    /// Transaction covered by the on-disk state
    pub saved_tid: AtomicU64,
    pub save_in_progress: AtomicBool,
    pub save_pending: AtomicBool,
    save_signal_mutex: Mutex<()>,
    save_signal: Condvar,
    /// Set by a critical IO failure; writes are refused until recovery
    pub inconsistent: AtomicBool,
    pub last_flush: Mutex<Option<DateTime<Utc>>>,
    pub started_at: DateTime<Utc>,
    /// Binds accumulators to this instance
    pub instance_id: u64,
    pub stop: StopSignal,
}

impl IndexInner {
    pub fn save_running(&self) -> bool {
        self.save_in_progress.load(Ordering::Acquire)
    }

    pub fn wait_save_done(&self) {
        let mut guard = self.save_signal_mutex.lock();
        if !self.save_running() {
            return;
        }
        self.save_signal
            .wait_for(&mut guard, Duration::from_millis(50));
    }

    pub fn notify_save_done(&self) {
        let _guard = self.save_signal_mutex.lock();
        self.save_signal.notify_all();
    }

    pub fn check_consistent(&self) -> Result<()> {
        if self.inconsistent.load(Ordering::Acquire) {
            return Err(Error::new(
                ErrorKind::Inconsistent,
                "index flagged inconsistent, recovery required",
            ));
        }
        Ok(())
    }

    /// Rewrite `.meta` from current state; must run with the dataset
    /// stable (serial executor)
    pub fn write_meta(&self) -> Result<()> {
        let snapshot = self.dataset.snapshot();
        let disk_bytes: u64 = snapshot.chunks.iter().map(|c| c.disk_bytes()).sum();
        let meta = IndexMeta {
            total_documents: snapshot.total_alive().min(u32::MAX as u64) as u32,
            total_bytes: disk_bytes + snapshot.ram_bytes().max(0) as u64,
            committed_tid: self.saved_tid.load(Ordering::Acquire),
            format_version: INDEX_FORMAT_VERSION,
            schema: self.schema.read().clone(),
            settings: self.settings.read().clone(),
            tokenizer_hash: self.tokenizer.read().settings_hash(),
            dictionary_hash: self.dictionary.read().settings_hash(),
            field_filter_hash: self
                .field_filter
                .read()
                .as_ref()
                .map_or(0, |f| f.settings_hash()),
            chunk_ids: snapshot.chunks.iter().map(|c| c.id()).collect(),
        };
        meta.save(&self.layout)
    }
}

/// The real-time index: one logical full-text index served from mutable
/// RAM segments layered over immutable disk chunks
pub struct RtIndex {
    inner: Arc<IndexInner>,
    _file_lock: FileLock,
}

impl RtIndex {
    /// Open or create the index at `layout`. Existing state is recovered
    /// from `.meta`, `.ram` and the transaction log.
    pub fn open(
        layout: IndexLayout,
        schema: Schema,
        settings: RtSettings,
        tokenizer: Box<dyn Tokenizer>,
        dictionary: Box<dyn Dictionary>,
        field_filter: Option<Box<dyn FieldFilter>>,
    ) -> Result<RtIndex> {
        if let Some(parent) = layout.base().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file_lock = FileLock::acquire(&layout)?;

        let existing = IndexMeta::exists(&layout)
            .then(|| IndexMeta::load(&layout))
            .transpose()?;
        let (schema, mut settings, saved_tid, chunk_ids) = match &existing {
            Some(meta) => (
                meta.schema.clone(),
                meta.settings.clone(),
                meta.committed_tid,
                meta.chunk_ids.clone(),
            ),
            None => (schema, settings, 0, Vec::new()),
        };
        if let Some(overlay) = load_settings_overlay(&layout)? {
            settings = overlay;
        }

        let txlog = TxLog::open(&layout)?;
        let inner = Arc::new(IndexInner {
            serial: TaskExecutor::new("rt-serial"),
            merger: TaskExecutor::new("rt-merge"),
            dataset: HybridDataset::new(),
            schema: RwLock::new(schema),
            settings: RwLock::new(settings),
            tokenizer: RwLock::new(tokenizer),
            dictionary: RwLock::new(dictionary),
            field_filter: RwLock::new(field_filter),
            txlog,
            next_tid: AtomicU64::new(saved_tid),
            committed_tid: AtomicU64::new(saved_tid),
            saved_tid: AtomicU64::new(saved_tid),
            save_in_progress: AtomicBool::new(false),
            save_pending: AtomicBool::new(false),
            save_signal_mutex: Mutex::new(()),
            save_signal: Condvar::new(),
            inconsistent: AtomicBool::new(false),
            last_flush: Mutex::new(None),
            started_at: Utc::now(),
            instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            stop: StopSignal::default(),
            layout: layout.clone(),
        });

        // Attach every chunk listed in the header, oldest first
        let mut chunks = Vec::with_capacity(chunk_ids.len());
        let mut max_id = 0u32;
        for id in &chunk_ids {
            chunks.push(DiskChunk::open(&layout, *id)?);
            max_id = max_id.max(*id + 1);
        }
        inner.dataset.reserve_chunk_ids(max_id);

        // The `.ram` snapshot restores the RAM layer as of the last flush
        let segments = ram_snapshot::load_ram(&layout)?;
        inner.dataset.swap(|_| DatasetSnapshot {
            chunks: Arc::new(chunks),
            segments: Arc::new(segments),
        });

        // Replay transactions newer than the on-disk state
        let ops = TxLog::replay(&layout, saved_tid)?;
        let replayed = ops.len();
        for op in ops {
            match op {
                TxLogOp::Commit {
                    tid,
                    segment,
                    kill_list,
                } => {
                    let segment = segment.map(RamSegment::from_data).transpose()?;
                    let kills: Vec<DocId> = kill_list.into_iter().map(DocId).collect();
                    publish_commit(&inner, segment, &kills, tid);
                }
                TxLogOp::Reconfigure { tid, settings, .. } => {
                    *inner.settings.write() = settings;
                    inner.committed_tid.store(tid, Ordering::Release);
                }
            }
        }
        if replayed > 0 {
            info!("recovered {replayed} transactions from the log");
        }
        inner
            .next_tid
            .store(inner.committed_tid.load(Ordering::Acquire), Ordering::Release);
        if existing.is_none() {
            inner.serial.run({
                let inner = Arc::clone(&inner);
                move || inner.write_meta()
            })?;
        }

        Ok(RtIndex {
            inner,
            _file_lock: file_lock,
        })
    }

    pub fn schema(&self) -> Schema {
        self.inner.schema.read().clone()
    }

    pub fn settings(&self) -> RtSettings {
        self.inner.settings.read().clone()
    }

    pub fn snapshot(&self) -> DatasetSnapshot {
        self.inner.dataset.snapshot()
    }

    pub fn total_documents(&self) -> u64 {
        self.snapshot().total_alive()
    }

    // --- write path ---

    /// Tokenize and buffer one document into the caller's accumulator
    pub fn add_document(
        &self,
        accum: &mut Accumulator,
        doc: &Document,
        replace: bool,
    ) -> Result<()> {
        self.inner.check_consistent()?;
        let schema = self.inner.schema.read().clone();
        let settings = self.inner.settings.read().clone();
        accum.bind(self.inner.instance_id, &schema, &settings)?;

        if doc.fields.len() > schema.fields.len() {
            return Err(Error::new(
                ErrorKind::SchemaMismatch,
                format!(
                    "document carries {} fields, schema has {}",
                    doc.fields.len(),
                    schema.fields.len()
                ),
            ));
        }

        let terms = self.tokenize_fields(doc)?;
        let dictionary = self.inner.dictionary.read();
        accum.add_document(doc, replace, &terms, dictionary.as_ref())
    }

    pub fn delete_document(&self, accum: &mut Accumulator, docs: &[DocId]) -> Result<()> {
        self.inner.check_consistent()?;
        let schema = self.inner.schema.read().clone();
        let settings = self.inner.settings.read().clone();
        accum.bind(self.inner.instance_id, &schema, &settings)?;
        accum.delete_document(docs);
        Ok(())
    }

    /// Commit the accumulator: build the segment, log the transaction,
    /// and publish segment plus kill list in one dataset swap. Returns
    /// the number of killed documents.
    pub fn commit(&self, accum: &mut Accumulator) -> Result<u64> {
        self.inner.check_consistent()?;
        if accum.bound_index().is_none() {
            return Ok(0);
        }
        if accum.bound_index() != Some(self.inner.instance_id) {
            return Err(Error::new(
                ErrorKind::InvalidState,
                "current txn is working with another index",
            ));
        }

        // Double-buffer limit: while a save runs, fresh commits may only
        // grow the RAM layer a fraction of the budget
        let limit = self.inner.settings.read().double_buffer_limit();
        while self.inner.save_running() && self.snapshot().ram_bytes() > limit {
            self.inner.wait_save_done();
        }

        let fingerprint = self.inner.schema.read().fingerprint();
        let (segment, kills) = accum.commit(fingerprint)?;
        if segment.is_none() && kills.is_empty() {
            return Ok(0);
        }

        let tid = self.inner.next_tid.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.txlog.append(&TxLogOp::Commit {
            tid,
            segment: segment.as_ref().map(|s| s.to_data()),
            kill_list: kills.iter().map(|d| d.0).collect(),
        })?;

        let inner = Arc::clone(&self.inner);
        let killed = self.inner.serial.run(move || {
            let killed = publish_commit(&inner, segment, &kills, tid);
            segment_merger::run_merge_cycle(&inner);
            killed
        });
        Ok(killed)
    }

    pub fn rollback(&self, accum: &mut Accumulator) {
        accum.rollback();
    }

    // --- queries ---

    pub fn multi_query(
        &self,
        tree: &QueryNode,
        args: &QueryArgs,
        sorters: &mut [MatchSorter],
    ) -> Result<QueryMeta> {
        let snapshot = self.snapshot();
        let schema = self.inner.schema.read().clone();
        let settings = self.inner.settings.read().clone();
        let dictionary = self.inner.dictionary.read();
        multi_query(
            &snapshot,
            &schema,
            &settings,
            dictionary.as_ref(),
            tree,
            args,
            sorters,
        )
    }

    /// Per-keyword document and hit statistics for query text
    pub fn get_keywords(&self, text: &str) -> Vec<KeywordStats> {
        let tokenizer = self.inner.tokenizer.read();
        let dictionary = self.inner.dictionary.read();
        let terms: Vec<TermNode> = tokenizer
            .tokenize(text)
            .into_iter()
            .map(|t| TermNode::new(dictionary.normalize(&t.text)))
            .collect();
        let settings = self.inner.settings.read().clone();
        keyword_stats(&self.snapshot(), &settings, dictionary.as_ref(), &terms)
    }

    // --- updates ---

    /// In-place attribute update across the whole dataset
    pub fn update_attributes(&self, batch: UpdateBatch) -> Result<UpdateResult> {
        self.inner.check_consistent()?;
        let inner = Arc::clone(&self.inner);
        let batch = Arc::new(batch);
        self.inner.serial.run(move || -> Result<UpdateResult> {
            let schema = inner.schema.read().clone();
            let resolved = resolve_batch(&schema, &batch)?;
            let snapshot = inner.dataset.snapshot();
            let mut result = UpdateResult::default();

            for segment in snapshot.segments.iter() {
                let part = apply_batch_to_view(&schema, segment.as_ref(), &batch, &resolved)?;
                result.affected += part.affected;
                result.warnings.extend(part.warnings);
                // A reserved segment replays the update onto the merge or
                // save output
                if segment.is_locked() {
                    segment.push_postponed(Arc::clone(&batch));
                }
            }

            // Newest chunk first, so a replaced doc's newest copy wins
            for chunk in snapshot.chunks.iter().rev() {
                let part = apply_batch_to_view(&schema, chunk.as_ref(), &batch, &resolved)?;
                if part.affected > 0
                    && let Err(err) = chunk.save_attrs()
                {
                    inner.inconsistent.store(true, Ordering::Release);
                    return Err(Error::new(
                        ErrorKind::Inconsistent,
                        format!("chunk {} attribute write failed: {err}", chunk.id()),
                    ));
                }
                result.affected += part.affected;
                result.warnings.extend(part.warnings);
                if chunk.is_optimizing() {
                    chunk.push_postponed(Arc::clone(&batch));
                }
            }

            let tid = inner.next_tid.fetch_add(1, Ordering::AcqRel) + 1;
            inner.committed_tid.fetch_max(tid, Ordering::AcqRel);
            inner.write_meta()?;
            Ok(result)
        })
    }

    // --- flush / maintenance ---

    /// Write the `.ram` snapshot so the RAM layer survives a restart
    pub fn force_ram_flush(&self, reason: &str) -> Result<()> {
        info!("RAM flush requested: {reason}");
        let inner = Arc::clone(&self.inner);
        self.inner.serial.run(move || -> Result<()> {
            let snapshot = inner.dataset.snapshot();
            ram_snapshot::save_ram(&inner.layout, &snapshot.segments)?;
            let tid = inner.committed_tid.load(Ordering::Acquire);
            inner.saved_tid.store(tid, Ordering::Release);
            inner.write_meta()?;
            inner.txlog.reset()?;
            *inner.last_flush.lock() = Some(Utc::now());
            Ok(())
        })
    }

    /// Promote the whole RAM layer into a new disk chunk
    pub fn force_disk_chunk(&self) -> Result<()> {
        self.inner.check_consistent()?;
        chunk_saver::save_disk_chunk(&self.inner, true)
    }

    pub fn is_flush_needed(&self) -> bool {
        self.inner.committed_tid.load(Ordering::Acquire)
            > self.inner.saved_tid.load(Ordering::Acquire)
    }

    /// Drop all data; idempotent
    pub fn truncate(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.inner.serial.run(move || -> Result<()> {
            let old = inner.dataset.snapshot();
            inner.dataset.swap(|_| DatasetSnapshot::default());
            for chunk in old.chunks.iter() {
                chunk.set_delete_on_drop();
            }
            ram_snapshot::delete_ram(&inner.layout);
            let tid = inner.next_tid.fetch_add(1, Ordering::AcqRel) + 1;
            inner.committed_tid.fetch_max(tid, Ordering::AcqRel);
            inner.saved_tid.store(tid, Ordering::Release);
            inner.write_meta()?;
            inner.txlog.reset()?;
            info!("index truncated");
            Ok(())
        })
    }

    pub fn optimize(&self, task: OptimizeTask) -> Result<()> {
        self.inner.check_consistent()?;
        optimizer::optimize(&self.inner, task)
    }

    /// Adopt a foreign chunk's files into this index; the new chunk
    /// becomes the newest layer and its doc ids are killed everywhere
    /// else, the way a commit kills replaced documents
    pub fn attach_disk_chunk(
        &self,
        source: &IndexLayout,
        source_id: u32,
        truncate_first: bool,
    ) -> Result<()> {
        self.inner.check_consistent()?;
        if truncate_first {
            self.truncate()?;
        }
        let new_id = self.inner.dataset.alloc_chunk_id();
        for ext in crate::chunk::CHUNK_FILE_EXTS {
            let from = source.chunk_path(source_id, ext);
            let to = self.inner.layout.chunk_path(new_id, ext);
            if let Err(err) = std::fs::rename(&from, &to) {
                // A partially moved chunk leaves both indexes suspect
                self.inner.inconsistent.store(true, Ordering::Release);
                return Err(Error::new(
                    ErrorKind::Inconsistent,
                    format!("attach failed moving {from:?}: {err}"),
                ));
            }
        }
        let chunk = DiskChunk::open(&self.inner.layout, new_id)?;

        let inner = Arc::clone(&self.inner);
        self.inner.serial.run(move || -> Result<()> {
            let snapshot = inner.dataset.snapshot();
            let attached_docs: Vec<DocId> = chunk.doc_ids().iter().map(|&d| DocId(d)).collect();
            for segment in snapshot.segments.iter() {
                segment.kill_multi(&attached_docs);
            }
            for old_chunk in snapshot.chunks.iter() {
                if old_chunk.kill_multi(&attached_docs) > 0 {
                    old_chunk.save_deadmap()?;
                }
            }
            inner.dataset.swap(|current| {
                let mut chunks = current.chunks.as_ref().clone();
                chunks.push(Arc::clone(&chunk));
                DatasetSnapshot {
                    chunks: Arc::new(chunks),
                    segments: Arc::clone(&current.segments),
                }
            });
            inner.write_meta()
        })
    }

    // --- schema changes ---

    /// Add or remove a row-wise attribute. Needs a quiescent RAM layer,
    /// so the RAM chunk is saved first; every chunk's attribute file is
    /// rewritten under the new layout.
    pub fn add_remove_attribute(&self, add: bool, name: &str, ty: AttrType) -> Result<()> {
        self.inner.check_consistent()?;
        self.force_disk_chunk()?;

        let old_schema = self.inner.schema.read().clone();
        let new_schema = if add {
            if old_schema.attr_index(name).is_some() {
                return Err(Error::invalid(format!("attribute '{name}' already exists")));
            }
            let mut attrs = old_schema.attrs.clone();
            attrs.push(AttrDef::new(name, ty));
            Schema::new(attrs, old_schema.fields.clone())?
        } else {
            let idx = old_schema
                .attr_index(name)
                .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no attribute '{name}'")))?;
            if idx == 0 {
                return Err(Error::invalid("the document id attribute cannot be removed"));
            }
            if old_schema.attrs[idx].columnar {
                return Err(Error::invalid(
                    "columnar attribute changes require a rebuild",
                ));
            }
            let mut attrs = old_schema.attrs.clone();
            attrs.remove(idx);
            Schema::new(attrs, old_schema.fields.clone())?
        };

        let inner = Arc::clone(&self.inner);
        let old = old_schema.clone();
        let new = new_schema.clone();
        self.inner.serial.run(move || -> Result<()> {
            let snapshot = inner.dataset.snapshot();
            for chunk in snapshot.chunks.iter() {
                chunk.transform_rows(&old, &new)?;
            }
            *inner.schema.write() = new.clone();
            let tid = inner.next_tid.fetch_add(1, Ordering::AcqRel) + 1;
            inner.committed_tid.fetch_max(tid, Ordering::AcqRel);
            inner.write_meta()
        })
    }

    /// Add or remove a full-text field. Existing postings for a removed
    /// field survive until segments are rebuilt by merges.
    pub fn add_remove_field(&self, add: bool, name: &str) -> Result<()> {
        self.inner.check_consistent()?;
        let inner = Arc::clone(&self.inner);
        let name = name.to_string();
        self.inner.serial.run(move || -> Result<()> {
            let mut schema = inner.schema.write();
            if add {
                if schema.field_index(&name).is_some() {
                    return Err(Error::invalid(format!("field '{name}' already exists")));
                }
                let mut fields = schema.fields.clone();
                fields.push(crate::core::types::FieldDef::new(&name));
                *schema = Schema::new(schema.attrs.clone(), fields)?;
            } else {
                let idx = schema
                    .field_index(&name)
                    .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no field '{name}'")))?;
                let mut fields = schema.fields.clone();
                fields.remove(idx);
                *schema = Schema::new(schema.attrs.clone(), fields)?;
            }
            drop(schema);
            let tid = inner.next_tid.fetch_add(1, Ordering::AcqRel) + 1;
            inner.committed_tid.fetch_max(tid, Ordering::AcqRel);
            inner.write_meta()
        })
    }

    /// Swap tokenizer/dictionary/index settings. The RAM layer is saved
    /// first so every live segment was built under one settings set.
    pub fn reconfigure(
        &self,
        settings: RtSettings,
        tokenizer: Option<Box<dyn Tokenizer>>,
        dictionary: Option<Box<dyn Dictionary>>,
    ) -> Result<()> {
        self.inner.check_consistent()?;
        let unchanged = *self.inner.settings.read() == settings
            && tokenizer.is_none()
            && dictionary.is_none();
        if unchanged {
            return Ok(());
        }
        self.force_disk_chunk()?;

        let inner = Arc::clone(&self.inner);
        self.inner.serial.run(move || -> Result<()> {
            *inner.settings.write() = settings.clone();
            if let Some(tokenizer) = tokenizer {
                *inner.tokenizer.write() = tokenizer;
            }
            if let Some(dictionary) = dictionary {
                *inner.dictionary.write() = dictionary;
            }
            let tid = inner.next_tid.fetch_add(1, Ordering::AcqRel) + 1;
            inner.committed_tid.fetch_max(tid, Ordering::AcqRel);
            inner.txlog.append(&TxLogOp::Reconfigure {
                tid,
                settings: settings.clone(),
                tokenizer_hash: inner.tokenizer.read().settings_hash(),
                dictionary_hash: inner.dictionary.read().settings_hash(),
            })?;
            save_settings_overlay(&inner.layout, &settings)?;
            inner.write_meta()
        })
    }

    // --- introspection ---

    pub fn get_status(&self) -> IndexStatus {
        let snapshot = self.snapshot();
        IndexStatus {
            total_documents: snapshot.total_alive(),
            ram_segment_count: snapshot.segments.len(),
            disk_chunk_count: snapshot.chunks.len(),
            ram_segment_bytes: snapshot.ram_bytes(),
            soft_ram_limit: self.inner.settings.read().soft_ram_limit,
            committed_tid: self.inner.committed_tid.load(Ordering::Acquire),
            saved_tid: self.inner.saved_tid.load(Ordering::Acquire),
            locked_segments: snapshot.segments.iter().filter(|s| s.is_locked()).count(),
            last_flush: *self.inner.last_flush.lock(),
            started_at: self.inner.started_at,
        }
    }

    /// Structural self-check over every segment and chunk; returns one
    /// description per detected failure
    pub fn check(&self) -> Vec<String> {
        let snapshot = self.snapshot();
        let mut failures = Vec::new();
        for (idx, segment) in snapshot.segments.iter().enumerate() {
            check_view(segment.as_ref(), &format!("ram segment {idx}"), &mut failures);
        }
        for chunk in snapshot.chunks.iter() {
            check_view(
                chunk.as_ref(),
                &format!("disk chunk {}", chunk.id()),
                &mut failures,
            );
        }
        failures
    }

    // --- internals ---

    /// Field-filter, tokenize and position-pack every field of a doc
    fn tokenize_fields(&self, doc: &Document) -> Result<Vec<(String, u32)>> {
        let tokenizer = self.inner.tokenizer.read();
        let dictionary = self.inner.dictionary.read();
        let field_filter = self.inner.field_filter.read();

        let mut terms = Vec::new();
        for (field_idx, raw_text) in doc.fields.iter().enumerate() {
            let filtered;
            let text: &str = match field_filter.as_ref() {
                Some(filter) => {
                    filtered = filter.apply(raw_text, false);
                    &filtered
                }
                None => raw_text,
            };

            let tokens = tokenizer.tokenize(text);
            let field_terms_start = terms.len();
            for token in tokens {
                let normalized = dictionary.normalize(&token.text);
                if normalized.is_empty() || dictionary.is_stopword(normalized.as_bytes()) {
                    continue;
                }
                let position = pack_position(field_idx as u32, token.position.min(MAX_FIELD_POS));
                terms.push((normalized, position));
            }
            // Flag the last token of the field for exact-hit ranking
            if let Some(last) = terms.len().checked_sub(1)
                && last >= field_terms_start
            {
                terms[last].1 = position_set_field_end(terms[last].1);
            }
        }
        Ok(terms)
    }
}

/// Apply one commit to the dataset: kills hit every pre-existing segment
/// and chunk, the new segment is appended, and everything becomes
/// visible in a single pointer swap. Runs on the serial executor.
pub fn publish_commit(
    inner: &Arc<IndexInner>,
    segment: Option<Arc<RamSegment>>,
    kills: &[DocId],
    tid: u64,
) -> u64 {
    let snapshot = inner.dataset.snapshot();
    let mut killed = 0u64;
    for old_segment in snapshot.segments.iter() {
        killed += old_segment.kill_multi(kills) as u64;
    }
    for chunk in snapshot.chunks.iter() {
        killed += chunk.kill_multi(kills) as u64;
    }

    inner.dataset.swap(|current| {
        let mut segments = current.segments.as_ref().clone();
        if let Some(segment) = &segment {
            segments.push(Arc::clone(segment));
        }
        DatasetSnapshot {
            chunks: Arc::clone(&current.chunks),
            segments: Arc::new(segments),
        }
    });
    inner.committed_tid.fetch_max(tid, Ordering::AcqRel);
    killed
}

fn check_view(view: &dyn PostingsView, label: &str, failures: &mut Vec<String>) {
    // Checkpoint offsets must strictly increase
    let checkpoints = view.checkpoints();
    for pair in checkpoints.windows(2) {
        if pair[1].offset <= pair[0].offset {
            failures.push(format!("{label}: checkpoint offsets not increasing"));
        }
        if pair[1].key <= pair[0].key {
            failures.push(format!("{label}: checkpoint keys not increasing"));
        }
    }

    // Dictionary walk: keys ascend, doclists stay in bounds
    let mut last_key = None;
    for entry in crate::codec::wordlist::iter_words(view.words(), checkpoints, view.dict_mode()) {
        if let Some(last) = &last_key
            && entry.key <= *last
        {
            failures.push(format!("{label}: dictionary keys not ascending"));
            break;
        }
        if entry.doclist_offset as usize > view.docs().len() {
            failures.push(format!("{label}: doclist offset out of range"));
            break;
        }
        let mut decoded = 0u32;
        for doc in crate::codec::doclist::DoclistReader::new(
            view.docs(),
            entry.doclist_offset as usize,
            entry.doc_count,
        ) {
            decoded += 1;
            if doc.row_id >= view.row_count() {
                failures.push(format!("{label}: rowid {} out of range", doc.row_id));
                break;
            }
            if let crate::codec::doclist::HitRef::Offset(offset) = doc.hit_ref
                && doc.hit_count > 1
                && offset as usize >= view.hits().len()
            {
                failures.push(format!("{label}: hitlist offset out of range"));
            }
        }
        if decoded != entry.doc_count {
            failures.push(format!(
                "{label}: doclist truncated ({decoded} of {} docs)",
                entry.doc_count
            ));
        }
        last_key = Some(entry.key);
    }

    // The alive counter must agree with the deadmap
    let dead = (0..view.row_count())
        .filter(|&row| view.is_row_dead(row))
        .count() as u32;
    if view.alive_rows() != view.row_count() - dead {
        failures.push(format!(
            "{label}: alive counter {} disagrees with deadmap ({} dead of {})",
            view.alive_rows(),
            dead,
            view.row_count()
        ));
    }
}

fn save_settings_overlay(layout: &IndexLayout, settings: &RtSettings) -> Result<()> {
    write_file(
        &layout.settings_path(),
        SETTINGS_MAGIC,
        SETTINGS_VERSION,
        &bincode::serialize(settings)?,
    )
}

fn load_settings_overlay(layout: &IndexLayout) -> Result<Option<RtSettings>> {
    let path = layout.settings_path();
    if !path.exists() {
        return Ok(None);
    }
    let body = read_file(&path, SETTINGS_MAGIC, SETTINGS_VERSION)?;
    Ok(Some(bincode::deserialize(&body)?))
}

impl Drop for RtIndex {
    fn drop(&mut self) {
        // Stop background work and drain both executors while this
        // handle still pins the inner state, so the executors are not
        // torn down from their own threads
        self.inner.stop.send();
        self.inner.merger.run(|| {});
        self.inner.serial.run(|| {});
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{PlainDictionary, WhitespaceTokenizer};
    use crate::core::types::{AttrValue, FieldDef};
    use crate::search::sorter::{SortKey, StoredMatch};
    use tempfile::TempDir;

    fn test_schema() -> Schema {
        Schema::new(
            vec![AttrDef::new("price", AttrType::Uint)],
            vec![FieldDef::new("title")],
        )
        .unwrap()
    }

    fn open_index(dir: &TempDir, settings: RtSettings) -> RtIndex {
        RtIndex::open(
            IndexLayout::new(dir.path().join("idx")),
            test_schema(),
            settings,
            Box::new(WhitespaceTokenizer),
            Box::new(PlainDictionary::default()),
            None,
        )
        .unwrap()
    }

    fn insert(index: &RtIndex, accum: &mut Accumulator, id: u64, title: &str, price: u32) {
        let doc = Document::new(DocId(id))
            .with_attr(AttrValue::Uint(price))
            .with_field(title);
        index.add_document(accum, &doc, false).unwrap();
    }

    fn search(index: &RtIndex, tree: &QueryNode) -> (Vec<StoredMatch>, QueryMeta) {
        let mut sorters = vec![MatchSorter::new(
            2000,
            SortKey::Score,
            vec!["price".to_string()],
        )];
        let meta = index
            .multi_query(tree, &QueryArgs::default(), &mut sorters)
            .unwrap();
        (sorters.pop().unwrap().into_sorted(), meta)
    }

    fn word(text: &str) -> QueryNode {
        QueryNode::Term(TermNode::new(text))
    }

    #[test]
    fn test_basic_insert_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(&dir, RtSettings::default());
        let mut accum = Accumulator::new();
        insert(&index, &mut accum, 1, "hello world", 10);
        index.commit(&mut accum).unwrap();

        let (matches, meta) = search(&index, &word("hello"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].doc, DocId(1));
        assert_eq!(matches[0].values, vec![AttrValue::Uint(10)]);
        assert!(matches[0].score > 0.0);
        assert_eq!(meta.total_matches, 1);
        assert_eq!(meta.per_keyword.len(), 1);
        assert_eq!(meta.per_keyword[0].docs, 1);
        assert!(index.check().is_empty());
    }

    #[test]
    fn test_replace_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(&dir, RtSettings::default());
        let mut accum = Accumulator::new();
        insert(&index, &mut accum, 1, "a", 1);
        index.commit(&mut accum).unwrap();

        let doc = Document::new(DocId(1))
            .with_attr(AttrValue::Uint(2))
            .with_field("b");
        index.add_document(&mut accum, &doc, true).unwrap();
        let killed = index.commit(&mut accum).unwrap();
        assert_eq!(killed, 1);

        let (a_matches, _) = search(&index, &word("a"));
        assert!(a_matches.is_empty());
        let (b_matches, _) = search(&index, &word("b"));
        assert_eq!(b_matches.len(), 1);
        assert_eq!(b_matches[0].values, vec![AttrValue::Uint(2)]);
        assert_eq!(index.total_documents(), 1);
    }

    #[test]
    fn test_kill_across_layers() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(&dir, RtSettings::default());
        let mut accum = Accumulator::new();
        for id in 1..=1000u64 {
            insert(&index, &mut accum, id, "common term", id as u32);
        }
        index.commit(&mut accum).unwrap();
        index.force_disk_chunk().unwrap();
        assert_eq!(index.snapshot().chunks.len(), 1);
        assert!(index.snapshot().segments.is_empty());

        let victims: Vec<DocId> = (1..=500).map(DocId).collect();
        index.delete_document(&mut accum, &victims).unwrap();
        let killed = index.commit(&mut accum).unwrap();
        assert_eq!(killed, 500);

        let (matches, meta) = search(&index, &QueryNode::MatchAll);
        assert_eq!(meta.total_matches, 500);
        assert_eq!(matches.len(), 500);
        assert!(matches.iter().all(|m| m.doc.0 >= 501));
        assert!(index.check().is_empty());
    }

    #[test]
    fn test_update_persists_across_flush_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = open_index(&dir, RtSettings::default());
            let mut accum = Accumulator::new();
            insert(&index, &mut accum, 1, "hello", 10);
            index.commit(&mut accum).unwrap();

            let result = index
                .update_attributes(UpdateBatch {
                    attrs: vec!["price".into()],
                    docs: vec![DocId(1)],
                    values: vec![vec![AttrValue::Uint(99)]],
                    strict: true,
                })
                .unwrap();
            assert_eq!(result.affected, 1);

            let (matches, _) = search(&index, &word("hello"));
            assert_eq!(matches[0].values, vec![AttrValue::Uint(99)]);

            index.force_disk_chunk().unwrap();
            let (matches, _) = search(&index, &word("hello"));
            assert_eq!(matches[0].values, vec![AttrValue::Uint(99)]);
        }

        // Reload from disk
        let index = open_index(&dir, RtSettings::default());
        let (matches, _) = search(&index, &word("hello"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].values, vec![AttrValue::Uint(99)]);
    }

    #[test]
    fn test_infix_query() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RtSettings {
            min_infix_len: 2,
            ..RtSettings::default()
        };
        let index = open_index(&dir, settings);
        let mut accum = Accumulator::new();
        for (id, title) in [(1, "alpha"), (2, "beta"), (3, "alphanumeric"), (4, "numeric")] {
            insert(&index, &mut accum, id, title, 0);
        }
        index.commit(&mut accum).unwrap();

        let (matches, _) = search(&index, &word("*lpha*"));
        let mut docs: Vec<u64> = matches.iter().map(|m| m.doc.0).collect();
        docs.sort_unstable();
        assert_eq!(docs, vec![1, 3]);

        // Prefix form through the same path
        let settings = RtSettings {
            min_infix_len: 2,
            min_prefix_len: 2,
            ..index.settings()
        };
        index.reconfigure(settings, None, None).unwrap();
        let (matches, _) = search(&index, &word("alpha*"));
        let mut docs: Vec<u64> = matches.iter().map(|m| m.doc.0).collect();
        docs.sort_unstable();
        assert_eq!(docs, vec![1, 3]);
    }

    #[test]
    fn test_truncate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(&dir, RtSettings::default());
        let mut accum = Accumulator::new();
        insert(&index, &mut accum, 1, "gone", 1);
        index.commit(&mut accum).unwrap();
        index.force_disk_chunk().unwrap();
        insert(&index, &mut accum, 2, "gone too", 2);
        index.commit(&mut accum).unwrap();

        index.truncate().unwrap();
        index.truncate().unwrap();
        assert_eq!(index.total_documents(), 0);
        let snapshot = index.snapshot();
        assert!(snapshot.chunks.is_empty());
        assert!(snapshot.segments.is_empty());
        let (matches, _) = search(&index, &QueryNode::MatchAll);
        assert!(matches.is_empty());
    }

    #[test]
    fn test_ram_snapshot_reload_matches_disk_reload() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        let fill = |index: &RtIndex| {
            let mut accum = Accumulator::new();
            for id in 1..=20u64 {
                insert(index, &mut accum, id, "stable content here", id as u32 * 3);
            }
            index.commit(&mut accum).unwrap();
        };

        // Path A: RAM snapshot, then reload
        {
            let index = open_index(&dir_a, RtSettings::default());
            fill(&index);
            index.force_ram_flush("test").unwrap();
        }
        // Path B: promoted to a disk chunk, then reload
        {
            let index = open_index(&dir_b, RtSettings::default());
            fill(&index);
            index.force_disk_chunk().unwrap();
        }

        let collect = |dir: &TempDir| -> Vec<(u64, Vec<AttrValue>)> {
            let index = open_index(dir, RtSettings::default());
            let (matches, _) = search(&index, &word("stable"));
            let mut rows: Vec<(u64, Vec<AttrValue>)> =
                matches.into_iter().map(|m| (m.doc.0, m.values)).collect();
            rows.sort_by_key(|(doc, _)| *doc);
            rows
        };
        assert_eq!(collect(&dir_a), collect(&dir_b));
    }

    #[test]
    fn test_txlog_recovery_replays_commits() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = open_index(&dir, RtSettings::default());
            let mut accum = Accumulator::new();
            insert(&index, &mut accum, 7, "durable words", 70);
            index.commit(&mut accum).unwrap();
            // No flush: the commit only lives in the transaction log
        }
        let index = open_index(&dir, RtSettings::default());
        let (matches, _) = search(&index, &word("durable"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].doc, DocId(7));
        assert_eq!(matches[0].values, vec![AttrValue::Uint(70)]);
        assert!(index.check().is_empty());
    }

    #[test]
    fn test_phrase_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(&dir, RtSettings::default());
        let mut accum = Accumulator::new();
        insert(&index, &mut accum, 1, "quick brown fox", 5);
        insert(&index, &mut accum, 2, "brown quick fox", 50);
        index.commit(&mut accum).unwrap();

        let phrase = QueryNode::Phrase(vec![TermNode::new("quick"), TermNode::new("brown")]);
        let (matches, _) = search(&index, &phrase);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].doc, DocId(1));

        // Attribute filter on top of a bag-of-words match
        let mut sorters = vec![MatchSorter::new(10, SortKey::Score, vec![])];
        let args = QueryArgs {
            filters: vec![crate::search::QueryFilter {
                attr: "price".into(),
                op: crate::search::FilterOp::Range { min: 10, max: 100 },
                exclude: false,
            }],
            ..QueryArgs::default()
        };
        index
            .multi_query(&word("fox"), &args, &mut sorters)
            .unwrap();
        let matches = sorters.pop().unwrap().into_sorted();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].doc, DocId(2));
    }

    #[test]
    fn test_add_remove_attribute() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(&dir, RtSettings::default());
        let mut accum = Accumulator::new();
        insert(&index, &mut accum, 1, "thing", 10);
        index.commit(&mut accum).unwrap();

        index
            .add_remove_attribute(true, "stock", AttrType::Uint)
            .unwrap();
        // New attribute reads as zero on pre-existing rows
        let mut sorters = vec![MatchSorter::new(
            10,
            SortKey::Score,
            vec!["price".into(), "stock".into()],
        )];
        index
            .multi_query(&word("thing"), &QueryArgs::default(), &mut sorters)
            .unwrap();
        let matches = sorters.pop().unwrap().into_sorted();
        assert_eq!(
            matches[0].values,
            vec![AttrValue::Uint(10), AttrValue::Uint(0)]
        );

        index.add_remove_attribute(false, "stock", AttrType::Uint).unwrap();
        assert!(index.schema().attr_index("stock").is_none());
        assert!(index.check().is_empty());
    }

    #[test]
    fn test_optimize_merges_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(&dir, RtSettings::default());
        let mut accum = Accumulator::new();
        for batch in 0..3u64 {
            for id in 1..=10u64 {
                insert(
                    &index,
                    &mut accum,
                    batch * 100 + id,
                    "spread across chunks",
                    id as u32,
                );
            }
            index.commit(&mut accum).unwrap();
            index.force_disk_chunk().unwrap();
        }
        assert_eq!(index.snapshot().chunks.len(), 3);

        index.optimize(OptimizeTask::Classic).unwrap();
        assert_eq!(index.snapshot().chunks.len(), 1);
        assert_eq!(index.total_documents(), 30);
        let (matches, _) = search(&index, &word("spread"));
        assert_eq!(matches.len(), 30);
        assert!(index.check().is_empty());
    }

    #[test]
    fn test_status_reflects_state() {
        let dir = tempfile::tempdir().unwrap();
        let index = open_index(&dir, RtSettings::default());
        let mut accum = Accumulator::new();
        insert(&index, &mut accum, 1, "status", 1);
        index.commit(&mut accum).unwrap();

        let status = index.get_status();
        assert_eq!(status.total_documents, 1);
        assert_eq!(status.ram_segment_count, 1);
        assert_eq!(status.disk_chunk_count, 0);
        assert!(status.flush_needed());
        assert!(index.is_flush_needed());

        index.force_disk_chunk().unwrap();
        let status = index.get_status();
        assert_eq!(status.disk_chunk_count, 1);
        assert!(!status.flush_needed());
    }
}
