use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::codec::varint::ByteReader;
use crate::codec::wordlist::{Checkpoint, read_checkpoints, write_checkpoints};
use crate::core::config::DictMode;
use crate::core::error::{Error, Result};
use crate::core::globals::Globals;
use crate::core::types::{DocId, RowId};
use crate::segment::blob::BlobPool;
use crate::segment::columnar::SimpleColumnar;
use crate::segment::data::SegmentData;
use crate::segment::deadmap::DeadRowMap;
use crate::segment::docstore::DocStore;
use crate::segment::infix_bloom::InfixBloom;
use crate::segment::{AttrStore, KillHook, PostingsView};
use crate::update::UpdateBatch;

/// Everything the accumulator (or a merger) hands over to create one
/// segment. The segment takes ownership of every buffer.
pub struct SegmentParts {
    pub dict_mode: DictMode,
    pub words: Vec<u8>,
    pub checkpoints: Vec<Checkpoint>,
    pub word_count: u64,
    pub docs: Vec<u8>,
    pub hits: Vec<u8>,
    pub total_hits: u64,
    pub rows: Vec<u32>,
    pub stride: usize,
    pub row_count: u32,
    pub blobs: BlobPool,
    pub deadmap: DeadRowMap,
    pub columnar: Vec<SimpleColumnar>,
    pub docstore: Option<DocStore>,
    pub bloom: Option<InfixBloom>,
}

/// In-memory inverted index plus row store for one commit's worth of
/// documents. Posting lists, the docid map and the deadmap shape are
/// frozen at publication; attribute cells, blob payloads, deadmap bits
/// and the postponed-update queue stay mutable.
pub struct RamSegment {
    dict_mode: DictMode,
    words: Vec<u8>,
    checkpoints: Vec<Checkpoint>,
    word_count: u64,
    docs: Vec<u8>,
    hits: Vec<u8>,
    total_hits: u64,
    row_count: u32,
    attrs: RwLock<AttrStore>,
    deadmap: DeadRowMap,
    alive_rows: AtomicU32,
    docid_map: HashMap<u64, RowId>,
    columnar: Vec<SimpleColumnar>,
    docstore: Option<DocStore>,
    bloom: Option<InfixBloom>,
    /// Ticket of the merge/save currently holding this segment; 0 if free
    locked_by_op: AtomicU64,
    kill_hook: Mutex<Option<Arc<KillHook>>>,
    postponed: Mutex<Vec<Arc<UpdateBatch>>>,
    cached_ram: AtomicI64,
}

impl RamSegment {
    /// Finalize a fully populated segment. Builds the docid→rowid map
    /// (exactly once, before publication) and registers the segment's RAM
    /// footprint with the process-wide counter.
    pub fn build(parts: SegmentParts) -> Arc<Self> {
        let mut docid_map = HashMap::with_capacity(parts.row_count as usize);
        for row_id in 0..parts.row_count {
            let start = row_id as usize * parts.stride;
            let docid = crate::core::types::read_u64_cells(&parts.rows[start..], 0);
            docid_map.insert(docid, row_id);
        }

        let alive = parts.row_count - parts.deadmap.dead_count();
        let segment = RamSegment {
            dict_mode: parts.dict_mode,
            words: parts.words,
            checkpoints: parts.checkpoints,
            word_count: parts.word_count,
            docs: parts.docs,
            hits: parts.hits,
            total_hits: parts.total_hits,
            row_count: parts.row_count,
            attrs: RwLock::new(AttrStore::new(parts.rows, parts.blobs, parts.stride)),
            deadmap: parts.deadmap,
            alive_rows: AtomicU32::new(alive),
            docid_map,
            columnar: parts.columnar,
            docstore: parts.docstore,
            bloom: parts.bloom,
            locked_by_op: AtomicU64::new(0),
            kill_hook: Mutex::new(None),
            postponed: Mutex::new(Vec::new()),
            cached_ram: AtomicI64::new(0),
        };
        segment.used_ram();
        Arc::new(segment)
    }

    pub fn word_count(&self) -> u64 {
        self.word_count
    }

    pub fn total_hits(&self) -> u64 {
        self.total_hits
    }

    /// Rowid of a doc that exists and is not killed
    pub fn find_alive_row(&self, doc: DocId) -> Option<RowId> {
        let row_id = *self.docid_map.get(&doc.0)?;
        if self.deadmap.is_dead(row_id) {
            None
        } else {
            Some(row_id)
        }
    }

    /// Kill one doc; notifies the installed kill hook so a concurrent
    /// merge or save can replay the kill into its output
    pub fn kill(&self, doc: DocId) -> bool {
        let Some(row_id) = self.docid_map.get(&doc.0).copied() else {
            return false;
        };
        if !self.deadmap.kill(row_id) {
            return false;
        }
        self.alive_rows.fetch_sub(1, Ordering::AcqRel);
        if let Some(hook) = self.kill_hook.lock().as_ref() {
            hook.record(doc);
        }
        true
    }

    pub fn kill_multi(&self, docs: &[DocId]) -> u32 {
        docs.iter().filter(|&&doc| self.kill(doc)).count() as u32
    }

    /// Recompute the byte footprint, refresh the cached value, and adjust
    /// the process-wide RAM counter by the difference
    pub fn used_ram(&self) -> i64 {
        let attrs = self.attrs.read();
        let mut bytes = self.words.len()
            + self.docs.len()
            + self.hits.len()
            + attrs.rows.len() * 4
            + attrs.blobs.bytes_len()
            + self.deadmap.memory_bytes()
            + self.docid_map.len() * 16
            + self.checkpoints.len() * 24;
        drop(attrs);
        bytes += self.columnar.iter().map(|c| c.memory_bytes()).sum::<usize>();
        if let Some(store) = &self.docstore {
            bytes += store.memory_bytes();
        }
        if let Some(bloom) = &self.bloom {
            bytes += bloom.memory_bytes();
        }
        let bytes = bytes as i64;
        let previous = self.cached_ram.swap(bytes, Ordering::AcqRel);
        Globals::adjust_ram(bytes - previous);
        bytes
    }

    pub fn cached_ram(&self) -> i64 {
        self.cached_ram.load(Ordering::Acquire)
    }

    // --- merge/save reservation ---

    /// Reserve this segment for operation `ticket`; fails if another
    /// merge or save already claimed it
    pub fn try_lock_op(&self, ticket: u64) -> bool {
        self.locked_by_op
            .compare_exchange(0, ticket, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn unlock_op(&self) {
        self.locked_by_op.store(0, Ordering::Release);
    }

    pub fn locked_ticket(&self) -> u64 {
        self.locked_by_op.load(Ordering::Acquire)
    }

    pub fn is_locked(&self) -> bool {
        self.locked_ticket() != 0
    }

    pub fn install_kill_hook(&self, hook: Arc<KillHook>) {
        *self.kill_hook.lock() = Some(hook);
    }

    pub fn clear_kill_hook(&self) {
        *self.kill_hook.lock() = None;
    }

    /// Queue an update that arrived while this segment was reserved; the
    /// reserving operation replays it onto its output
    pub fn push_postponed(&self, batch: Arc<UpdateBatch>) {
        self.postponed.lock().push(batch);
    }

    pub fn drain_postponed(&self) -> Vec<Arc<UpdateBatch>> {
        std::mem::take(&mut *self.postponed.lock())
    }

    // --- snapshot serialization ---

    pub fn to_data(&self) -> SegmentData {
        let attrs = self.attrs.read();
        let mut checkpoints = Vec::new();
        write_checkpoints(&mut checkpoints, &self.checkpoints);
        SegmentData {
            dict_mode: self.dict_mode,
            row_count: self.row_count,
            stride: attrs.stride() as u32,
            word_count: self.word_count,
            total_hits: self.total_hits,
            words: self.words.clone(),
            checkpoints,
            docs: self.docs.clone(),
            hits: self.hits.clone(),
            rows: attrs.rows.clone(),
            deadmap: self.deadmap.to_words(),
            blobs: attrs.blobs.raw().to_vec(),
            columnar: self.columnar.iter().map(|c| c.to_values()).collect(),
            docstore: self.docstore.clone(),
            bloom: self
                .bloom
                .as_ref()
                .map(|b| (b.raw().to_vec(), b.per_entry(), b.hashes())),
        }
    }

    pub fn from_data(data: SegmentData) -> Result<Arc<Self>> {
        let checkpoints = read_checkpoints(&mut ByteReader::new(&data.checkpoints))
            .ok_or_else(|| Error::corrupted("bad segment checkpoint block"))?;
        Ok(Self::build(SegmentParts {
            dict_mode: data.dict_mode,
            words: data.words,
            checkpoints,
            word_count: data.word_count,
            docs: data.docs,
            hits: data.hits,
            total_hits: data.total_hits,
            rows: data.rows,
            stride: data.stride as usize,
            row_count: data.row_count,
            blobs: BlobPool::from_raw(data.blobs),
            deadmap: DeadRowMap::from_words(data.deadmap, data.row_count),
            columnar: data
                .columnar
                .into_iter()
                .map(SimpleColumnar::from_values)
                .collect(),
            docstore: data.docstore,
            bloom: data
                .bloom
                .map(|(bits, per_entry, hashes)| InfixBloom::from_parts(bits, per_entry, hashes)),
        }))
    }
}

impl Drop for RamSegment {
    fn drop(&mut self) {
        Globals::adjust_ram(-self.cached_ram.load(Ordering::Acquire));
    }
}

impl PostingsView for RamSegment {
    fn dict_mode(&self) -> DictMode {
        self.dict_mode
    }

    fn words(&self) -> &[u8] {
        &self.words
    }

    fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    fn docs(&self) -> &[u8] {
        &self.docs
    }

    fn hits(&self) -> &[u8] {
        &self.hits
    }

    fn row_count(&self) -> u32 {
        self.row_count
    }

    fn alive_rows(&self) -> u32 {
        self.alive_rows.load(Ordering::Acquire)
    }

    fn total_hits(&self) -> u64 {
        self.total_hits
    }

    fn is_row_dead(&self, row_id: RowId) -> bool {
        self.deadmap.is_dead(row_id)
    }

    fn rowid_of(&self, doc: DocId) -> Option<RowId> {
        self.docid_map.get(&doc.0).copied()
    }

    fn attrs(&self) -> &RwLock<AttrStore> {
        &self.attrs
    }

    fn columnar(&self) -> &[SimpleColumnar] {
        &self.columnar
    }

    fn docstore(&self) -> Option<&DocStore> {
        self.docstore.as_ref()
    }

    fn infix_bloom(&self) -> Option<&InfixBloom> {
        self.bloom.as_ref()
    }
}

impl std::fmt::Debug for RamSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RamSegment")
            .field("rows", &self.row_count)
            .field("alive", &self.alive_rows.load(Ordering::Relaxed))
            .field("words", &self.word_count)
            .field("locked_by_op", &self.locked_ticket())
            .finish()
    }
}
