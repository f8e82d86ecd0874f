use std::fs::File;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use log::{debug, warn};
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};

use crate::chunk::{
    CHUNK_ATTR_MAGIC, CHUNK_DATA_MAGIC, CHUNK_DEAD_MAGIC, CHUNK_FORMAT_VERSION, CHUNK_INFO_MAGIC,
    ChunkAttrsData, ChunkInfo,
};
use crate::codec::skiplist::{SkiplistEntry, read_skiplist_block};
use crate::codec::varint::ByteReader;
use crate::codec::wordlist::{Checkpoint, read_checkpoints};
use crate::core::config::DictMode;
use crate::core::error::{Error, Result};
use crate::core::types::{DocId, RowId};
use crate::segment::blob::BlobPool;
use crate::segment::columnar::SimpleColumnar;
use crate::segment::deadmap::DeadRowMap;
use crate::segment::docstore::DocStore;
use crate::segment::infix_bloom::InfixBloom;
use crate::segment::{AttrStore, KillHook, PostingsView};
use crate::storage::files::{read_file, write_file};
use crate::storage::layout::IndexLayout;
use crate::update::UpdateBatch;

const FRAME_HEADER_LEN: usize = 12;

/// Reference-counted handle over one immutable on-disk chunk. Posting
/// payload stays memory-mapped; attributes are loaded for in-place
/// updates and written back on demand. Dropping the last handle with the
/// delete flag set unlinks every chunk file.
pub struct DiskChunk {
    id: u32,
    layout: IndexLayout,
    dict_mode: DictMode,
    words: Vec<u8>,
    checkpoints: Vec<Checkpoint>,
    word_count: u64,
    total_hits: u64,
    /// Sorted doc ids; a doc's rowid is its position here
    docids: Vec<u64>,
    row_count: u32,
    mmap: Mmap,
    docs_range: (usize, usize),
    hits_range: (usize, usize),
    skiplist: Vec<u8>,
    skiplist_dir: Vec<(u64, u64)>,
    attrs: RwLock<AttrStore>,
    columnar: Vec<SimpleColumnar>,
    docstore: Option<DocStore>,
    bloom: Option<InfixBloom>,
    deadmap: DeadRowMap,
    alive: AtomicU32,
    disk_bytes: u64,
    /// Claimed by an optimize verb; authoritative for optimizer mutual
    /// exclusion (the attrs RW lock only arbitrates updates vs readers)
    optimizing: AtomicBool,
    delete_on_drop: AtomicBool,
    kill_hook: Mutex<Option<Arc<KillHook>>>,
    postponed: Mutex<Vec<Arc<UpdateBatch>>>,
}

impl DiskChunk {
    pub fn open(layout: &IndexLayout, id: u32) -> Result<Arc<Self>> {
        let info_body = read_file(
            &layout.chunk_path(id, "spi"),
            CHUNK_INFO_MAGIC,
            CHUNK_FORMAT_VERSION,
        )?;
        let info: ChunkInfo = bincode::deserialize(&info_body)?;

        let data_path = layout.chunk_path(id, "spd");
        let data_file = File::open(&data_path)?;
        let mmap = unsafe { Mmap::map(&data_file)? };
        if mmap.len() < FRAME_HEADER_LEN
            || mmap[0..4] != CHUNK_DATA_MAGIC.to_le_bytes()
            || mmap.len() - FRAME_HEADER_LEN != (info.docs_len + info.hits_len) as usize
        {
            return Err(Error::corrupted(format!("{data_path:?}: bad payload file")));
        }

        let attr_body = read_file(
            &layout.chunk_path(id, "spa"),
            CHUNK_ATTR_MAGIC,
            CHUNK_FORMAT_VERSION,
        )?;
        let attr_data: ChunkAttrsData = bincode::deserialize(&attr_body)?;

        let dead_body = read_file(
            &layout.chunk_path(id, "spm"),
            CHUNK_DEAD_MAGIC,
            CHUNK_FORMAT_VERSION,
        )?;
        let dead_words: Vec<u64> = bincode::deserialize(&dead_body)?;
        let deadmap = DeadRowMap::from_words(dead_words, info.row_count);
        let alive = info.row_count - deadmap.dead_count();

        let checkpoints = read_checkpoints(&mut ByteReader::new(&info.checkpoints))
            .ok_or_else(|| Error::corrupted(format!("chunk {id}: bad checkpoint block")))?;

        let disk_bytes = layout
            .chunk_files(id)
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();

        let docs_start = FRAME_HEADER_LEN;
        let hits_start = docs_start + info.docs_len as usize;
        Ok(Arc::new(DiskChunk {
            id,
            layout: layout.clone(),
            dict_mode: info.dict_mode,
            words: info.words,
            checkpoints,
            word_count: info.word_count,
            total_hits: info.total_hits,
            docids: info.docids,
            row_count: info.row_count,
            mmap,
            docs_range: (docs_start, hits_start),
            hits_range: (hits_start, hits_start + info.hits_len as usize),
            skiplist: info.skiplist,
            skiplist_dir: info.skiplist_dir,
            attrs: RwLock::new(AttrStore::new(
                attr_data.rows,
                BlobPool::from_raw(attr_data.blobs),
                info.stride as usize,
            )),
            columnar: attr_data
                .columnar
                .into_iter()
                .map(SimpleColumnar::from_values)
                .collect(),
            docstore: attr_data.docstore,
            bloom: info
                .bloom
                .map(|(bits, per_entry, hashes)| InfixBloom::from_parts(bits, per_entry, hashes)),
            deadmap,
            alive: AtomicU32::new(alive),
            disk_bytes,
            optimizing: AtomicBool::new(false),
            delete_on_drop: AtomicBool::new(false),
            kill_hook: Mutex::new(None),
            postponed: Mutex::new(Vec::new()),
        }))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn word_count(&self) -> u64 {
        self.word_count
    }

    pub fn total_hits(&self) -> u64 {
        self.total_hits
    }

    /// On-disk footprint at open time, used by optimize to pick merge
    /// candidates
    pub fn disk_bytes(&self) -> u64 {
        self.disk_bytes
    }

    /// Touch the whole posting payload so first queries run against a
    /// warm page cache
    pub fn warm(&self) {
        let payload = &self.mmap[FRAME_HEADER_LEN..];
        let checksum = crc32fast::hash(payload);
        debug!("chunk {}: warmed {} bytes (crc {checksum:08x})", self.id, payload.len());
    }

    pub fn find_alive_row(&self, doc: DocId) -> Option<RowId> {
        let row = self.rowid_of(doc)?;
        if self.deadmap.is_dead(row) {
            None
        } else {
            Some(row)
        }
    }

    pub fn kill(&self, doc: DocId) -> bool {
        let Some(row) = self.rowid_of(doc) else {
            return false;
        };
        if !self.deadmap.kill(row) {
            return false;
        }
        self.alive.fetch_sub(1, Ordering::AcqRel);
        if let Some(hook) = self.kill_hook.lock().as_ref() {
            hook.record(doc);
        }
        true
    }

    pub fn kill_multi(&self, docs: &[DocId]) -> u32 {
        docs.iter().filter(|&&doc| self.kill(doc)).count() as u32
    }

    /// Persist the dead-row map; called after kill batches on the serial
    /// executor
    pub fn save_deadmap(&self) -> Result<()> {
        write_file(
            &self.layout.chunk_path(self.id, "spm"),
            CHUNK_DEAD_MAGIC,
            CHUNK_FORMAT_VERSION,
            &bincode::serialize(&self.deadmap.to_words())?,
        )
    }

    /// Persist rows, blobs, columnar and docstore after attribute updates
    pub fn save_attrs(&self) -> Result<()> {
        let attrs = self.attrs.read();
        let data = ChunkAttrsData {
            rows: attrs.rows.clone(),
            blobs: attrs.blobs.raw().to_vec(),
            columnar: self.columnar.iter().map(|c| c.to_values()).collect(),
            docstore: self.docstore.clone(),
        };
        drop(attrs);
        write_file(
            &self.layout.chunk_path(self.id, "spa"),
            CHUNK_ATTR_MAGIC,
            CHUNK_FORMAT_VERSION,
            &bincode::serialize(&data)?,
        )
    }

    // --- optimize coordination ---

    pub fn try_set_optimizing(&self) -> bool {
        self.optimizing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn clear_optimizing(&self) {
        self.optimizing.store(false, Ordering::Release);
    }

    pub fn is_optimizing(&self) -> bool {
        self.optimizing.load(Ordering::Acquire)
    }

    pub fn install_kill_hook(&self, hook: Arc<KillHook>) {
        *self.kill_hook.lock() = Some(hook);
    }

    pub fn clear_kill_hook(&self) {
        *self.kill_hook.lock() = None;
    }

    pub fn push_postponed(&self, batch: Arc<UpdateBatch>) {
        self.postponed.lock().push(batch);
    }

    pub fn drain_postponed(&self) -> Vec<Arc<UpdateBatch>> {
        std::mem::take(&mut *self.postponed.lock())
    }

    /// Unlink every chunk file when the last handle drops
    pub fn set_delete_on_drop(&self) {
        self.delete_on_drop.store(true, Ordering::Release);
    }

    /// Skiplist block for a word identified by its doclist offset
    pub fn skiplist_for(&self, doclist_offset: u64) -> Option<Vec<SkiplistEntry>> {
        let idx = self
            .skiplist_dir
            .binary_search_by_key(&doclist_offset, |&(offset, _)| offset)
            .ok()?;
        read_skiplist_block(&self.skiplist, self.skiplist_dir[idx].1 as usize)
    }

    /// Sorted doc ids of every row, dead ones included
    pub fn doc_ids(&self) -> &[u64] {
        &self.docids
    }

    /// Re-lay the row store for a changed attribute schema: values are
    /// carried over by attribute name, new attributes read as zero.
    /// Rewrites both the attribute file and the chunk descriptor.
    pub fn transform_rows(&self, old_schema: &crate::core::types::Schema, new_schema: &crate::core::types::Schema) -> Result<()> {
        let new_stride = new_schema.stride();
        {
            let mut attrs = self.attrs.write();
            let mut rows = vec![0u32; self.row_count as usize * new_stride];
            for row in 0..self.row_count as usize {
                let old_row = attrs.row(row as RowId);
                let new_row = &mut rows[row * new_stride..(row + 1) * new_stride];
                for (new_idx, attr) in new_schema.attrs.iter().enumerate() {
                    if attr.columnar {
                        continue;
                    }
                    let Some(old_idx) = old_schema.attr_index(&attr.name) else {
                        continue;
                    };
                    if old_schema.attrs[old_idx].ty != attr.ty {
                        continue;
                    }
                    let from = old_schema.attr_offset(old_idx);
                    let to = new_schema.attr_offset(new_idx);
                    let width = attr.ty.cell_width();
                    new_row[to..to + width].copy_from_slice(&old_row[from..from + width]);
                }
            }
            attrs.replace_rows(rows, new_stride);
        }
        self.save_attrs()?;
        self.save_info(new_stride as u32)
    }

    /// Rewrite the `.spi` descriptor from in-memory state
    fn save_info(&self, stride: u32) -> Result<()> {
        let mut checkpoints_raw = Vec::new();
        crate::codec::wordlist::write_checkpoints(&mut checkpoints_raw, &self.checkpoints);
        let info = ChunkInfo {
            dict_mode: self.dict_mode,
            row_count: self.row_count,
            stride,
            word_count: self.word_count,
            total_hits: self.total_hits,
            docs_len: (self.docs_range.1 - self.docs_range.0) as u64,
            hits_len: (self.hits_range.1 - self.hits_range.0) as u64,
            checkpoints: checkpoints_raw,
            words: self.words.clone(),
            bloom: self
                .bloom
                .as_ref()
                .map(|b| (b.raw().to_vec(), b.per_entry(), b.hashes())),
            docids: self.docids.clone(),
            skiplist: self.skiplist.clone(),
            skiplist_dir: self.skiplist_dir.clone(),
        };
        write_file(
            &self.layout.chunk_path(self.id, "spi"),
            CHUNK_INFO_MAGIC,
            CHUNK_FORMAT_VERSION,
            &bincode::serialize(&info)?,
        )
    }
}

impl Drop for DiskChunk {
    fn drop(&mut self) {
        if !self.delete_on_drop.load(Ordering::Acquire) {
            return;
        }
        for path in self.layout.chunk_files(self.id) {
            if let Err(err) = std::fs::remove_file(&path) {
                warn!("chunk {}: failed to unlink {path:?}: {err}", self.id);
            }
        }
        debug!("chunk {}: files unlinked", self.id);
    }
}

impl PostingsView for DiskChunk {
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
        &self.mmap[self.docs_range.0..self.docs_range.1]
    }

    fn hits(&self) -> &[u8] {
        &self.mmap[self.hits_range.0..self.hits_range.1]
    }

    fn row_count(&self) -> u32 {
        self.row_count
    }

    fn alive_rows(&self) -> u32 {
        self.alive.load(Ordering::Acquire)
    }

    fn total_hits(&self) -> u64 {
        self.total_hits
    }

    fn is_row_dead(&self, row_id: RowId) -> bool {
        self.deadmap.is_dead(row_id)
    }

    fn rowid_of(&self, doc: DocId) -> Option<RowId> {
        self.docids.binary_search(&doc.0).ok().map(|i| i as RowId)
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

    fn skiplist_block(&self, doclist_offset: u64) -> Option<Vec<SkiplistEntry>> {
        self.skiplist_for(doclist_offset)
    }
}

impl std::fmt::Debug for DiskChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskChunk")
            .field("id", &self.id)
            .field("rows", &self.row_count)
            .field("alive", &self.alive.load(Ordering::Relaxed))
            .field("optimizing", &self.is_optimizing())
            .finish()
    }
}
