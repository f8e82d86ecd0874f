pub mod blob;
pub mod columnar;
pub mod data;
pub mod deadmap;
pub mod docstore;
pub mod infix_bloom;
pub mod ram_segment;

use parking_lot::{Mutex, RwLock};
use roaring::RoaringTreemap;

use crate::codec::skiplist::SkiplistEntry;
use crate::codec::wordlist::Checkpoint;
use crate::core::config::DictMode;
use crate::core::types::{DocId, RowId, read_u64_cells, write_u64_cells};
use crate::segment::blob::BlobPool;
use crate::segment::columnar::SimpleColumnar;
use crate::segment::docstore::DocStore;
use crate::segment::infix_bloom::InfixBloom;

/// Mutable attribute storage shared by RAM segments and loaded disk
/// chunks: fixed-stride rows plus the blob arena. Guarded by one RW lock
/// because in-place updates may grow the blob pool.
#[derive(Debug)]
pub struct AttrStore {
    pub rows: Vec<u32>,
    pub blobs: BlobPool,
    stride: usize,
}

impl AttrStore {
    pub fn new(rows: Vec<u32>, blobs: BlobPool, stride: usize) -> Self {
        AttrStore {
            rows,
            blobs,
            stride,
        }
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn row_count(&self) -> u32 {
        if self.stride == 0 {
            0
        } else {
            (self.rows.len() / self.stride) as u32
        }
    }

    pub fn row(&self, row_id: RowId) -> &[u32] {
        let start = row_id as usize * self.stride;
        &self.rows[start..start + self.stride]
    }

    pub fn row_mut(&mut self, row_id: RowId) -> &mut [u32] {
        let start = row_id as usize * self.stride;
        &mut self.rows[start..start + self.stride]
    }

    pub fn docid(&self, row_id: RowId) -> DocId {
        DocId(read_u64_cells(self.row(row_id), 0))
    }

    pub fn get_u64(&self, row_id: RowId, cell_offset: usize) -> u64 {
        read_u64_cells(self.row(row_id), cell_offset)
    }

    pub fn set_u64(&mut self, row_id: RowId, cell_offset: usize, value: u64) {
        write_u64_cells(self.row_mut(row_id), cell_offset, value);
    }

    /// Swap in a re-laid-out row buffer (schema changes)
    pub fn replace_rows(&mut self, rows: Vec<u32>, stride: usize) {
        self.rows = rows;
        self.stride = stride;
    }
}

/// Side buffer a merge or save installs on its source segments/chunks so
/// that kills landing mid-operation can be replayed onto the output
#[derive(Debug, Default)]
pub struct KillHook {
    killed: Mutex<RoaringTreemap>,
}

impl KillHook {
    pub fn record(&self, doc: DocId) {
        self.killed.lock().insert(doc.0);
    }

    /// Drain everything recorded so far
    pub fn take(&self) -> Vec<DocId> {
        let mut set = self.killed.lock();
        let docs: Vec<DocId> = set.iter().map(DocId).collect();
        set.clear();
        docs
    }
}

/// Read surface common to RAM segments and disk chunks; the query and
/// merge machinery runs against this instead of the concrete layer.
pub trait PostingsView: Send + Sync {
    fn dict_mode(&self) -> DictMode;

    /// Encoded wordlist stream
    fn words(&self) -> &[u8];

    fn checkpoints(&self) -> &[Checkpoint];

    /// Encoded doclist stream
    fn docs(&self) -> &[u8];

    /// Encoded hitlist stream
    fn hits(&self) -> &[u8];

    fn row_count(&self) -> u32;

    fn alive_rows(&self) -> u32;

    /// Total indexed hits, the BM25 length-normalization input
    fn total_hits(&self) -> u64;

    fn is_row_dead(&self, row_id: RowId) -> bool;

    /// O(1)/O(log n) docid resolution, dead rows filtered out by caller
    fn rowid_of(&self, doc: DocId) -> Option<RowId>;

    fn attrs(&self) -> &RwLock<AttrStore>;

    fn columnar(&self) -> &[SimpleColumnar];

    fn docstore(&self) -> Option<&DocStore>;

    fn infix_bloom(&self) -> Option<&InfixBloom>;

    /// Skiplist waypoints for the word whose doclist starts at the given
    /// offset (disk chunks only)
    fn skiplist_block(&self, _doclist_offset: u64) -> Option<Vec<SkiplistEntry>> {
        None
    }
}
