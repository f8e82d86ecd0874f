pub mod disk_chunk;
pub mod writer;

pub use disk_chunk::DiskChunk;

use serde::{Deserialize, Serialize};

use crate::core::config::DictMode;
use crate::segment::docstore::DocStore;

/// Files making up one disk chunk:
///   spi  dictionary, checkpoints, bloom, docid table, skiplists
///   spd  doclist and hitlist payload (mmap'd)
///   spa  rows, blobs, columnar, docstore
///   spm  dead-row map
pub const CHUNK_FILE_EXTS: [&str; 4] = ["spi", "spd", "spa", "spm"];

pub const CHUNK_INFO_MAGIC: u32 = 0x52_54_43_49; // "RTCI"
pub const CHUNK_DATA_MAGIC: u32 = 0x52_54_43_44; // "RTCD"
pub const CHUNK_ATTR_MAGIC: u32 = 0x52_54_43_41; // "RTCA"
pub const CHUNK_DEAD_MAGIC: u32 = 0x52_54_43_4D; // "RTCM"
pub const CHUNK_FORMAT_VERSION: u32 = 1;

/// Immutable chunk descriptor persisted in `.spi`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub dict_mode: DictMode,
    pub row_count: u32,
    pub stride: u32,
    pub word_count: u64,
    pub total_hits: u64,
    /// Split of the `.spd` payload into doclist and hitlist halves
    pub docs_len: u64,
    pub hits_len: u64,
    pub checkpoints: Vec<u8>,
    pub words: Vec<u8>,
    pub bloom: Option<(Vec<u64>, u8, u8)>,
    /// Sorted doc ids; the rowid of a doc is its position here
    pub docids: Vec<u64>,
    pub skiplist: Vec<u8>,
    /// Maps a word's doclist offset to its skiplist block offset
    pub skiplist_dir: Vec<(u64, u64)>,
}

/// Mutable attribute payload persisted in `.spa`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkAttrsData {
    pub rows: Vec<u32>,
    pub blobs: Vec<u8>,
    pub columnar: Vec<Vec<u64>>,
    pub docstore: Option<DocStore>,
}

