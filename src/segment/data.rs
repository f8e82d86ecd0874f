use serde::{Deserialize, Serialize};

use crate::core::config::DictMode;
use crate::segment::docstore::DocStore;

/// Plain serializable form of one RAM segment, used by the `.ram`
/// snapshot and by transaction-log COMMIT blobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentData {
    pub dict_mode: DictMode,
    pub row_count: u32,
    pub stride: u32,
    pub word_count: u64,
    pub total_hits: u64,
    pub words: Vec<u8>,
    /// Checkpoints serialized with `codec::wordlist::write_checkpoints`
    pub checkpoints: Vec<u8>,
    pub docs: Vec<u8>,
    pub hits: Vec<u8>,
    pub rows: Vec<u32>,
    pub deadmap: Vec<u64>,
    pub blobs: Vec<u8>,
    /// One value vector per columnar attribute, schema order
    pub columnar: Vec<Vec<u64>>,
    pub docstore: Option<DocStore>,
    /// Raw bloom words plus (per_entry, hashes) geometry
    pub bloom: Option<(Vec<u64>, u8, u8)>,
}
