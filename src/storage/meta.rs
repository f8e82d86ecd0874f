use serde::{Deserialize, Serialize};

use crate::core::config::RtSettings;
use crate::core::error::Result;
use crate::core::types::Schema;
use crate::storage::files::{read_file, write_file_atomic};
use crate::storage::layout::IndexLayout;

pub const META_MAGIC: u32 = 0x5452_5053;
pub const META_VERSION: u32 = 19;

/// `.meta` header, rewritten after every committed save, update flush,
/// attach, truncate or schema change. The settings struct carries the
/// checkpoint interval, bloom geometry, codepoint limit and the soft RAM
/// limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMeta {
    pub total_documents: u32,
    pub total_bytes: u64,
    pub committed_tid: u64,
    pub format_version: u32,
    pub schema: Schema,
    pub settings: RtSettings,
    pub tokenizer_hash: u64,
    pub dictionary_hash: u64,
    pub field_filter_hash: u64,
    /// Disk chunks, oldest first
    pub chunk_ids: Vec<u32>,
}

impl IndexMeta {
    pub fn save(&self, layout: &IndexLayout) -> Result<()> {
        let body = bincode::serialize(self)?;
        let staging = layout.meta_path().with_extension("meta.new");
        write_file_atomic(&layout.meta_path(), &staging, META_MAGIC, META_VERSION, &body)
    }

    pub fn load(layout: &IndexLayout) -> Result<IndexMeta> {
        let body = read_file(&layout.meta_path(), META_MAGIC, META_VERSION)?;
        Ok(bincode::deserialize(&body)?)
    }

    pub fn exists(layout: &IndexLayout) -> bool {
        layout.meta_path().exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AttrDef, AttrType, FieldDef};

    #[test]
    fn test_meta_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let layout = IndexLayout::new(dir.path().join("idx"));
        let meta = IndexMeta {
            total_documents: 42,
            total_bytes: 1 << 20,
            committed_tid: 7,
            format_version: 1,
            schema: Schema::new(
                vec![AttrDef::new("price", AttrType::Uint)],
                vec![FieldDef::new("title")],
            )
            .unwrap(),
            settings: RtSettings::default(),
            tokenizer_hash: 1,
            dictionary_hash: 2,
            field_filter_hash: 3,
            chunk_ids: vec![0, 2, 5],
        };
        meta.save(&layout).unwrap();
        let loaded = IndexMeta::load(&layout).unwrap();
        assert_eq!(loaded.total_documents, 42);
        assert_eq!(loaded.committed_tid, 7);
        assert_eq!(loaded.chunk_ids, vec![0, 2, 5]);
        assert_eq!(loaded.schema.stride(), meta.schema.stride());
    }
}
