use serde::{Deserialize, Serialize};

use crate::core::config::CompressionType;
use crate::core::error::{Error, Result};
use crate::core::types::RowId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct DocStoreEntry {
    offset: u64,
    len: u32,
    raw_len: u32,
}

/// Per-segment store of original field text, one entry per row, each
/// entry independently compressed so single-document fetches stay cheap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocStore {
    compression: CompressionType,
    entries: Vec<DocStoreEntry>,
    data: Vec<u8>,
}

impl DocStore {
    pub fn new(compression: CompressionType) -> Self {
        DocStore {
            compression,
            entries: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn memory_bytes(&self) -> usize {
        self.data.len() + self.entries.len() * std::mem::size_of::<DocStoreEntry>()
    }

    /// Append one document's stored fields; rows must arrive in rowid order
    pub fn push_doc(&mut self, fields: &[String]) -> Result<()> {
        let raw = bincode::serialize(fields)?;
        let packed = match self.compression {
            CompressionType::None => raw.clone(),
            CompressionType::Lz4 => lz4_flex::compress(&raw),
            CompressionType::Zstd => zstd::bulk::compress(&raw, 0)
                .map_err(|e| Error::new(crate::core::error::ErrorKind::Io, e.to_string()))?,
        };
        self.entries.push(DocStoreEntry {
            offset: self.data.len() as u64,
            len: packed.len() as u32,
            raw_len: raw.len() as u32,
        });
        self.data.extend_from_slice(&packed);
        Ok(())
    }

    pub fn get_doc(&self, row_id: RowId) -> Result<Vec<String>> {
        let entry = self
            .entries
            .get(row_id as usize)
            .ok_or_else(|| Error::corrupted(format!("docstore row {row_id} out of range")))?;
        let packed =
            &self.data[entry.offset as usize..entry.offset as usize + entry.len as usize];
        let raw = match self.compression {
            CompressionType::None => packed.to_vec(),
            CompressionType::Lz4 => lz4_flex::decompress(packed, entry.raw_len as usize)
                .map_err(|e| Error::corrupted(e.to_string()))?,
            CompressionType::Zstd => zstd::bulk::decompress(packed, entry.raw_len as usize)
                .map_err(|e| Error::corrupted(e.to_string()))?,
        };
        Ok(bincode::deserialize(&raw)?)
    }

    /// Copy one row from another store, re-compressing if settings differ
    pub fn append_from(&mut self, source: &DocStore, row_id: RowId) -> Result<()> {
        if self.compression == source.compression {
            if let Some(entry) = source.entries.get(row_id as usize) {
                let packed = &source.data
                    [entry.offset as usize..entry.offset as usize + entry.len as usize];
                self.entries.push(DocStoreEntry {
                    offset: self.data.len() as u64,
                    len: entry.len,
                    raw_len: entry.raw_len,
                });
                self.data.extend_from_slice(packed);
                return Ok(());
            }
        }
        let fields = source.get_doc(row_id)?;
        self.push_doc(&fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_docstore_round_trip_all_codecs() {
        for compression in [
            CompressionType::None,
            CompressionType::Lz4,
            CompressionType::Zstd,
        ] {
            let mut store = DocStore::new(compression);
            store.push_doc(&fields(&["hello world", "second field"])).unwrap();
            store.push_doc(&fields(&["another document"])).unwrap();

            assert_eq!(store.get_doc(0).unwrap(), fields(&["hello world", "second field"]));
            assert_eq!(store.get_doc(1).unwrap(), fields(&["another document"]));
            assert!(store.get_doc(2).is_err());
        }
    }

    #[test]
    fn test_docstore_copy_between_stores() {
        let mut src = DocStore::new(CompressionType::Lz4);
        src.push_doc(&fields(&["kept"])).unwrap();
        src.push_doc(&fields(&["copied"])).unwrap();

        let mut dst = DocStore::new(CompressionType::Zstd);
        dst.append_from(&src, 1).unwrap();
        assert_eq!(dst.get_doc(0).unwrap(), fields(&["copied"]));
    }
}
