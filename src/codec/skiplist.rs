use crate::codec::varint::{ByteReader, write_varint};
use crate::core::types::RowId;

/// One skiplist waypoint: doclist decoder state right after
/// `docs_consumed` entries of a word's doclist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkiplistEntry {
    pub row_id: RowId,
    pub doclist_offset: u64,
    pub docs_consumed: u32,
}

/// Append one word's skiplist block; returns its offset in the stream
pub fn write_skiplist_block(out: &mut Vec<u8>, entries: &[SkiplistEntry]) -> u64 {
    let offset = out.len() as u64;
    write_varint(out, entries.len() as u64);
    let mut last_row = 0u32;
    let mut last_offset = 0u64;
    for entry in entries {
        write_varint(out, (entry.row_id - last_row) as u64);
        write_varint(out, entry.doclist_offset - last_offset);
        write_varint(out, entry.docs_consumed as u64);
        last_row = entry.row_id;
        last_offset = entry.doclist_offset;
    }
    offset
}

pub fn read_skiplist_block(data: &[u8], offset: usize) -> Option<Vec<SkiplistEntry>> {
    let mut reader = ByteReader::at(data, offset);
    let count = reader.read_varint()? as usize;
    let mut entries = Vec::with_capacity(count);
    let mut last_row = 0u32;
    let mut last_offset = 0u64;
    for _ in 0..count {
        last_row += reader.read_varint()? as u32;
        last_offset += reader.read_varint()?;
        let docs_consumed = reader.read_varint()? as u32;
        entries.push(SkiplistEntry {
            row_id: last_row,
            doclist_offset: last_offset,
            docs_consumed,
        });
    }
    Some(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skiplist_block_round_trip() {
        let entries = vec![
            SkiplistEntry {
                row_id: 127,
                doclist_offset: 400,
                docs_consumed: 128,
            },
            SkiplistEntry {
                row_id: 260,
                doclist_offset: 810,
                docs_consumed: 256,
            },
        ];
        let mut out = vec![0xAA; 7]; // preceding blocks
        let offset = write_skiplist_block(&mut out, &entries);
        let read = read_skiplist_block(&out, offset as usize).unwrap();
        assert_eq!(read, entries);
    }
}
