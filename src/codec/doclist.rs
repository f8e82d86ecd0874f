use crate::codec::varint::{ByteReader, write_varint};
use crate::core::types::RowId;

/// Where a doc entry's hits live: a single inlined position, or an offset
/// into the segment's hitlist stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitRef {
    Inline(u32),
    Offset(u64),
}

/// One row's entry in a word's doclist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocEntry {
    pub row_id: RowId,
    pub fields_mask: u32,
    pub hit_count: u32,
    pub hit_ref: HitRef,
}

/// Delta writer for one word's doclist; row deltas restart at each word
#[derive(Debug, Default)]
pub struct DoclistWriter {
    last_row: RowId,
}

impl DoclistWriter {
    pub fn new() -> Self {
        DoclistWriter { last_row: 0 }
    }

    /// Restart delta state for the next word
    pub fn restart(&mut self) {
        self.last_row = 0;
    }

    pub fn push(&mut self, out: &mut Vec<u8>, entry: &DocEntry) {
        write_varint(out, (entry.row_id - self.last_row) as u64);
        self.last_row = entry.row_id;
        write_varint(out, entry.fields_mask as u64);
        write_varint(out, entry.hit_count as u64);
        match entry.hit_ref {
            HitRef::Inline(pos) => {
                debug_assert_eq!(entry.hit_count, 1);
                // Inlined position goes out in split form: low 24 bits,
                // then the high bits
                write_varint(out, (pos & 0x00FF_FFFF) as u64);
                write_varint(out, (pos >> 24) as u64);
            }
            HitRef::Offset(offset) => {
                debug_assert_ne!(entry.hit_count, 1);
                write_varint(out, offset);
            }
        }
    }
}

/// Count-driven reader of one word's doclist
#[derive(Debug, Clone)]
pub struct DoclistReader<'a> {
    reader: ByteReader<'a>,
    last_row: RowId,
    remaining: u32,
}

impl<'a> DoclistReader<'a> {
    pub fn new(data: &'a [u8], offset: usize, doc_count: u32) -> Self {
        DoclistReader {
            reader: ByteReader::at(data, offset),
            last_row: 0,
            remaining: doc_count,
        }
    }

    pub fn empty() -> Self {
        DoclistReader {
            reader: ByteReader::new(&[]),
            last_row: 0,
            remaining: 0,
        }
    }

    /// Resume decoding mid-list from skiplist state: `last_row` is the
    /// last row decoded before `offset`, with `remaining` entries left
    pub fn resume(data: &'a [u8], offset: usize, remaining: u32, last_row: RowId) -> Self {
        DoclistReader {
            reader: ByteReader::at(data, offset),
            last_row,
            remaining,
        }
    }
}

impl Iterator for DoclistReader<'_> {
    type Item = DocEntry;

    fn next(&mut self) -> Option<DocEntry> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let row_delta = self.reader.read_varint()? as RowId;
        let fields_mask = self.reader.read_varint()? as u32;
        let hit_count = self.reader.read_varint()? as u32;
        let hit_ref = if hit_count == 1 {
            let low = self.reader.read_varint()? as u32;
            let high = self.reader.read_varint()? as u32;
            HitRef::Inline((high << 24) | (low & 0x00FF_FFFF))
        } else {
            HitRef::Offset(self.reader.read_varint()?)
        };

        self.last_row += row_delta;
        Some(DocEntry {
            row_id: self.last_row,
            fields_mask,
            hit_count,
            hit_ref,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doclist_round_trip() {
        let entries = [
            DocEntry {
                row_id: 0,
                fields_mask: 0b01,
                hit_count: 1,
                hit_ref: HitRef::Inline(crate::core::types::pack_position(2, 9)),
            },
            DocEntry {
                row_id: 3,
                fields_mask: 0b11,
                hit_count: 4,
                hit_ref: HitRef::Offset(1024),
            },
            DocEntry {
                row_id: 4,
                fields_mask: 0b10,
                hit_count: 2,
                hit_ref: HitRef::Offset(2048),
            },
        ];

        let mut out = Vec::new();
        let mut writer = DoclistWriter::new();
        for entry in &entries {
            writer.push(&mut out, entry);
        }

        let read: Vec<DocEntry> = DoclistReader::new(&out, 0, entries.len() as u32).collect();
        assert_eq!(read, entries);
    }

    #[test]
    fn test_doclist_inline_reconstitution() {
        // A position with bits above 24 must survive the split encoding
        let pos = crate::core::types::pack_position(200, 12345);
        let entry = DocEntry {
            row_id: 7,
            fields_mask: 1 << 31,
            hit_count: 1,
            hit_ref: HitRef::Inline(pos),
        };
        let mut out = Vec::new();
        DoclistWriter::new().push(&mut out, &entry);
        let read = DoclistReader::new(&out, 0, 1).next().unwrap();
        assert_eq!(read.hit_ref, HitRef::Inline(pos));
    }
}
