use std::collections::HashMap;
use std::sync::Arc;

use crate::analysis::Dictionary;
use crate::codec::doclist::{DocEntry, DoclistWriter, HitRef};
use crate::codec::hitlist::HitlistWriter;
use crate::codec::varint::{ByteReader, write_varint};
use crate::codec::wordlist::{WordEntry, WordKey, WordlistWriter};
use crate::core::config::{DictMode, RtSettings};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{
    AttrType, AttrValue, DocId, Document, Hit, INVALID_ROWID, RowId, Schema, position_field,
    write_u64_cells,
};
use crate::segment::blob::BlobPool;
use crate::segment::columnar::SimpleColumnar;
use crate::segment::deadmap::DeadRowMap;
use crate::segment::docstore::DocStore;
use crate::segment::infix_bloom::build_infix_bloom;
use crate::segment::ram_segment::{RamSegment, SegmentParts};

/// Per-writer transaction buffer. Bound to one index instance from first
/// use until commit or rollback; a writer addressing a second index while
/// a transaction is open is rejected.
pub struct Accumulator {
    bound_index: Option<u64>,
    schema: Option<Schema>,
    settings: RtSettings,
    schema_fingerprint: u64,
    hits: Vec<Hit>,
    /// Interned keyword bytes (keywords dict mode); `Hit.word` is an
    /// offset into this pool
    keyword_pool: Vec<u8>,
    keyword_ids: HashMap<Vec<u8>, u64>,
    rows: Vec<u32>,
    blobs: BlobPool,
    /// Hits per accumulated document
    doc_hit_counts: Vec<u32>,
    replace_flags: Vec<bool>,
    /// Original field text per document, for the docstore
    stored_docs: Vec<Vec<String>>,
    /// Per columnar attribute, one value per document
    columnar_values: Vec<Vec<u64>>,
    kill_list: Vec<DocId>,
    row_count: u32,
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accumulator {
    pub fn new() -> Self {
        Accumulator {
            bound_index: None,
            schema: None,
            settings: RtSettings::default(),
            schema_fingerprint: 0,
            hits: Vec::new(),
            keyword_pool: Vec::new(),
            keyword_ids: HashMap::new(),
            rows: Vec::new(),
            blobs: BlobPool::new(),
            doc_hit_counts: Vec::new(),
            replace_flags: Vec::new(),
            stored_docs: Vec::new(),
            columnar_values: Vec::new(),
            kill_list: Vec::new(),
            row_count: 0,
        }
    }

    /// Bind to an index instance; called by the index on every operation
    /// routed through this accumulator
    pub fn bind(&mut self, index_id: u64, schema: &Schema, settings: &RtSettings) -> Result<()> {
        match self.bound_index {
            Some(bound) if bound != index_id => {
                return Err(Error::new(
                    ErrorKind::InvalidState,
                    "current txn is working with another index",
                ));
            }
            Some(_) => return Ok(()),
            None => {}
        }
        self.bound_index = Some(index_id);
        self.schema = Some(schema.clone());
        self.schema_fingerprint = schema.fingerprint();
        self.settings = settings.clone();
        self.columnar_values = schema
            .attrs
            .iter()
            .filter(|a| a.columnar)
            .map(|_| Vec::new())
            .collect();
        Ok(())
    }

    pub fn bound_index(&self) -> Option<u64> {
        self.bound_index
    }

    pub fn is_dirty(&self) -> bool {
        self.row_count > 0 || !self.kill_list.is_empty()
    }

    pub fn pending_rows(&self) -> u32 {
        self.row_count
    }

    /// Buffer one document plus its tokenized terms. `terms` carries
    /// (normalized term, packed position) pairs; positions must ascend.
    pub fn add_document(
        &mut self,
        doc: &Document,
        replace: bool,
        terms: &[(String, u32)],
        dict: &dyn Dictionary,
    ) -> Result<()> {
        let schema = self
            .schema
            .clone()
            .ok_or_else(|| Error::new(ErrorKind::InvalidState, "accumulator is not bound"))?;
        if self.row_count >= INVALID_ROWID - 1 {
            return Err(Error::new(
                ErrorKind::OutOfMemory,
                "segment row counter exhausted",
            ));
        }

        let row_id = self.row_count;
        self.push_row(&schema, doc)?;

        let mut hit_count = 0u32;
        for (term, position) in terms {
            let word = match self.settings.dict_mode {
                DictMode::Crc => dict.word_id(term.as_bytes()),
                DictMode::Keywords => self.intern_keyword(term.as_bytes()),
            };
            self.hits.push(Hit {
                word,
                row_id,
                position: *position,
            });
            hit_count += 1;
        }

        self.doc_hit_counts.push(hit_count);
        self.replace_flags.push(replace);
        self.stored_docs.push(if self.settings.stored_fields {
            doc.fields.clone()
        } else {
            Vec::new()
        });
        if replace {
            self.kill_list.push(doc.id);
        }
        self.row_count += 1;
        Ok(())
    }

    pub fn delete_document(&mut self, docs: &[DocId]) {
        self.kill_list.extend_from_slice(docs);
    }

    pub fn kill_list(&self) -> &[DocId] {
        &self.kill_list
    }

    /// Drop all buffered state and unbind
    pub fn rollback(&mut self) {
        *self = Accumulator {
            settings: self.settings.clone(),
            ..Accumulator::new()
        };
    }

    /// Deduplicate, sort, and emit one immutable RAM segment. Returns the
    /// segment (None when nothing alive was buffered) plus the kill list
    /// the caller must apply to all older segments and chunks.
    pub fn commit(
        &mut self,
        current_fingerprint: u64,
    ) -> Result<(Option<Arc<RamSegment>>, Vec<DocId>)> {
        if self.schema_fingerprint != current_fingerprint {
            return Err(Error::new(
                ErrorKind::SchemaMismatch,
                "index schema changed since the transaction was opened",
            ));
        }
        let schema = self
            .schema
            .clone()
            .ok_or_else(|| Error::new(ErrorKind::InvalidState, "accumulator is not bound"))?;

        self.dedup_docids(&schema);
        let segment = if self.row_count > 0 {
            Some(self.emit_segment(&schema)?)
        } else {
            None
        };

        let kill_list = std::mem::take(&mut self.kill_list);
        self.rollback();
        Ok((segment, kill_list))
    }

    // --- internals ---

    fn intern_keyword(&mut self, word: &[u8]) -> u64 {
        if let Some(&offset) = self.keyword_ids.get(word) {
            return offset;
        }
        let offset = self.keyword_pool.len() as u64;
        write_varint(&mut self.keyword_pool, word.len() as u64);
        self.keyword_pool.extend_from_slice(word);
        self.keyword_ids.insert(word.to_vec(), offset);
        offset
    }

    fn keyword_at(&self, offset: u64) -> &[u8] {
        let mut reader = ByteReader::at(&self.keyword_pool, offset as usize);
        let len = reader.read_varint().unwrap_or(0) as usize;
        reader.read_bytes(len).unwrap_or(&[])
    }

    fn push_row(&mut self, schema: &Schema, doc: &Document) -> Result<()> {
        let stride = schema.stride();
        let row_start = self.rows.len();
        self.rows.resize(row_start + stride, 0);
        write_u64_cells(&mut self.rows[row_start..], 0, doc.id.0);

        let mut columnar_idx = 0usize;
        for (attr_idx, attr) in schema.attrs.iter().enumerate().skip(1) {
            let value = doc.attrs.get(attr_idx - 1).unwrap_or(&AttrValue::None);
            if !value.matches(attr.ty) {
                return Err(Error::new(
                    ErrorKind::SchemaMismatch,
                    format!("attribute '{}' got an incompatible value", attr.name),
                ));
            }
            if attr.columnar {
                let cell = match value {
                    AttrValue::Uint(v) => *v as u64,
                    AttrValue::Bigint(v) => *v,
                    AttrValue::Float(v) => v.to_bits() as u64,
                    AttrValue::Bool(v) => *v as u64,
                    AttrValue::None => 0,
                    _ => {
                        return Err(Error::invalid(format!(
                            "attribute '{}' cannot be columnar",
                            attr.name
                        )));
                    }
                };
                self.columnar_values[columnar_idx].push(cell);
                columnar_idx += 1;
                continue;
            }

            let offset = schema.attr_offset(attr_idx);
            let row = &mut self.rows[row_start..row_start + stride];
            match value {
                AttrValue::None => {}
                AttrValue::Uint(v) => row[offset] = *v,
                AttrValue::Bigint(v) => write_u64_cells(row, offset, *v),
                AttrValue::Float(v) => row[offset] = v.to_bits(),
                AttrValue::Bool(v) => row[offset] = *v as u32,
                AttrValue::String(v) => {
                    let blob = self.blobs.append_string(v);
                    write_u64_cells(&mut self.rows[row_start..], offset, blob);
                }
                AttrValue::Json(v) => {
                    let blob = self.blobs.append_json(v)?;
                    write_u64_cells(&mut self.rows[row_start..], offset, blob);
                }
                AttrValue::MultiUint(v) => {
                    let blob = self.blobs.append_mva_u32(v);
                    write_u64_cells(&mut self.rows[row_start..], offset, blob);
                }
                AttrValue::MultiBigint(v) => {
                    let blob = self.blobs.append_mva_u64(v);
                    write_u64_cells(&mut self.rows[row_start..], offset, blob);
                }
            }
        }
        Ok(())
    }

    /// Resolve duplicated doc ids among the buffered rows: replace mode
    /// keeps the last copy, insert mode keeps the first. Surviving rows
    /// are renumbered and every parallel buffer is compacted.
    fn dedup_docids(&mut self, schema: &Schema) {
        if self.row_count <= 1 {
            return;
        }
        let stride = schema.stride();
        let mut by_doc: Vec<(u64, RowId)> = (0..self.row_count)
            .map(|row| {
                let docid =
                    crate::core::types::read_u64_cells(&self.rows[row as usize * stride..], 0);
                (docid, row)
            })
            .collect();
        // Stable sort keeps insertion order inside each docid group
        by_doc.sort_by_key(|&(docid, _)| docid);

        let mut keep = vec![true; self.row_count as usize];
        let mut dropped = 0u32;
        let mut group_start = 0usize;
        while group_start < by_doc.len() {
            let docid = by_doc[group_start].0;
            let mut group_end = group_start + 1;
            while group_end < by_doc.len() && by_doc[group_end].0 == docid {
                group_end += 1;
            }
            if group_end - group_start > 1 {
                let group = &by_doc[group_start..group_end];
                let replace = group
                    .iter()
                    .any(|&(_, row)| self.replace_flags[row as usize]);
                let survivor = if replace {
                    group[group.len() - 1].1
                } else {
                    group[0].1
                };
                for &(_, row) in group {
                    if row != survivor {
                        keep[row as usize] = false;
                        dropped += 1;
                    }
                }
            }
            group_start = group_end;
        }
        if dropped == 0 {
            return;
        }

        // Old row id -> new row id
        let mut row_map = vec![INVALID_ROWID; self.row_count as usize];
        let mut next = 0u32;
        for (old, &kept) in keep.iter().enumerate() {
            if kept {
                row_map[old] = next;
                next += 1;
            }
        }

        let mut rows = Vec::with_capacity(next as usize * stride);
        let mut doc_hit_counts = Vec::with_capacity(next as usize);
        let mut replace_flags = Vec::with_capacity(next as usize);
        let mut stored_docs = Vec::with_capacity(next as usize);
        let mut columnar_values: Vec<Vec<u64>> =
            self.columnar_values.iter().map(|_| Vec::new()).collect();
        for old in 0..self.row_count as usize {
            if !keep[old] {
                continue;
            }
            rows.extend_from_slice(&self.rows[old * stride..(old + 1) * stride]);
            doc_hit_counts.push(self.doc_hit_counts[old]);
            replace_flags.push(self.replace_flags[old]);
            stored_docs.push(std::mem::take(&mut self.stored_docs[old]));
            for (column, values) in self.columnar_values.iter().enumerate() {
                columnar_values[column].push(values[old]);
            }
        }

        self.hits.retain_mut(|hit| {
            let new_row = row_map[hit.row_id as usize];
            if new_row == INVALID_ROWID {
                false
            } else {
                hit.row_id = new_row;
                true
            }
        });

        self.rows = rows;
        self.doc_hit_counts = doc_hit_counts;
        self.replace_flags = replace_flags;
        self.stored_docs = stored_docs;
        self.columnar_values = columnar_values;
        self.row_count = next;
    }

    fn emit_segment(&mut self, schema: &Schema) -> Result<Arc<RamSegment>> {
        // Sort the hit stream: numeric mode by (word id, row, position),
        // keyword mode lexicographically against the interned pool
        let mut hits = std::mem::take(&mut self.hits);
        match self.settings.dict_mode {
            DictMode::Crc => {
                hits.sort_unstable_by_key(|h| (h.word, h.row_id, h.position));
            }
            DictMode::Keywords => {
                let pool = &self.keyword_pool;
                hits.sort_unstable_by(|a, b| {
                    keyword_slice(pool, a.word)
                        .cmp(keyword_slice(pool, b.word))
                        .then(a.row_id.cmp(&b.row_id))
                        .then(a.position.cmp(&b.position))
                });
            }
        }

        let mut words_out = Vec::new();
        let mut docs_out = Vec::new();
        let mut hits_out = Vec::new();
        let mut wordlist =
            WordlistWriter::new(self.settings.dict_mode, self.settings.checkpoint_interval);
        let mut doclist = DoclistWriter::new();
        let mut hitlist = HitlistWriter::new();
        let mut total_hits = 0u64;

        let mut i = 0usize;
        while i < hits.len() {
            let word = hits[i].word;
            let word_start = i;
            while i < hits.len() && hits[i].word == word {
                i += 1;
            }

            let doclist_offset = docs_out.len() as u64;
            doclist.restart();
            let mut word_doc_count = 0u32;
            let mut word_hit_count = 0u64;

            let mut j = word_start;
            while j < i {
                let row_id = hits[j].row_id;
                let doc_start = j;
                while j < i && hits[j].row_id == row_id {
                    j += 1;
                }

                // Collapse duplicate positions so each doc's stream stays
                // strictly increasing
                let mut positions: Vec<u32> = Vec::with_capacity(j - doc_start);
                for hit in &hits[doc_start..j] {
                    if positions.last() != Some(&hit.position) {
                        positions.push(hit.position);
                    }
                }

                let mut fields_mask = 0u32;
                for &pos in &positions {
                    fields_mask |= 1 << position_field(pos).min(31);
                }

                let hit_ref = if positions.len() == 1 {
                    HitRef::Inline(positions[0])
                } else {
                    let offset = hits_out.len() as u64;
                    for &pos in &positions {
                        hitlist.push(&mut hits_out, pos);
                    }
                    hitlist.finish_doc(&mut hits_out);
                    HitRef::Offset(offset)
                };

                doclist.push(
                    &mut docs_out,
                    &DocEntry {
                        row_id,
                        fields_mask,
                        hit_count: positions.len() as u32,
                        hit_ref,
                    },
                );
                word_doc_count += 1;
                word_hit_count += positions.len() as u64;
            }
            total_hits += word_hit_count;

            let key = match self.settings.dict_mode {
                DictMode::Crc => WordKey::Id(word),
                DictMode::Keywords => WordKey::Keyword(self.keyword_at(word).to_vec()),
            };
            wordlist.push(
                &mut words_out,
                &WordEntry {
                    key,
                    doc_count: word_doc_count,
                    hit_count: word_hit_count,
                    doclist_offset,
                    has_hitlist: true,
                },
            );
        }

        let word_count = wordlist.word_count();
        let checkpoints = wordlist.finish();

        // Per-checkpoint infix bloom
        let bloom = if self.settings.infix_enabled() && !checkpoints.is_empty() {
            Some(build_infix_bloom(
                &words_out,
                &checkpoints,
                self.settings.dict_mode,
                self.settings.bloom_per_entry,
                self.settings.bloom_hashes,
            ))
        } else {
            None
        };

        let docstore = if self.settings.stored_fields {
            let mut store = DocStore::new(self.settings.docstore_compression);
            for fields in &self.stored_docs {
                store.push_doc(fields)?;
            }
            Some(store)
        } else {
            None
        };

        let columnar = std::mem::take(&mut self.columnar_values)
            .into_iter()
            .map(SimpleColumnar::from_values)
            .collect();

        Ok(RamSegment::build(SegmentParts {
            dict_mode: self.settings.dict_mode,
            words: words_out,
            checkpoints,
            word_count,
            docs: docs_out,
            hits: hits_out,
            total_hits,
            rows: std::mem::take(&mut self.rows),
            stride: schema.stride(),
            row_count: self.row_count,
            blobs: std::mem::replace(&mut self.blobs, BlobPool::new()),
            deadmap: DeadRowMap::new(self.row_count),
            columnar,
            docstore,
            bloom,
        }))
    }
}

fn keyword_slice(pool: &[u8], offset: u64) -> &[u8] {
    let mut reader = ByteReader::at(pool, offset as usize);
    let len = reader.read_varint().unwrap_or(0) as usize;
    reader.read_bytes(len).unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::PlainDictionary;
    use crate::core::types::{AttrDef, FieldDef, pack_position};
    use crate::segment::PostingsView;

    fn test_schema() -> Schema {
        Schema::new(
            vec![AttrDef::new("price", AttrType::Uint)],
            vec![FieldDef::new("title")],
        )
        .unwrap()
    }

    fn terms(words: &[&str]) -> Vec<(String, u32)> {
        words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.to_string(), pack_position(0, i as u32 + 1)))
            .collect()
    }

    fn bound_accum(settings: &RtSettings) -> Accumulator {
        let mut accum = Accumulator::new();
        accum.bind(1, &test_schema(), settings).unwrap();
        accum
    }

    #[test]
    fn test_commit_builds_segment() {
        let settings = RtSettings::default();
        let dict = PlainDictionary::default();
        let mut accum = bound_accum(&settings);

        let doc = Document::new(DocId(1)).with_attr(AttrValue::Uint(10));
        accum
            .add_document(&doc, false, &terms(&["hello", "world"]), &dict)
            .unwrap();

        let fingerprint = test_schema().fingerprint();
        let (segment, kills) = accum.commit(fingerprint).unwrap();
        let segment = segment.unwrap();
        assert!(kills.is_empty());
        assert_eq!(segment.row_count(), 1);
        assert_eq!(segment.alive_rows(), 1);
        assert_eq!(segment.word_count(), 2);
        assert_eq!(segment.find_alive_row(DocId(1)), Some(0));
        assert!(!accum.is_dirty());
    }

    #[test]
    fn test_empty_commit_yields_no_segment() {
        let settings = RtSettings::default();
        let mut accum = bound_accum(&settings);
        accum.delete_document(&[DocId(7)]);
        let (segment, kills) = accum.commit(test_schema().fingerprint()).unwrap();
        assert!(segment.is_none());
        assert_eq!(kills, vec![DocId(7)]);
    }

    #[test]
    fn test_replace_appends_to_kill_list() {
        let settings = RtSettings::default();
        let dict = PlainDictionary::default();
        let mut accum = bound_accum(&settings);
        let doc = Document::new(DocId(5));
        accum.add_document(&doc, true, &terms(&["a"]), &dict).unwrap();
        assert_eq!(accum.kill_list(), &[DocId(5)]);
    }

    #[test]
    fn test_dedup_replace_keeps_last() {
        let settings = RtSettings::default();
        let dict = PlainDictionary::default();
        let mut accum = bound_accum(&settings);

        let first = Document::new(DocId(1)).with_attr(AttrValue::Uint(1));
        let second = Document::new(DocId(1)).with_attr(AttrValue::Uint(2));
        accum.add_document(&first, true, &terms(&["a"]), &dict).unwrap();
        accum.add_document(&second, true, &terms(&["b"]), &dict).unwrap();

        let (segment, _) = accum.commit(test_schema().fingerprint()).unwrap();
        let segment = segment.unwrap();
        assert_eq!(segment.row_count(), 1);
        let attrs = segment.attrs().read();
        // Surviving row is the second copy
        assert_eq!(attrs.row(0)[2], 2);
    }

    #[test]
    fn test_dedup_insert_keeps_first() {
        let settings = RtSettings::default();
        let dict = PlainDictionary::default();
        let mut accum = bound_accum(&settings);

        let first = Document::new(DocId(1)).with_attr(AttrValue::Uint(1));
        let second = Document::new(DocId(1)).with_attr(AttrValue::Uint(2));
        accum.add_document(&first, false, &terms(&["a"]), &dict).unwrap();
        accum.add_document(&second, false, &terms(&["b"]), &dict).unwrap();

        let (segment, kills) = accum.commit(test_schema().fingerprint()).unwrap();
        let segment = segment.unwrap();
        assert!(kills.is_empty());
        assert_eq!(segment.row_count(), 1);
        let attrs = segment.attrs().read();
        assert_eq!(attrs.row(0)[2], 1);
    }

    #[test]
    fn test_rebind_to_other_index_rejected() {
        let settings = RtSettings::default();
        let dict = PlainDictionary::default();
        let mut accum = bound_accum(&settings);
        let doc = Document::new(DocId(1));
        accum.add_document(&doc, false, &terms(&["a"]), &dict).unwrap();

        let err = accum.bind(2, &test_schema(), &settings).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);

        // After rollback the accumulator can be re-bound
        accum.rollback();
        assert!(accum.bind(2, &test_schema(), &settings).is_ok());
    }

    #[test]
    fn test_schema_mismatch_at_commit() {
        let settings = RtSettings::default();
        let dict = PlainDictionary::default();
        let mut accum = bound_accum(&settings);
        let doc = Document::new(DocId(1));
        accum.add_document(&doc, false, &terms(&["a"]), &dict).unwrap();

        let err = accum.commit(0xBAD).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SchemaMismatch);
    }
}
