use log::debug;

use crate::chunk::{
    CHUNK_ATTR_MAGIC, CHUNK_DATA_MAGIC, CHUNK_DEAD_MAGIC, CHUNK_FORMAT_VERSION, CHUNK_INFO_MAGIC,
    ChunkAttrsData, ChunkInfo,
};
use crate::codec::skiplist::{SkiplistEntry, write_skiplist_block};
use crate::codec::doclist::{DocEntry, DoclistReader, DoclistWriter, HitRef};
use crate::codec::hitlist::{HitlistReader, HitlistWriter};
use crate::codec::wordlist::{WordEntry, WordlistWriter, iter_words, write_checkpoints};
use crate::core::config::RtSettings;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::globals::StopSignal;
use crate::core::types::{DocId, INVALID_ROWID, RowId, Schema, read_u64_cells, write_u64_cells};
use crate::segment::PostingsView;
use crate::segment::blob::BlobPool;
use crate::segment::columnar::{ColumnarBuilder, SimpleColumnarBuilder};
use crate::segment::docstore::DocStore;
use crate::segment::infix_bloom::build_infix_bloom;
use crate::storage::files::write_file;
use crate::storage::layout::IndexLayout;

pub struct ChunkWriteStats {
    pub rows: u32,
    pub words: u64,
}

/// Keep-filter over doc ids; `split` runs the writer twice with the
/// filter negated the second time
pub type KeepFilter<'a> = &'a (dyn Fn(DocId) -> bool + Sync);

/// Stream every alive row of `sources` (oldest first) into a new on-disk
/// chunk. Rows are re-sorted by doc id; posting lists are merged word by
/// word across all sources. Returns without creating any file when
/// nothing alive survives the filter.
pub fn write_chunk(
    layout: &IndexLayout,
    id: u32,
    sources: &[&dyn PostingsView],
    schema: &Schema,
    settings: &RtSettings,
    keep: Option<KeepFilter>,
    stop: &StopSignal,
) -> Result<ChunkWriteStats> {
    let stride = schema.stride();

    // Pass 1: gather alive rows across all sources, newest copy winning
    // on a doc-id collision, then order by doc id
    let mut gathered: Vec<(u64, usize, RowId)> = Vec::new();
    for (source_idx, source) in sources.iter().enumerate() {
        let attrs = source.attrs().read();
        for old_row in 0..source.row_count() {
            if source.is_row_dead(old_row) {
                continue;
            }
            let docid = attrs.docid(old_row);
            if let Some(keep) = keep
                && !keep(docid)
            {
                continue;
            }
            gathered.push((docid.0, source_idx, old_row));
        }
    }
    gathered.sort_unstable_by_key(|&(docid, source_idx, _)| (docid, source_idx));
    // A doc id alive in two sources collapses toward the newest source
    {
        let mut deduped: Vec<(u64, usize, RowId)> = Vec::with_capacity(gathered.len());
        for entry in gathered {
            match deduped.last_mut() {
                Some(last) if last.0 == entry.0 => *last = entry,
                _ => deduped.push(entry),
            }
        }
        gathered = deduped;
    }

    let row_count = gathered.len() as u32;
    if row_count == 0 {
        return Ok(ChunkWriteStats { rows: 0, words: 0 });
    }

    // Pass 2: copy rows in doc-id order, deep-copying blob payloads and
    // carrying columnar and docstore entries along
    let columnar_attrs: Vec<usize> = schema
        .attrs
        .iter()
        .enumerate()
        .filter(|(_, a)| a.columnar)
        .map(|(i, _)| i)
        .collect();
    let blob_attrs: Vec<(usize, usize)> = schema
        .attrs
        .iter()
        .enumerate()
        .filter(|(_, a)| a.ty.is_blob() && !a.columnar)
        .map(|(i, a)| {
            debug_assert!(a.ty.is_blob());
            (i, schema.attr_offset(i))
        })
        .collect();

    let mut row_maps: Vec<Vec<RowId>> = sources
        .iter()
        .map(|s| vec![INVALID_ROWID; s.row_count() as usize])
        .collect();
    let mut rows = Vec::with_capacity(row_count as usize * stride);
    let mut blobs = BlobPool::new();
    let mut docids = Vec::with_capacity(row_count as usize);
    let mut columnar_builders: Vec<Box<SimpleColumnarBuilder>> = columnar_attrs
        .iter()
        .map(|_| Box::new(SimpleColumnarBuilder::new()))
        .collect();
    let keep_docstore = sources.iter().all(|s| s.docstore().is_some());
    let mut docstore = if keep_docstore && settings.stored_fields {
        Some(DocStore::new(settings.docstore_compression))
    } else {
        None
    };

    for (new_row, &(docid, source_idx, old_row)) in gathered.iter().enumerate() {
        let source = sources[source_idx];
        let attrs = source.attrs().read();
        row_maps[source_idx][old_row as usize] = new_row as RowId;
        docids.push(docid);

        let row_start = rows.len();
        rows.extend_from_slice(attrs.row(old_row));
        for &(_, cell_offset) in &blob_attrs {
            let old_offset = read_u64_cells(&rows[row_start..], cell_offset);
            let new_offset = blobs.copy_from(&attrs.blobs, old_offset);
            write_u64_cells(&mut rows[row_start..], cell_offset, new_offset);
        }
        for (column, _) in columnar_attrs.iter().enumerate() {
            columnar_builders[column].push(source.columnar()[column].get(old_row));
        }
        if let Some(store) = docstore.as_mut() {
            // Presence checked above
            if let Some(src_store) = source.docstore() {
                store.append_from(src_store, old_row)?;
            }
        }
    }

    // Pass 3: lockstep word merge; at each step pick the smallest key
    // across source readers and concatenate surviving doc entries
    let dict_mode = settings.dict_mode;
    let mut readers: Vec<_> = sources
        .iter()
        .map(|s| iter_words(s.words(), s.checkpoints(), dict_mode).peekable())
        .collect();

    let mut words_out = Vec::new();
    let mut docs_out = Vec::new();
    let mut hits_out = Vec::new();
    let mut skiplist_out = Vec::new();
    let mut skiplist_dir = Vec::new();
    let mut wordlist = WordlistWriter::new(dict_mode, settings.checkpoint_interval);
    let mut doclist = DoclistWriter::new();
    let mut hitlist = HitlistWriter::new();
    let mut total_hits = 0u64;
    let block_size = settings.skiplist_block_size.max(1);

    loop {
        if stop.is_stopped() {
            return Err(Error::new(ErrorKind::Interrupted, "chunk write interrupted"));
        }
        let Some(min_key) = readers
            .iter_mut()
            .filter_map(|r| r.peek().map(|e| e.key.clone()))
            .min()
        else {
            break;
        };

        // (new_row, fields_mask, positions, hitless hit_count)
        let mut merged: Vec<(RowId, u32, Vec<u32>, u32)> = Vec::new();
        let mut has_hitlist = true;
        for (source_idx, reader) in readers.iter_mut().enumerate() {
            if reader.peek().map(|e| &e.key) != Some(&min_key) {
                continue;
            }
            let entry = reader.next().expect("peeked entry");
            has_hitlist &= entry.has_hitlist;
            let source = sources[source_idx];
            for doc in DoclistReader::new(source.docs(), entry.doclist_offset as usize, entry.doc_count)
            {
                let new_row = row_maps[source_idx][doc.row_id as usize];
                if new_row == INVALID_ROWID {
                    continue;
                }
                let positions: Vec<u32> = match doc.hit_ref {
                    HitRef::Inline(pos) => vec![pos],
                    HitRef::Offset(offset) if doc.hit_count > 0 => {
                        HitlistReader::new(source.hits(), offset as usize).collect()
                    }
                    HitRef::Offset(_) => Vec::new(),
                };
                merged.push((new_row, doc.fields_mask, positions, doc.hit_count));
            }
        }
        if merged.is_empty() {
            continue;
        }
        merged.sort_unstable_by_key(|&(row, ..)| row);

        let doclist_offset = docs_out.len() as u64;
        doclist.restart();
        let mut word_doc_count = 0u32;
        let mut word_hit_count = 0u64;
        let mut skip_entries: Vec<SkiplistEntry> = Vec::new();

        for (new_row, fields_mask, positions, raw_hit_count) in merged {
            let hit_ref = match positions.len() {
                0 => HitRef::Offset(0),
                1 => HitRef::Inline(positions[0]),
                _ => {
                    let offset = hits_out.len() as u64;
                    for &pos in &positions {
                        hitlist.push(&mut hits_out, pos);
                    }
                    hitlist.finish_doc(&mut hits_out);
                    HitRef::Offset(offset)
                }
            };
            let hit_count = if positions.is_empty() {
                raw_hit_count
            } else {
                positions.len() as u32
            };
            doclist.push(
                &mut docs_out,
                &DocEntry {
                    row_id: new_row,
                    fields_mask,
                    hit_count,
                    hit_ref,
                },
            );
            word_doc_count += 1;
            word_hit_count += positions.len() as u64;
            if word_doc_count % block_size == 0 {
                skip_entries.push(SkiplistEntry {
                    row_id: new_row,
                    doclist_offset: docs_out.len() as u64,
                    docs_consumed: word_doc_count,
                });
            }
        }
        total_hits += word_hit_count;

        if !skip_entries.is_empty() && word_doc_count > block_size {
            let block_offset = write_skiplist_block(&mut skiplist_out, &skip_entries);
            skiplist_dir.push((doclist_offset, block_offset));
        }

        wordlist.push(
            &mut words_out,
            &WordEntry {
                key: min_key,
                doc_count: word_doc_count,
                hit_count: word_hit_count,
                doclist_offset,
                has_hitlist,
            },
        );
    }

    let word_count = wordlist.word_count();
    let checkpoints = wordlist.finish();
    let bloom = if settings.infix_enabled() && !checkpoints.is_empty() {
        let filter = build_infix_bloom(
            &words_out,
            &checkpoints,
            dict_mode,
            settings.bloom_per_entry,
            settings.bloom_hashes,
        );
        Some((filter.raw().to_vec(), filter.per_entry(), filter.hashes()))
    } else {
        None
    };

    let mut checkpoints_raw = Vec::new();
    write_checkpoints(&mut checkpoints_raw, &checkpoints);

    let info = ChunkInfo {
        dict_mode,
        row_count,
        stride: stride as u32,
        word_count,
        total_hits,
        docs_len: docs_out.len() as u64,
        hits_len: hits_out.len() as u64,
        checkpoints: checkpoints_raw,
        words: words_out,
        bloom,
        docids,
        skiplist: skiplist_out,
        skiplist_dir,
    };
    let attrs = ChunkAttrsData {
        rows,
        blobs: blobs.raw().to_vec(),
        columnar: columnar_builders
            .into_iter()
            .map(|b| {
                let builder: Box<dyn ColumnarBuilder> = b;
                builder.finish().to_values()
            })
            .collect(),
        docstore,
    };

    // .spd carries doclists then hitlists back to back
    let mut data = Vec::with_capacity(docs_out.len() + hits_out.len());
    data.extend_from_slice(&docs_out);
    data.extend_from_slice(&hits_out);

    write_file(
        &layout.chunk_path(id, "spi"),
        CHUNK_INFO_MAGIC,
        CHUNK_FORMAT_VERSION,
        &bincode::serialize(&info)?,
    )?;
    write_file(
        &layout.chunk_path(id, "spd"),
        CHUNK_DATA_MAGIC,
        CHUNK_FORMAT_VERSION,
        &data,
    )?;
    write_file(
        &layout.chunk_path(id, "spa"),
        CHUNK_ATTR_MAGIC,
        CHUNK_FORMAT_VERSION,
        &bincode::serialize(&attrs)?,
    )?;
    let dead_words = vec![0u64; (row_count as usize).div_ceil(64)];
    write_file(
        &layout.chunk_path(id, "spm"),
        CHUNK_DEAD_MAGIC,
        CHUNK_FORMAT_VERSION,
        &bincode::serialize(&dead_words)?,
    )?;

    debug!("chunk {id}: wrote {row_count} rows, {word_count} words");
    Ok(ChunkWriteStats {
        rows: row_count,
        words: word_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accum::Accumulator;
    use crate::analysis::PlainDictionary;
    use crate::chunk::DiskChunk;
    use crate::core::types::{AttrDef, AttrType, AttrValue, DocId, Document, FieldDef, pack_position};
    use crate::segment::ram_segment::RamSegment;
    use std::sync::Arc;

    fn test_schema() -> Schema {
        Schema::new(
            vec![
                AttrDef::new("price", AttrType::Uint),
                AttrDef::new("tag", AttrType::String),
            ],
            vec![FieldDef::new("title")],
        )
        .unwrap()
    }

    fn build_segment(ids: std::ops::Range<u64>) -> Arc<RamSegment> {
        let schema = test_schema();
        let settings = RtSettings::default();
        let dict = PlainDictionary::default();
        let mut accum = Accumulator::new();
        accum.bind(1, &schema, &settings).unwrap();
        for id in ids {
            let doc = Document::new(DocId(id))
                .with_attr(AttrValue::Uint(id as u32))
                .with_attr(AttrValue::String(format!("tag-{id}")))
                .with_field("every doc says this");
            let terms = vec![
                ("every".to_string(), pack_position(0, 1)),
                ("doc".to_string(), pack_position(0, 2)),
                (format!("only{id}"), pack_position(0, 3)),
            ];
            accum.add_document(&doc, false, &terms, &dict).unwrap();
        }
        accum.commit(schema.fingerprint()).unwrap().0.unwrap()
    }

    #[test]
    fn test_chunk_round_trip_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let layout = IndexLayout::new(dir.path().join("idx"));
        let segment = build_segment(10..20);
        segment.kill(DocId(13));

        let stats = write_chunk(
            &layout,
            0,
            &[segment.as_ref() as &dyn PostingsView],
            &test_schema(),
            &RtSettings::default(),
            None,
            &StopSignal::default(),
        )
        .unwrap();
        // Only alive rows make it to disk
        assert_eq!(stats.rows, 9);

        let chunk = DiskChunk::open(&layout, 0).unwrap();
        assert_eq!(chunk.row_count(), 9);
        assert_eq!(chunk.alive_rows(), 9);
        assert!(chunk.find_alive_row(DocId(13)).is_none());
        let row = chunk.find_alive_row(DocId(14)).unwrap();
        let attrs = chunk.attrs().read();
        assert_eq!(attrs.row(row)[2], 14);
        let blob = attrs.get_u64(row, 3);
        assert_eq!(attrs.blobs.get_string(blob).unwrap(), "tag-14");
        drop(attrs);

        // The shared word survived with one entry per alive doc
        let entry = crate::search::qword::lookup_word(
            chunk.as_ref(),
            &crate::codec::wordlist::WordKey::Keyword(b"every".to_vec()),
        )
        .unwrap();
        assert_eq!(entry.doc_count, 9);
    }

    #[test]
    fn test_kills_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let layout = IndexLayout::new(dir.path().join("idx"));
        let segment = build_segment(1..6);
        write_chunk(
            &layout,
            3,
            &[segment.as_ref() as &dyn PostingsView],
            &test_schema(),
            &RtSettings::default(),
            None,
            &StopSignal::default(),
        )
        .unwrap();

        {
            let chunk = DiskChunk::open(&layout, 3).unwrap();
            assert!(chunk.kill(DocId(2)));
            assert!(!chunk.kill(DocId(2)));
            chunk.save_deadmap().unwrap();
        }
        let chunk = DiskChunk::open(&layout, 3).unwrap();
        assert_eq!(chunk.alive_rows(), 4);
        assert!(chunk.find_alive_row(DocId(2)).is_none());
    }

    #[test]
    fn test_keep_filter_splits_rows() {
        let dir = tempfile::tempdir().unwrap();
        let layout = IndexLayout::new(dir.path().join("idx"));
        let segment = build_segment(1..11);

        let even: KeepFilter = &|doc: DocId| doc.0 % 2 == 0;
        let stats = write_chunk(
            &layout,
            0,
            &[segment.as_ref() as &dyn PostingsView],
            &test_schema(),
            &RtSettings::default(),
            Some(even),
            &StopSignal::default(),
        )
        .unwrap();
        assert_eq!(stats.rows, 5);
        let chunk = DiskChunk::open(&layout, 0).unwrap();
        assert!(chunk.find_alive_row(DocId(4)).is_some());
        assert!(chunk.find_alive_row(DocId(5)).is_none());
    }

    #[test]
    fn test_empty_write_creates_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = IndexLayout::new(dir.path().join("idx"));
        let segment = build_segment(1..3);
        segment.kill(DocId(1));
        segment.kill(DocId(2));

        let stats = write_chunk(
            &layout,
            0,
            &[segment.as_ref() as &dyn PostingsView],
            &test_schema(),
            &RtSettings::default(),
            None,
            &StopSignal::default(),
        )
        .unwrap();
        assert_eq!(stats.rows, 0);
        assert!(!layout.chunk_path(0, "spi").exists());
    }
}
