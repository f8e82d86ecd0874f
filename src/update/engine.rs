use log::trace;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{AttrType, AttrValue, RowId, Schema, write_u64_cells};
use crate::segment::PostingsView;
use crate::update::{UpdateBatch, UpdateResult};

/// Validate the batch against the schema. Returns the resolved attribute
/// indexes, with `None` for names silently ignored in non-strict mode.
pub fn resolve_batch(schema: &Schema, batch: &UpdateBatch) -> Result<Vec<Option<usize>>> {
    let mut resolved = Vec::with_capacity(batch.attrs.len());
    for name in &batch.attrs {
        match schema.attr_index(name) {
            Some(0) => {
                return Err(Error::invalid("the document id attribute cannot be updated"));
            }
            Some(idx) => resolved.push(Some(idx)),
            None if batch.strict => {
                return Err(Error::new(
                    ErrorKind::NotFound,
                    format!("unknown attribute '{name}' in update"),
                ));
            }
            None => resolved.push(None),
        }
    }
    for values in &batch.values {
        if values.len() != batch.attrs.len() {
            return Err(Error::invalid("update value row width mismatch"));
        }
        for (value, resolved_idx) in values.iter().zip(&resolved) {
            if let Some(idx) = resolved_idx
                && !value.matches(schema.attrs[*idx].ty)
            {
                return Err(Error::new(
                    ErrorKind::SchemaMismatch,
                    format!(
                        "attribute '{}' got an incompatible update value",
                        schema.attrs[*idx].name
                    ),
                ));
            }
        }
    }
    Ok(resolved)
}

/// Apply one batch to a single segment or chunk view. JSON values go
/// through a dry-run pass first so a bad row is reported before anything
/// in the batch mutates. Returns rows affected plus per-row warnings.
pub fn apply_batch_to_view(
    schema: &Schema,
    view: &dyn PostingsView,
    batch: &UpdateBatch,
    resolved: &[Option<usize>],
) -> Result<UpdateResult> {
    // Target rows present and alive in this view
    let mut targets: Vec<(usize, RowId)> = Vec::new();
    for (doc_pos, &doc) in batch.docs.iter().enumerate() {
        if let Some(row) = view.rowid_of(doc)
            && !view.is_row_dead(row)
        {
            targets.push((doc_pos, row));
        }
    }
    if targets.is_empty() {
        return Ok(UpdateResult::default());
    }

    let mut result = UpdateResult::default();

    // Dry-run pass: every JSON payload must serialize before any write
    for &(doc_pos, _) in &targets {
        for (value, resolved_idx) in batch.values[doc_pos].iter().zip(resolved) {
            let Some(idx) = resolved_idx else { continue };
            if schema.attrs[*idx].ty == AttrType::Json
                && let AttrValue::Json(json) = value
                && let Err(err) = serde_json::to_vec(json)
            {
                result
                    .warnings
                    .push(format!("doc {}: bad JSON value: {err}", batch.docs[doc_pos].0));
            }
        }
    }

    let columnar_index: Vec<usize> = schema
        .attrs
        .iter()
        .enumerate()
        .filter(|(_, a)| a.columnar)
        .map(|(i, _)| i)
        .collect();

    let mut attrs = view.attrs().write();
    for &(doc_pos, row) in &targets {
        let mut touched = false;
        for (value, resolved_idx) in batch.values[doc_pos].iter().zip(resolved) {
            let Some(idx) = resolved_idx else { continue };
            let attr = &schema.attrs[*idx];

            if attr.columnar {
                let column = columnar_index
                    .iter()
                    .position(|&i| i == *idx)
                    .expect("columnar attr indexed");
                let cell = match value {
                    AttrValue::Uint(v) => *v as u64,
                    AttrValue::Bigint(v) => *v,
                    AttrValue::Float(v) => v.to_bits() as u64,
                    AttrValue::Bool(v) => *v as u64,
                    _ => continue,
                };
                if view.columnar()[column].set(row, cell) {
                    touched = true;
                }
                continue;
            }

            let offset = schema.attr_offset(*idx);
            match value {
                AttrValue::None => {}
                AttrValue::Uint(v) => {
                    attrs.row_mut(row)[offset] = *v;
                    touched = true;
                }
                AttrValue::Bigint(v) => {
                    write_u64_cells(attrs.row_mut(row), offset, *v);
                    touched = true;
                }
                AttrValue::Float(v) => {
                    attrs.row_mut(row)[offset] = v.to_bits();
                    touched = true;
                }
                AttrValue::Bool(v) => {
                    attrs.row_mut(row)[offset] = *v as u32;
                    touched = true;
                }
                AttrValue::String(v) => {
                    // Grown payloads append to the pool; the row keeps the
                    // new offset
                    let blob = attrs.blobs.append_string(v);
                    write_u64_cells(attrs.row_mut(row), offset, blob);
                    touched = true;
                }
                AttrValue::Json(v) => match attrs.blobs.append_json(v) {
                    Ok(blob) => {
                        write_u64_cells(attrs.row_mut(row), offset, blob);
                        touched = true;
                    }
                    Err(err) => {
                        result
                            .warnings
                            .push(format!("doc {}: {err}", batch.docs[doc_pos].0));
                    }
                },
                AttrValue::MultiUint(v) => {
                    let blob = attrs.blobs.append_mva_u32(v);
                    write_u64_cells(attrs.row_mut(row), offset, blob);
                    touched = true;
                }
                AttrValue::MultiBigint(v) => {
                    let blob = attrs.blobs.append_mva_u64(v);
                    write_u64_cells(attrs.row_mut(row), offset, blob);
                    touched = true;
                }
            }
        }
        if touched {
            result.affected += 1;
            trace!("updated doc {} (row {row})", batch.docs[doc_pos].0);
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::PlainDictionary;
    use crate::accum::Accumulator;
    use crate::core::config::RtSettings;
    use crate::core::types::{AttrDef, DocId, Document, FieldDef, pack_position};
    use std::sync::Arc;

    fn schema() -> Schema {
        Schema::new(
            vec![
                AttrDef::new("price", AttrType::Uint),
                AttrDef::new("tag", AttrType::String),
            ],
            vec![FieldDef::new("title")],
        )
        .unwrap()
    }

    fn one_doc_segment(price: u32, tag: &str) -> Arc<crate::segment::ram_segment::RamSegment> {
        let settings = RtSettings::default();
        let dict = PlainDictionary::default();
        let mut accum = Accumulator::new();
        accum.bind(1, &schema(), &settings).unwrap();
        let doc = Document::new(DocId(1))
            .with_attr(AttrValue::Uint(price))
            .with_attr(AttrValue::String(tag.into()))
            .with_field("hello");
        accum
            .add_document(&doc, false, &[("hello".into(), pack_position(0, 1))], &dict)
            .unwrap();
        accum.commit(schema().fingerprint()).unwrap().0.unwrap()
    }

    #[test]
    fn test_rowwise_and_blob_update() {
        let segment = one_doc_segment(10, "old");
        let schema = schema();
        let batch = UpdateBatch {
            attrs: vec!["price".into(), "tag".into()],
            docs: vec![DocId(1)],
            values: vec![vec![AttrValue::Uint(99), AttrValue::String("new".into())]],
            strict: true,
        };
        let resolved = resolve_batch(&schema, &batch).unwrap();
        let result = apply_batch_to_view(&schema, segment.as_ref(), &batch, &resolved).unwrap();
        assert_eq!(result.affected, 1);
        assert!(result.warnings.is_empty());

        let attrs = segment.attrs().read();
        assert_eq!(attrs.row(0)[2], 99);
        let blob = attrs.get_u64(0, 3);
        assert_eq!(attrs.blobs.get_string(blob).unwrap(), "new");
    }

    #[test]
    fn test_unknown_attr_strict_vs_lax() {
        let schema = schema();
        let mut batch = UpdateBatch {
            attrs: vec!["missing".into()],
            docs: vec![DocId(1)],
            values: vec![vec![AttrValue::Uint(1)]],
            strict: true,
        };
        assert!(resolve_batch(&schema, &batch).is_err());

        batch.strict = false;
        let resolved = resolve_batch(&schema, &batch).unwrap();
        assert_eq!(resolved, vec![None]);
    }

    #[test]
    fn test_update_skips_absent_and_dead_docs() {
        let segment = one_doc_segment(10, "x");
        segment.kill(DocId(1));
        let schema = schema();
        let batch = UpdateBatch {
            attrs: vec!["price".into()],
            docs: vec![DocId(1), DocId(2)],
            values: vec![vec![AttrValue::Uint(5)], vec![AttrValue::Uint(6)]],
            strict: true,
        };
        let resolved = resolve_batch(&schema, &batch).unwrap();
        let result = apply_batch_to_view(&schema, segment.as_ref(), &batch, &resolved).unwrap();
        assert_eq!(result.affected, 0);
    }
}
