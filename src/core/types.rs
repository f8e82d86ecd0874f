use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind, Result};

/// Globally meaningful 64-bit document identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocId(pub u64);

impl DocId {
    pub fn new(id: u64) -> Self {
        DocId(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for DocId {
    fn from(id: u64) -> Self {
        DocId(id)
    }
}

/// Per-segment/per-chunk 32-bit row identifier
pub type RowId = u32;

/// Sentinel rowid; a row counter must never reach this value
pub const INVALID_ROWID: RowId = u32::MAX;

/// Numeric word identifier (numeric-dict mode) or interned keyword offset
pub type WordId = u64;

// Packed hit position layout: [field:8][field_end:1][in_field_pos:23]
pub const FIELD_BITS: u32 = 8;
pub const IN_FIELD_POS_BITS: u32 = 23;
pub const MAX_FIELD_POS: u32 = (1 << IN_FIELD_POS_BITS) - 1;
pub const FIELD_END_FLAG: u32 = 1 << IN_FIELD_POS_BITS;
pub const MAX_FIELDS: usize = 1 << FIELD_BITS;

/// Pack (field index, in-field position) into one hit position
pub fn pack_position(field: u32, pos: u32) -> u32 {
    (field << (IN_FIELD_POS_BITS + 1)) | (pos & MAX_FIELD_POS)
}

pub fn position_field(packed: u32) -> u32 {
    packed >> (IN_FIELD_POS_BITS + 1)
}

pub fn position_in_field(packed: u32) -> u32 {
    packed & MAX_FIELD_POS
}

pub fn position_is_field_end(packed: u32) -> bool {
    packed & FIELD_END_FLAG != 0
}

pub fn position_set_field_end(packed: u32) -> u32 {
    packed | FIELD_END_FLAG
}

/// One keyword occurrence inside one field of one accumulated document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    /// Word id (numeric dict) or byte offset into the interned keyword pool
    pub word: WordId,
    pub row_id: RowId,
    /// Packed position, see `pack_position`
    pub position: u32,
}

/// Attribute storage type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrType {
    Uint,
    Bigint,
    Float,
    Bool,
    String,
    Json,
    MultiUint,
    MultiBigint,
}

impl AttrType {
    /// Width of the attribute cell in 32-bit row words
    pub fn cell_width(&self) -> usize {
        match self {
            AttrType::Uint | AttrType::Float | AttrType::Bool => 1,
            // Bigints and blob offsets take two row words
            AttrType::Bigint
            | AttrType::String
            | AttrType::Json
            | AttrType::MultiUint
            | AttrType::MultiBigint => 2,
        }
    }

    /// True for variable-length attributes stored in the blob pool
    pub fn is_blob(&self) -> bool {
        matches!(
            self,
            AttrType::String | AttrType::Json | AttrType::MultiUint | AttrType::MultiBigint
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttrDef {
    pub name: String,
    pub ty: AttrType,
    /// Stored through the columnar builder instead of the row
    pub columnar: bool,
}

impl AttrDef {
    pub fn new(name: impl Into<String>, ty: AttrType) -> Self {
        AttrDef {
            name: name.into(),
            ty,
            columnar: false,
        }
    }
}

/// Full-text field definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    /// Original field bytes are kept in the docstore
    pub stored: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>) -> Self {
        FieldDef {
            name: name.into(),
            stored: true,
        }
    }
}

/// Index schema: attribute row layout plus full-text fields.
/// Attribute 0 is always the document id (bigint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub attrs: Vec<AttrDef>,
    pub fields: Vec<FieldDef>,
    /// Cell offset of each attribute within a row
    offsets: Vec<usize>,
    /// Row width in 32-bit words
    stride: usize,
}

impl Schema {
    pub fn new(mut attrs: Vec<AttrDef>, fields: Vec<FieldDef>) -> Result<Self> {
        // The document id is implicit attribute 0
        if attrs.first().map(|a| a.name.as_str()) != Some("id") {
            attrs.insert(0, AttrDef::new("id", AttrType::Bigint));
        }
        if attrs[0].ty != AttrType::Bigint {
            return Err(Error::new(
                ErrorKind::SchemaMismatch,
                "attribute 'id' must be a bigint",
            ));
        }
        if fields.len() > MAX_FIELDS {
            return Err(Error::invalid(format!(
                "too many full-text fields ({}, max {})",
                fields.len(),
                MAX_FIELDS
            )));
        }

        let mut offsets = Vec::with_capacity(attrs.len());
        let mut stride = 0usize;
        for attr in &attrs {
            offsets.push(stride);
            if !attr.columnar {
                stride += attr.ty.cell_width();
            }
        }

        Ok(Schema {
            attrs,
            fields,
            offsets,
            stride,
        })
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn attr_offset(&self, idx: usize) -> usize {
        self.offsets[idx]
    }

    pub fn attr_index(&self, name: &str) -> Option<usize> {
        self.attrs.iter().position(|a| a.name == name)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn has_blobs(&self) -> bool {
        self.attrs.iter().any(|a| a.ty.is_blob() && !a.columnar)
    }

    pub fn has_columnar(&self) -> bool {
        self.attrs.iter().any(|a| a.columnar)
    }

    /// FNV-1a hash over attribute and field declarations; captured by an
    /// accumulator when it binds to an index and re-checked at commit
    pub fn fingerprint(&self) -> u64 {
        let mut hash = 0xcbf29ce484222325u64;
        let mut feed = |bytes: &[u8]| {
            for &b in bytes {
                hash ^= b as u64;
                hash = hash.wrapping_mul(0x100000001b3);
            }
        };
        for attr in &self.attrs {
            feed(attr.name.as_bytes());
            feed(&[attr.ty as u8, attr.columnar as u8]);
        }
        for field in &self.fields {
            feed(field.name.as_bytes());
        }
        hash
    }

    /// Read the document id out of a row slice
    pub fn row_docid(&self, row: &[u32]) -> DocId {
        DocId(read_u64_cells(row, 0))
    }
}

/// Read a two-cell u64 value at the given cell offset
pub fn read_u64_cells(row: &[u32], offset: usize) -> u64 {
    (row[offset] as u64) | ((row[offset + 1] as u64) << 32)
}

/// Write a two-cell u64 value at the given cell offset
pub fn write_u64_cells(row: &mut [u32], offset: usize, value: u64) {
    row[offset] = value as u32;
    row[offset + 1] = (value >> 32) as u32;
}

/// Attribute value as supplied by a writer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    None,
    Uint(u32),
    Bigint(u64),
    Float(f32),
    Bool(bool),
    String(String),
    Json(serde_json::Value),
    MultiUint(Vec<u32>),
    MultiBigint(Vec<u64>),
}

impl AttrValue {
    /// Whether the value can be stored into an attribute of the given type
    pub fn matches(&self, ty: AttrType) -> bool {
        matches!(
            (self, ty),
            (AttrValue::None, _)
                | (AttrValue::Uint(_), AttrType::Uint)
                | (AttrValue::Uint(_), AttrType::Bigint)
                | (AttrValue::Bigint(_), AttrType::Bigint)
                | (AttrValue::Float(_), AttrType::Float)
                | (AttrValue::Bool(_), AttrType::Bool)
                | (AttrValue::String(_), AttrType::String)
                | (AttrValue::Json(_), AttrType::Json)
                | (AttrValue::MultiUint(_), AttrType::MultiUint)
                | (AttrValue::MultiBigint(_), AttrType::MultiBigint)
        )
    }
}

/// One document handed to `add_document`. Attribute values are parallel to
/// `schema.attrs[1..]` (the id lives in `id`); field texts are parallel to
/// `schema.fields`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocId,
    pub attrs: Vec<AttrValue>,
    pub fields: Vec<String>,
}

impl Document {
    pub fn new(id: DocId) -> Self {
        Document {
            id,
            attrs: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn with_attr(mut self, value: AttrValue) -> Self {
        self.attrs.push(value);
        self
    }

    pub fn with_field(mut self, text: impl Into<String>) -> Self {
        self.fields.push(text.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_packing() {
        let packed = pack_position(3, 17);
        assert_eq!(position_field(packed), 3);
        assert_eq!(position_in_field(packed), 17);
        assert!(!position_is_field_end(packed));

        let ended = position_set_field_end(packed);
        assert!(position_is_field_end(ended));
        assert_eq!(position_field(ended), 3);
        assert_eq!(position_in_field(ended), 17);

        // Positions in a later field always compare greater
        assert!(pack_position(1, MAX_FIELD_POS) < pack_position(2, 1));
    }

    #[test]
    fn test_schema_layout() {
        let schema = Schema::new(
            vec![
                AttrDef::new("price", AttrType::Uint),
                AttrDef::new("title_blob", AttrType::String),
            ],
            vec![FieldDef::new("title")],
        )
        .unwrap();

        // id (2 cells) + price (1) + blob offset (2)
        assert_eq!(schema.stride(), 5);
        assert_eq!(schema.attr_index("id"), Some(0));
        assert_eq!(schema.attr_offset(1), 2);
        assert_eq!(schema.attr_offset(2), 3);

        let mut row = vec![0u32; schema.stride()];
        write_u64_cells(&mut row, 0, 0xDEAD_BEEF_CAFE_F00D);
        assert_eq!(schema.row_docid(&row), DocId(0xDEAD_BEEF_CAFE_F00D));
    }

    #[test]
    fn test_schema_fingerprint_changes_with_shape() {
        let a = Schema::new(
            vec![AttrDef::new("price", AttrType::Uint)],
            vec![FieldDef::new("title")],
        )
        .unwrap();
        let b = Schema::new(
            vec![AttrDef::new("price", AttrType::Bigint)],
            vec![FieldDef::new("title")],
        )
        .unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
    }
}
