pub mod engine;

use crate::core::types::{AttrValue, DocId};

/// One in-place attribute update request: for every doc id, a row of new
/// values parallel to `attrs`. Shared (`Arc`) so segments reserved by a
/// merge or save can queue it for replay onto the operation's output.
#[derive(Debug, Clone)]
pub struct UpdateBatch {
    pub attrs: Vec<String>,
    pub docs: Vec<DocId>,
    /// `values[i]` belongs to `docs[i]` and is parallel to `attrs`
    pub values: Vec<Vec<AttrValue>>,
    /// Unknown attribute names abort in strict mode, are ignored otherwise
    pub strict: bool,
}

/// Outcome surfaced to the caller
#[derive(Debug, Default, Clone)]
pub struct UpdateResult {
    pub affected: u64,
    pub warnings: Vec<String>,
}
