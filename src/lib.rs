//! Real-time hybrid full-text index core.
//!
//! One logical index is served from two layers that readers see as one:
//! mutable RAM segments built per commit, and immutable disk chunks the
//! RAM layer is periodically promoted into. Background merges coalesce
//! small RAM segments; the optimizer merges, splits, and compacts disk
//! chunks; attribute updates land in place on both layers and follow
//! in-flight merges through postponed-update queues.
//!
//! Entry point: [`index::RtIndex`]. Writers buffer documents in an
//! [`accum::Accumulator`] and commit; readers run ranked queries through
//! [`search::executor::multi_query`] against an atomic dataset snapshot.

pub mod accum;
pub mod analysis;
pub mod chunk;
pub mod codec;
pub mod core;
pub mod dataset;
pub mod index;
pub mod merge;
pub mod query;
pub mod search;
pub mod segment;
pub mod storage;
pub mod update;

pub use crate::accum::Accumulator;
pub use crate::core::config::RtSettings;
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::types::{AttrDef, AttrType, AttrValue, DocId, Document, FieldDef, Schema};
pub use crate::index::RtIndex;
pub use crate::query::{QueryNode, TermNode};
pub use crate::search::{MatchSorter, QueryArgs, RankerKind, SortKey};
pub use crate::storage::layout::IndexLayout;
