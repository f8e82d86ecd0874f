pub mod executor;
pub mod expansion;
pub mod expr;
pub mod extended;
pub mod factors;
pub mod qword;
pub mod ranker;
pub mod sorter;
pub mod zones;

pub use executor::{FilterOp, KeywordStats, QueryArgs, QueryFilter, QueryMeta, multi_query};
pub use ranker::{MAX_BLOCK_DOCS, RankerKind};
pub use sorter::{MatchSorter, SortKey, StoredMatch};
