pub mod tree;

pub use tree::{QueryNode, TermExpand, TermNode};
