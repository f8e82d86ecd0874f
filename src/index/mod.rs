pub mod rt_index;

pub use rt_index::RtIndex;
