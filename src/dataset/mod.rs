pub mod hybrid;
pub mod serial;

pub use hybrid::{DatasetSnapshot, HybridDataset};
pub use serial::TaskExecutor;
