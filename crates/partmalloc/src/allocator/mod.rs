pub mod root;
pub mod thread_cache;

pub use root::{PartitionOptions, PartitionRoot};
