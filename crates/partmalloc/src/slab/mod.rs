pub mod bucket;
pub mod freelist;
pub mod page;
pub mod size_class;

pub use bucket::Bucket;
pub use page::{SlotSpan, SuperPageExtent};
pub use size_class::{bucket_index_for_size, bucket_size};
