pub mod args;
pub mod op;
pub mod ops;

pub use ops::{Create, CreateBucket, Delete, DeleteBucket, Fsck, List, Mount, Unmount};
