pub mod bucket;
pub mod create;
pub mod delete;
pub mod fsck;
pub mod list;
pub mod mount;
pub mod unmount;

pub use bucket::{CreateBucket, DeleteBucket};
pub use create::Create;
pub use delete::Delete;
pub use fsck::Fsck;
pub use list::List;
pub use mount::Mount;
pub use unmount::Unmount;
