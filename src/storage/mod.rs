pub mod job;
pub mod video;

pub use job::memory::InMemoryJobStorage;
pub use job::sqlite::SqliteJobStorage;
pub use job::JobStorage;
pub use video::{InMemoryVideoCatalog, SqliteVideoCatalog, VideoInfo, VideoProvider};
