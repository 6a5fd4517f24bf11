//! 本地存储：SQLite 持久化、快照同步与水位线增量补数

pub mod dao;
pub mod incremental;
pub mod models;
pub mod sync;

pub use dao::{Database, UserStats};
pub use incremental::{DataType, IncrementalFetcher, SyncReport};
pub use models::{CommentRecord, DanmuRecord, NotifyRecord, SyncCursor};
pub use sync::SyncManager;
