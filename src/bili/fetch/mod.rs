//! 多源抓取管线：信息流 / 存档分页、断点续传与编排

pub mod archive;
pub mod feed;
pub mod orchestrator;
pub mod parse;
pub mod progress;

pub use orchestrator::{fetch, FetchOutcome, FetchPolicies};
pub use progress::{
    ArchiveRecovery, FeedRecovery, FetchProgressState, MergedData, SystemNotifyRecovery,
};
