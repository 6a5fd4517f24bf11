pub mod bili;

// 重新导出常用类型和函数，方便外部使用
pub use bili::{
    api_service::{ApiService, BiliApi},
    database::{Database, IncrementalFetcher, SyncManager},
    delete::{DeleteExecutor, DeleteItem, DeleteTally, LocalCleanup},
    fetch::{fetch, FetchOutcome, FetchPolicies, FetchProgressState, MergedData},
    types::{Comment, Danmu, Notify, Progress, ProgressCallback, Source},
};
