//! 删除管线：远端调用与串行执行器

pub mod executor;
pub mod remove;

pub use executor::{
    build_cascade_list, DeleteExecutor, DeleteItem, DeleteKind, DeleteListener, DeleteTally,
    EmptyDeleteListener, LocalCleanup,
};
pub use remove::{remove_comment, remove_danmu, remove_notify};
