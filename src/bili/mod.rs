//! B 站足迹管理核心
//!
//! 六个数据源（点赞 / 回复 / @ / 系统通知 / AICU 评论 / AICU 弹幕）的
//! 抓取、合并去重、删除执行与 SQLite 持久化。上层 UI 通过
//! `ProgressCallback` 收进度，通过停止标志打断长任务。

pub mod activity;
pub mod api_service;
pub mod backoff;
pub mod database;
pub mod delete;
pub mod fetch;
pub mod types;
