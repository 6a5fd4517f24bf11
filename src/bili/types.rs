//! 核心数据类型定义
//!
//! 抓取管线内部流转的通知 / 评论 / 弹幕对象，以及进度回调相关类型。
//! 持久化用的记录结构在 `database::models` 中。

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 数据来源：B 站官方接口 或 AICU 第三方存档
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    Bilibili,
    Aicu,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Bilibili => "bilibili",
            Source::Aicu => "aicu",
        }
    }

    pub fn from_str(s: &str) -> Source {
        match s {
            "aicu" => Source::Aicu,
            _ => Source::Bilibili,
        }
    }
}

/// 当前 unix 时间戳（秒）
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// 通知对象
///
/// `tp`：0=点赞, 1=回复, 2=@, 4=系统通知；
/// `system_notify_api` 区分系统通知的两种删除 API（0/1），非系统通知为 None。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notify {
    pub content: String,
    pub tp: u8,
    pub system_notify_api: Option<u8>,
    pub source: Source,
    pub created_time: i64,
    pub synced_time: i64,
}

impl Notify {
    pub fn new(content: String, tp: u8) -> Notify {
        Notify {
            content,
            tp,
            system_notify_api: None,
            source: Source::Bilibili,
            created_time: 0,
            synced_time: now_ts(),
        }
    }

    pub fn new_system_notify(content: String, tp: u8, api_type: u8) -> Notify {
        Notify {
            system_notify_api: Some(api_type),
            ..Notify::new(content, tp)
        }
    }
}

/// 评论对象
///
/// `notify_id` 是指向通知的弱引用，允许悬空；`tp` 记录发现该评论时的通知类型。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub oid: u64,
    pub r#type: i64,
    pub content: String,
    pub notify_id: Option<u64>,
    pub tp: Option<u8>,
    pub source: Source,
    pub created_time: i64,
    pub synced_time: i64,
    pub video_uri: Option<String>,
    pub like_count: i64,
}

impl Comment {
    pub fn new_with_notify(
        oid: u64,
        r#type: i64,
        content: String,
        notify_id: u64,
        tp: u8,
    ) -> Comment {
        Comment {
            oid,
            r#type,
            content,
            notify_id: Some(notify_id),
            tp: Some(tp),
            source: Source::Bilibili,
            created_time: 0,
            synced_time: now_ts(),
            video_uri: None,
            like_count: 0,
        }
    }

    /// AICU 存档来源的评论（没有关联通知）
    pub fn new_archived(oid: u64, r#type: i64, content: String, created_time: i64) -> Comment {
        Comment {
            oid,
            r#type,
            content,
            notify_id: None,
            tp: None,
            source: Source::Aicu,
            created_time,
            synced_time: now_ts(),
            video_uri: None,
            like_count: 0,
        }
    }
}

/// 弹幕对象
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Danmu {
    pub content: String,
    pub cid: u64,
    pub notify_id: Option<u64>,
    pub source: Source,
    pub created_time: i64,
    pub synced_time: i64,
    pub video_url: Option<String>,
}

impl Danmu {
    pub fn new_with_notify(content: String, cid: u64, notify_id: u64) -> Danmu {
        Danmu {
            content,
            cid,
            notify_id: Some(notify_id),
            source: Source::Bilibili,
            created_time: 0,
            synced_time: now_ts(),
            video_url: None,
        }
    }

    /// AICU 存档来源的弹幕
    pub fn new_archived(content: String, cid: u64, created_time: i64) -> Danmu {
        Danmu {
            content,
            cid,
            notify_id: None,
            source: Source::Aicu,
            created_time,
            synced_time: now_ts(),
            video_url: None,
        }
    }
}

/// 活动信息快照，用于向调用方展示当前抓取状态（不持久化）
#[derive(Debug, Clone)]
pub struct ActivityInfo {
    pub message: String,
    pub current_count: u64,
    /// 条/秒，0 表示该阶段已完成
    pub speed: f64,
    pub elapsed_secs: f64,
    /// 数据类别（如 "liked"、"aicu_comments"）
    pub category: String,
}

impl std::fmt::Display for ActivityInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.speed > 0.0 {
            write!(
                f,
                "{} - 已获取 {} 项 [{:.1}/s] ({:.0}s)",
                self.message, self.current_count, self.speed, self.elapsed_secs
            )
        } else {
            write!(f, "{} - 已获取 {} 项", self.message, self.current_count)
        }
    }
}

/// 进度回调载荷：纯文本状态 或 活动信息快照
#[derive(Debug, Clone)]
pub enum Progress {
    Status(String),
    Activity(ActivityInfo),
}

/// 进度回调函数类型，由 GUI/CLI 层提供
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// 不做任何处理的空回调
pub fn noop_callback() -> ProgressCallback {
    Arc::new(|_| {})
}
