//! 本地存储的行模型
//!
//! 三类实体行均以 (id, uid) 为主键，带 is_deleted 软删标记；
//! sync_cursors 按 (uid, data_type) 记录增量同步游标。
//! 字段与 SQLite 列一一对应，内存对象的转换在 `sync` 模块。

/// 评论行（id 即 rpid）
#[derive(Debug, Clone, PartialEq)]
pub struct CommentRecord {
    pub id: i64,
    pub uid: i64,
    pub oid: i64,
    pub r#type: i64,
    pub content: String,
    pub notify_id: Option<i64>,
    pub tp: Option<i64>,
    pub source: String,
    pub created_time: i64,
    pub synced_time: i64,
    pub is_deleted: bool,
    pub video_uri: Option<String>,
    pub like_count: i64,
}

/// 弹幕行（id 即 dmid）
#[derive(Debug, Clone, PartialEq)]
pub struct DanmuRecord {
    pub id: i64,
    pub uid: i64,
    pub content: String,
    pub cid: i64,
    pub notify_id: Option<i64>,
    pub source: String,
    pub created_time: i64,
    pub synced_time: i64,
    pub is_deleted: bool,
    pub video_url: Option<String>,
}

/// 通知行
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyRecord {
    pub id: i64,
    pub uid: i64,
    pub content: String,
    pub tp: i64,
    pub system_notify_api: Option<i64>,
    pub source: String,
    pub created_time: i64,
    pub synced_time: i64,
    pub is_deleted: bool,
}

/// 增量同步游标
///
/// 信息流类 data_type 用 (cursor_id, cursor_time)，
/// 存档类把页号放在 cursor_id；extra_data 为自由格式 JSON 文本。
#[derive(Debug, Clone, PartialEq)]
pub struct SyncCursor {
    pub uid: i64,
    pub data_type: String,
    pub cursor_id: Option<i64>,
    pub cursor_time: Option<i64>,
    pub last_sync: i64,
    pub extra_data: String,
}
