//! 抓取断点与进度状态
//!
//! 断点只存在于内存：每个数据源一种，记录恢复分页所需的最小状态。
//! `FetchProgressState` 是编排器的工作集，断点为 `None` 且累积表非空
//! 即视为该源已完成。

use crate::bili::types::{Comment, Danmu, Notify};
use std::collections::HashMap;

/// 信息流类数据源（点赞/回复/@）的断点：服务器下发的游标对
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedRecovery {
    pub cursor_id: u64,
    pub cursor_time: u64,
}

/// 系统通知的断点：翻页游标 + 首页探测出的 API 变体
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemNotifyRecovery {
    pub cursor: u64,
    pub api_type: u8,
}

/// 存档类数据源的断点：页号从 1 起，`all_count` 仅用于进度展示
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveRecovery {
    pub uid: u64,
    pub page: u32,
    pub all_count: u64,
}

/// 编排器的工作集：六个数据源的累积表与断点
#[derive(Default)]
pub struct FetchProgressState {
    pub liked_notifies: HashMap<u64, Notify>,
    pub liked_comments: HashMap<u64, Comment>,
    pub liked_danmus: HashMap<u64, Danmu>,
    pub replyed_notifies: HashMap<u64, Notify>,
    pub replyed_comments: HashMap<u64, Comment>,
    pub ated_notifies: HashMap<u64, Notify>,
    pub system_notifies: HashMap<u64, Notify>,
    pub aicu_comments: HashMap<u64, Comment>,
    pub aicu_danmus: HashMap<u64, Danmu>,

    pub liked_recovery: Option<FeedRecovery>,
    pub replyed_recovery: Option<FeedRecovery>,
    pub ated_recovery: Option<FeedRecovery>,
    pub system_recovery: Option<SystemNotifyRecovery>,
    pub aicu_comment_recovery: Option<ArchiveRecovery>,
    pub aicu_danmu_recovery: Option<ArchiveRecovery>,

    /// 上次调用编排器时是否启用了存档源。中途关闭存档开关
    /// 必须清掉已积累的存档数据，否则会泄漏进本次结果。
    pub aicu_enabled_last_run: bool,
}

impl FetchProgressState {
    pub fn has_any_recovery(&self) -> bool {
        self.liked_recovery.is_some()
            || self.replyed_recovery.is_some()
            || self.ated_recovery.is_some()
            || self.system_recovery.is_some()
            || self.aicu_comment_recovery.is_some()
            || self.aicu_danmu_recovery.is_some()
    }

    /// 清空存档源的累积数据与断点（存档开关从开到关时调用）
    pub fn clear_archive(&mut self) {
        self.aicu_comments.clear();
        self.aicu_danmus.clear();
        self.aicu_comment_recovery = None;
        self.aicu_danmu_recovery = None;
    }

    /// 全部完成后的合并结果
    ///
    /// 通知按固定顺序取并集，后面的源在 id 冲突时覆盖前面的；
    /// 评论先并入点赞源再被回复源覆盖，存档启用时最后由存档覆盖；
    /// 弹幕同理（点赞源 + 存档源）。
    pub fn merged(&self, aicu_enabled: bool) -> MergedData {
        let mut notifies = self.liked_notifies.clone();
        notifies.extend(self.replyed_notifies.clone());
        notifies.extend(self.ated_notifies.clone());
        notifies.extend(self.system_notifies.clone());

        let mut comments = self.liked_comments.clone();
        comments.extend(self.replyed_comments.clone());
        let mut danmus = self.liked_danmus.clone();
        if aicu_enabled {
            comments.extend(self.aicu_comments.clone());
            danmus.extend(self.aicu_danmus.clone());
        }

        MergedData {
            notifies,
            comments,
            danmus,
        }
    }
}

/// 六源合并后的最终结果
#[derive(Debug, Clone, Default)]
pub struct MergedData {
    pub notifies: HashMap<u64, Notify>,
    pub comments: HashMap<u64, Comment>,
    pub danmus: HashMap<u64, Danmu>,
}
