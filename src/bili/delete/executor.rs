//! 删除执行器：严格串行、逐项限速、失败隔离
//!
//! 每个条目独立成败：远端确认删除后才做本地清理并通知监听器，
//! 失败只记录并多等一会儿，绝不中断整批。级联删除先把选中的通知
//! 展开成「通知 → 关联评论 → 关联弹幕」的平铺列表，再走同一执行器。

use crate::bili::api_service::BiliApi;
use crate::bili::database::Database;
use crate::bili::delete::remove::{remove_comment, remove_danmu, remove_notify};
use crate::bili::types::{Comment, Danmu, Notify};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteKind {
    Comment,
    Danmu,
    Notify,
}

impl DeleteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteKind::Comment => "评论",
            DeleteKind::Danmu => "弹幕",
            DeleteKind::Notify => "通知",
        }
    }
}

/// 待删除条目：远端 id + 删除所需的实体数据
#[derive(Debug, Clone)]
pub enum DeleteItem {
    Comment(u64, Comment),
    Danmu(u64, Danmu),
    Notify(u64, Notify),
}

impl DeleteItem {
    pub fn id(&self) -> u64 {
        match self {
            DeleteItem::Comment(id, _) | DeleteItem::Danmu(id, _) | DeleteItem::Notify(id, _) => {
                *id
            }
        }
    }

    pub fn kind(&self) -> DeleteKind {
        match self {
            DeleteItem::Comment(..) => DeleteKind::Comment,
            DeleteItem::Danmu(..) => DeleteKind::Danmu,
            DeleteItem::Notify(..) => DeleteKind::Notify,
        }
    }
}

/// 远端删除成功后对本地存储的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalCleanup {
    /// 不碰本地存储
    None,
    /// 置 is_deleted 标记
    SoftDelete,
    /// 物理删除行
    Purge,
}

/// 删除事件监听器
#[async_trait]
pub trait DeleteListener: Send + Sync {
    async fn on_deleted(&self, kind: DeleteKind, id: u64);
    async fn on_delete_failed(&self, kind: DeleteKind, id: u64, error: &str);
    async fn on_progress(&self, current: usize, total: usize);
}

/// 不处理任何事件的空监听器
pub struct EmptyDeleteListener;

#[async_trait]
impl DeleteListener for EmptyDeleteListener {
    async fn on_deleted(&self, _kind: DeleteKind, _id: u64) {}
    async fn on_delete_failed(&self, _kind: DeleteKind, _id: u64, _error: &str) {}
    async fn on_progress(&self, _current: usize, _total: usize) {}
}

/// 一批删除的逐项结果
#[derive(Debug, Default)]
pub struct DeleteTally {
    pub succeeded: Vec<(DeleteKind, u64)>,
    pub failed: Vec<(DeleteKind, u64, String)>,
}

impl DeleteTally {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

pub struct DeleteExecutor {
    /// 相邻两次删除之间的等待
    pub item_delay: Duration,
    /// 单项失败后的额外等待
    pub error_delay: Duration,
    pub cleanup: LocalCleanup,
}

impl DeleteExecutor {
    pub fn new(item_delay: Duration, cleanup: LocalCleanup) -> DeleteExecutor {
        DeleteExecutor {
            item_delay,
            error_delay: Duration::from_secs(5),
            cleanup,
        }
    }

    /// 单元测试用的零延迟执行器
    pub fn instant(cleanup: LocalCleanup) -> DeleteExecutor {
        DeleteExecutor {
            item_delay: Duration::ZERO,
            error_delay: Duration::ZERO,
            cleanup,
        }
    }

    /// 串行执行一批删除
    ///
    /// `db` 给出时按 `cleanup` 做本地清理；uid 标识目标用户的数据行。
    /// 停止标志在每个条目前检查，已完成的条目不回滚。
    pub async fn run(
        &self,
        api: &dyn BiliApi,
        db: Option<(&Database, u64)>,
        items: Vec<DeleteItem>,
        stop: &AtomicBool,
        listener: &dyn DeleteListener,
    ) -> Result<DeleteTally> {
        let total = items.len();
        let mut tally = DeleteTally::default();

        for (idx, item) in items.into_iter().enumerate() {
            if stop.load(Ordering::Relaxed) {
                info!("[Delete] 删除被停止，已完成 {}/{}", idx, total);
                break;
            }
            listener.on_progress(idx + 1, total).await;

            let kind = item.kind();
            let id = item.id();
            let result = match &item {
                DeleteItem::Comment(id, comment) => remove_comment(api, comment, *id).await,
                DeleteItem::Danmu(id, danmu) => remove_danmu(api, danmu, *id).await,
                DeleteItem::Notify(id, notify) => remove_notify(api, notify, *id).await,
            };

            match result {
                Ok(()) => {
                    if let Some((db, uid)) = db {
                        if let Err(e) = self.local_cleanup(db, uid, kind, id).await {
                            // 远端已删成功，本地清理失败不影响计数
                            error!("[Delete] {} {} 本地清理失败: {:#}", kind.as_str(), id, e);
                        }
                    }
                    listener.on_deleted(kind, id).await;
                    tally.succeeded.push((kind, id));
                }
                Err(e) => {
                    let msg = format!("{e:#}");
                    warn!("[Delete] {} {} 删除失败: {}", kind.as_str(), id, msg);
                    listener.on_delete_failed(kind, id, &msg).await;
                    tally.failed.push((kind, id, msg));
                    tokio::time::sleep(self.error_delay).await;
                }
            }

            if idx + 1 < total {
                tokio::time::sleep(self.item_delay).await;
            }
        }

        info!(
            "[Delete] ✅ 批次完成: 成功 {} 项, 失败 {} 项",
            tally.succeeded.len(),
            tally.failed.len()
        );
        Ok(tally)
    }

    async fn local_cleanup(
        &self,
        db: &Database,
        uid: u64,
        kind: DeleteKind,
        id: u64,
    ) -> Result<()> {
        match (self.cleanup, kind) {
            (LocalCleanup::None, _) => Ok(()),
            (LocalCleanup::SoftDelete, DeleteKind::Comment) => db.mark_comment_deleted(id, uid).await,
            (LocalCleanup::SoftDelete, DeleteKind::Danmu) => db.mark_danmu_deleted(id, uid).await,
            (LocalCleanup::SoftDelete, DeleteKind::Notify) => db.mark_notify_deleted(id, uid).await,
            (LocalCleanup::Purge, DeleteKind::Comment) => {
                db.delete_comment_permanently(id, uid).await
            }
            (LocalCleanup::Purge, DeleteKind::Danmu) => db.delete_danmu_permanently(id, uid).await,
            (LocalCleanup::Purge, DeleteKind::Notify) => {
                db.delete_notify_permanently(id, uid).await
            }
        }
    }
}

/// 把选中的通知展开为级联删除列表
///
/// 每条通知后面紧跟它的关联评论、再跟关联弹幕（通过 notify_id 线性扫描），
/// 保证依赖项在所属通知之后被处理。
pub fn build_cascade_list(
    selected: &[(u64, Notify)],
    comments: &HashMap<u64, Comment>,
    danmus: &HashMap<u64, Danmu>,
) -> Vec<DeleteItem> {
    let mut cascade = Vec::new();

    for (notify_id, notify) in selected {
        cascade.push(DeleteItem::Notify(*notify_id, notify.clone()));

        for (comment_id, comment) in comments {
            if comment.notify_id == Some(*notify_id) {
                cascade.push(DeleteItem::Comment(*comment_id, comment.clone()));
            }
        }
        for (danmu_id, danmu) in danmus {
            if danmu.notify_id == Some(*notify_id) {
                cascade.push(DeleteItem::Danmu(*danmu_id, danmu.clone()));
            }
        }
    }

    info!("[Delete] 级联删除列表: 共 {} 项", cascade.len());
    cascade
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bili::testutil::MockApi;
    use serde_json::json;

    fn comment_item(id: u64) -> DeleteItem {
        DeleteItem::Comment(id, Comment::new_with_notify(100, 1, "x".into(), 1, 0))
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_batch() {
        let api = MockApi::new();
        // 第二条返回业务错误，其余默认成功
        api.enqueue("reply/del", json!({ "code": 0 }));
        api.enqueue("reply/del", json!({ "code": -509, "message": "请求过于频繁" }));
        api.enqueue("reply/del", json!({ "code": 0 }));

        let executor = DeleteExecutor::instant(LocalCleanup::None);
        let tally = executor
            .run(
                &api,
                None,
                vec![comment_item(1), comment_item(2), comment_item(3)],
                &AtomicBool::new(false),
                &EmptyDeleteListener,
            )
            .await
            .unwrap();

        assert_eq!(tally.succeeded.len(), 2);
        assert_eq!(tally.failed.len(), 1);
        assert_eq!(tally.failed[0].1, 2);
        assert!(tally.failed[0].2.contains("请求过于频繁"));
    }

    #[tokio::test]
    async fn stop_flag_halts_before_next_item() {
        let api = MockApi::new();
        let stop = AtomicBool::new(true);
        let executor = DeleteExecutor::instant(LocalCleanup::None);
        let tally = executor
            .run(
                &api,
                None,
                vec![comment_item(1)],
                &stop,
                &EmptyDeleteListener,
            )
            .await
            .unwrap();
        assert_eq!(tally.total(), 0);
        assert!(api.recorded_posts().is_empty());
    }

    #[test]
    fn cascade_expands_dependents_after_their_notify() {
        let mut comments = HashMap::new();
        let mut danmus = HashMap::new();
        comments.insert(11, Comment::new_with_notify(1, 1, "a".into(), 1, 0));
        comments.insert(12, Comment::new_with_notify(1, 1, "b".into(), 2, 1));
        danmus.insert(21, Danmu::new_with_notify("c".into(), 5, 1));
        // 无主评论不进级联
        comments.insert(13, Comment::new_archived(9, 1, "d".into(), 0));

        let selected = vec![
            (1, Notify::new("n1".into(), 0)),
            (2, Notify::new("n2".into(), 1)),
        ];
        let cascade = build_cascade_list(&selected, &comments, &danmus);

        assert_eq!(cascade.len(), 5);
        let pos = |id: u64| cascade.iter().position(|i| i.id() == id).unwrap();
        // 依赖项排在所属通知之后
        assert!(pos(1) < pos(11));
        assert!(pos(1) < pos(21));
        assert!(pos(2) > pos(11));
        assert_eq!(pos(12), pos(2) + 1);
        assert!(!cascade.iter().any(|i| i.id() == 13));
    }
}
