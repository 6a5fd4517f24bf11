//! 内存对象与存储行之间的转换，以及整批快照的存取

use crate::bili::database::dao::Database;
use crate::bili::database::models::{CommentRecord, DanmuRecord, NotifyRecord, SyncCursor};
use crate::bili::fetch::MergedData;
use crate::bili::types::{now_ts, Comment, Danmu, Notify, Source};
use anyhow::{Context, Result};
use std::collections::HashMap;
use tracing::info;

/// 快照同步器：把一轮抓取的合并结果写进本地存储，或反向装载
pub struct SyncManager {
    db: Database,
}

impl SyncManager {
    pub fn new(db: Database) -> SyncManager {
        SyncManager { db }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// 保存一轮抓取的合并结果，返回 (通知, 评论, 弹幕) 写入条数
    pub async fn save_snapshot(&self, uid: u64, data: &MergedData) -> Result<(usize, usize, usize)> {
        let notifies = notifies_to_records(&data.notifies, uid);
        let comments = comments_to_records(&data.comments, uid);
        let danmus = danmus_to_records(&data.danmus, uid);

        let n = self.db.save_notifies(&notifies).await.context("保存通知快照失败")?;
        let c = self.db.save_comments(&comments).await.context("保存评论快照失败")?;
        let d = self.db.save_danmus(&danmus).await.context("保存弹幕快照失败")?;

        info!("[Sync] 快照已保存: 通知 {n} 条, 评论 {c} 条, 弹幕 {d} 条");
        Ok((n, c, d))
    }

    /// 从本地存储装载未删除的数据（限制 10 万行，按时间倒序）
    pub async fn load_snapshot(&self, uid: u64) -> Result<MergedData> {
        let notifies = self.db.get_notifies(uid, 100_000, 0, false).await?;
        let comments = self.db.get_comments(uid, 100_000, 0, false).await?;
        let danmus = self.db.get_danmus(uid, 100_000, 0, false).await?;

        Ok(MergedData {
            notifies: notifies
                .into_iter()
                .map(|r| (r.id as u64, notify_from_record(&r)))
                .collect(),
            comments: comments
                .into_iter()
                .map(|r| (r.id as u64, comment_from_record(&r)))
                .collect(),
            danmus: danmus
                .into_iter()
                .map(|r| (r.id as u64, danmu_from_record(&r)))
                .collect(),
        })
    }

    pub async fn update_cursor(
        &self,
        uid: u64,
        data_type: &str,
        cursor_id: Option<i64>,
        cursor_time: Option<i64>,
    ) -> Result<()> {
        self.db
            .save_cursor(&SyncCursor {
                uid: uid as i64,
                data_type: data_type.to_string(),
                cursor_id,
                cursor_time,
                last_sync: now_ts(),
                extra_data: "{}".to_string(),
            })
            .await
    }
}

pub fn comments_to_records(comments: &HashMap<u64, Comment>, uid: u64) -> Vec<CommentRecord> {
    comments
        .iter()
        .map(|(id, c)| CommentRecord {
            id: *id as i64,
            uid: uid as i64,
            oid: c.oid as i64,
            r#type: c.r#type,
            content: c.content.clone(),
            notify_id: c.notify_id.map(|v| v as i64),
            tp: c.tp.map(|v| v as i64),
            source: c.source.as_str().to_string(),
            created_time: c.created_time,
            synced_time: c.synced_time,
            is_deleted: false,
            video_uri: c.video_uri.clone(),
            like_count: c.like_count,
        })
        .collect()
}

pub fn danmus_to_records(danmus: &HashMap<u64, Danmu>, uid: u64) -> Vec<DanmuRecord> {
    danmus
        .iter()
        .map(|(id, d)| DanmuRecord {
            id: *id as i64,
            uid: uid as i64,
            content: d.content.clone(),
            cid: d.cid as i64,
            notify_id: d.notify_id.map(|v| v as i64),
            source: d.source.as_str().to_string(),
            created_time: d.created_time,
            synced_time: d.synced_time,
            is_deleted: false,
            video_url: d.video_url.clone(),
        })
        .collect()
}

pub fn notifies_to_records(notifies: &HashMap<u64, Notify>, uid: u64) -> Vec<NotifyRecord> {
    notifies
        .iter()
        .map(|(id, n)| NotifyRecord {
            id: *id as i64,
            uid: uid as i64,
            content: n.content.clone(),
            tp: n.tp as i64,
            system_notify_api: n.system_notify_api.map(|v| v as i64),
            source: n.source.as_str().to_string(),
            created_time: n.created_time,
            synced_time: n.synced_time,
            is_deleted: false,
        })
        .collect()
}

pub fn comment_from_record(r: &CommentRecord) -> Comment {
    Comment {
        oid: r.oid as u64,
        r#type: r.r#type,
        content: r.content.clone(),
        notify_id: r.notify_id.map(|v| v as u64),
        tp: r.tp.map(|v| v as u8),
        source: Source::from_str(&r.source),
        created_time: r.created_time,
        synced_time: r.synced_time,
        video_uri: r.video_uri.clone(),
        like_count: r.like_count,
    }
}

pub fn danmu_from_record(r: &DanmuRecord) -> Danmu {
    Danmu {
        content: r.content.clone(),
        cid: r.cid as u64,
        notify_id: r.notify_id.map(|v| v as u64),
        source: Source::from_str(&r.source),
        created_time: r.created_time,
        synced_time: r.synced_time,
        video_url: r.video_url.clone(),
    }
}

pub fn notify_from_record(r: &NotifyRecord) -> Notify {
    Notify {
        content: r.content.clone(),
        tp: r.tp as u8,
        system_notify_api: r.system_notify_api.map(|v| v as u8),
        source: Source::from_str(&r.source),
        created_time: r.created_time,
        synced_time: r.synced_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_roundtrip_preserves_entities() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let manager = SyncManager::new(db);

        let mut data = MergedData::default();
        let mut notify = Notify::new_system_notify("系统\n正文".into(), 4, 1);
        notify.created_time = 1111;
        data.notifies.insert(1, notify);
        let mut comment = Comment::new_with_notify(100, 17, "评论".into(), 1, 0);
        comment.video_uri = Some("https://t.bilibili.com/100".into());
        data.comments.insert(2, comment);
        data.danmus
            .insert(3, Danmu::new_archived("弹幕".into(), 55, 999));

        let (n, c, d) = manager.save_snapshot(42, &data).await.unwrap();
        assert_eq!((n, c, d), (1, 1, 1));

        let loaded = manager.load_snapshot(42).await.unwrap();
        assert_eq!(loaded.notifies[&1].system_notify_api, Some(1));
        assert_eq!(loaded.notifies[&1].created_time, 1111);
        assert_eq!(loaded.comments[&2].notify_id, Some(1));
        assert_eq!(
            loaded.comments[&2].video_uri.as_deref(),
            Some("https://t.bilibili.com/100")
        );
        assert_eq!(loaded.danmus[&3].source, Source::Aicu);
        assert_eq!(loaded.danmus[&3].cid, 55);
    }

    #[tokio::test]
    async fn resaving_snapshot_does_not_duplicate() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let manager = SyncManager::new(db);

        let mut data = MergedData::default();
        data.comments
            .insert(1, Comment::new_archived(9, 1, "v1".into(), 10));
        manager.save_snapshot(42, &data).await.unwrap();

        data.comments
            .insert(1, Comment::new_archived(9, 1, "v2".into(), 20));
        manager.save_snapshot(42, &data).await.unwrap();

        let loaded = manager.load_snapshot(42).await.unwrap();
        assert_eq!(loaded.comments.len(), 1);
        assert_eq!(loaded.comments[&1].content, "v2");
    }
}
