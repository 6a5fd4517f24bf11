//! 本地存储访问层（基于 sqlx）
//!
//! 所有写入都是 (id, uid) 上的 upsert，重复同步只覆盖不累积。
//! 删除分两档：软删（置 is_deleted）与物理删除，由删除执行器选择。

use crate::bili::database::models::{CommentRecord, DanmuRecord, NotifyRecord, SyncCursor};
use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// 用户数据统计
#[derive(Debug, Clone, Default)]
pub struct UserStats {
    pub total_comments: i64,
    pub deleted_comments: i64,
    pub total_danmus: i64,
    pub deleted_danmus: i64,
    pub total_notifies: i64,
    pub deleted_notifies: i64,
    /// data_type -> 最后同步时间戳
    pub last_sync_times: HashMap<String, i64>,
}

/// 足迹数据库句柄
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// 创建连接池并执行所有未执行的迁移
    pub async fn connect(db_url: &str) -> Result<Database> {
        // 内存库必须单连接：池里每个连接各自是一个独立的内存库
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(db_url)
            .await
            .with_context(|| format!("连接数据库失败: {db_url}"))?;

        sqlx::migrate!()
            .run(&pool)
            .await
            .context("执行数据库迁移失败")?;

        info!("[DB] 数据库就绪: {db_url}");
        Ok(Database { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// 批量 upsert 评论，返回写入条数
    pub async fn save_comments(&self, records: &[CommentRecord]) -> Result<usize> {
        let mut tx = self.pool.begin().await.context("开启事务失败")?;
        for r in records {
            sqlx::query(
                r#"
                INSERT INTO comments
                    (id, uid, oid, type, content, notify_id, tp, source,
                     created_time, synced_time, is_deleted, video_uri, like_count)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id, uid) DO UPDATE SET
                    oid = excluded.oid,
                    type = excluded.type,
                    content = excluded.content,
                    notify_id = excluded.notify_id,
                    tp = excluded.tp,
                    source = excluded.source,
                    created_time = excluded.created_time,
                    synced_time = excluded.synced_time,
                    video_uri = excluded.video_uri,
                    like_count = excluded.like_count
                "#,
            )
            .bind(r.id)
            .bind(r.uid)
            .bind(r.oid)
            .bind(r.r#type)
            .bind(&r.content)
            .bind(r.notify_id)
            .bind(r.tp)
            .bind(&r.source)
            .bind(r.created_time)
            .bind(r.synced_time)
            .bind(r.is_deleted as i64)
            .bind(&r.video_uri)
            .bind(r.like_count)
            .execute(&mut *tx)
            .await
            .context("写入评论失败")?;
        }
        tx.commit().await.context("提交评论事务失败")?;
        debug!("[DB] 已保存 {} 条评论", records.len());
        Ok(records.len())
    }

    /// 分页读取评论，默认过滤已软删的行
    pub async fn get_comments(
        &self,
        uid: u64,
        limit: i64,
        offset: i64,
        include_deleted: bool,
    ) -> Result<Vec<CommentRecord>> {
        let sql = if include_deleted {
            r#"SELECT * FROM comments WHERE uid = ?
               ORDER BY created_time DESC LIMIT ? OFFSET ?"#
        } else {
            r#"SELECT * FROM comments WHERE uid = ? AND is_deleted = 0
               ORDER BY created_time DESC LIMIT ? OFFSET ?"#
        };
        let rows = sqlx::query(sql)
            .bind(uid as i64)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .context("查询评论失败")?;

        Ok(rows.into_iter().map(comment_from_row).collect())
    }

    pub async fn mark_comment_deleted(&self, id: u64, uid: u64) -> Result<()> {
        sqlx::query("UPDATE comments SET is_deleted = 1 WHERE id = ? AND uid = ?")
            .bind(id as i64)
            .bind(uid as i64)
            .execute(&self.pool)
            .await
            .context("标记评论已删除失败")?;
        Ok(())
    }

    pub async fn delete_comment_permanently(&self, id: u64, uid: u64) -> Result<()> {
        sqlx::query("DELETE FROM comments WHERE id = ? AND uid = ?")
            .bind(id as i64)
            .bind(uid as i64)
            .execute(&self.pool)
            .await
            .context("物理删除评论失败")?;
        Ok(())
    }

    /// 批量 upsert 弹幕
    pub async fn save_danmus(&self, records: &[DanmuRecord]) -> Result<usize> {
        let mut tx = self.pool.begin().await.context("开启事务失败")?;
        for r in records {
            sqlx::query(
                r#"
                INSERT INTO danmus
                    (id, uid, content, cid, notify_id, source,
                     created_time, synced_time, is_deleted, video_url)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id, uid) DO UPDATE SET
                    content = excluded.content,
                    cid = excluded.cid,
                    notify_id = excluded.notify_id,
                    source = excluded.source,
                    created_time = excluded.created_time,
                    synced_time = excluded.synced_time,
                    video_url = excluded.video_url
                "#,
            )
            .bind(r.id)
            .bind(r.uid)
            .bind(&r.content)
            .bind(r.cid)
            .bind(r.notify_id)
            .bind(&r.source)
            .bind(r.created_time)
            .bind(r.synced_time)
            .bind(r.is_deleted as i64)
            .bind(&r.video_url)
            .execute(&mut *tx)
            .await
            .context("写入弹幕失败")?;
        }
        tx.commit().await.context("提交弹幕事务失败")?;
        debug!("[DB] 已保存 {} 条弹幕", records.len());
        Ok(records.len())
    }

    pub async fn get_danmus(
        &self,
        uid: u64,
        limit: i64,
        offset: i64,
        include_deleted: bool,
    ) -> Result<Vec<DanmuRecord>> {
        let sql = if include_deleted {
            r#"SELECT * FROM danmus WHERE uid = ?
               ORDER BY created_time DESC LIMIT ? OFFSET ?"#
        } else {
            r#"SELECT * FROM danmus WHERE uid = ? AND is_deleted = 0
               ORDER BY created_time DESC LIMIT ? OFFSET ?"#
        };
        let rows = sqlx::query(sql)
            .bind(uid as i64)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .context("查询弹幕失败")?;

        Ok(rows.into_iter().map(danmu_from_row).collect())
    }

    pub async fn mark_danmu_deleted(&self, id: u64, uid: u64) -> Result<()> {
        sqlx::query("UPDATE danmus SET is_deleted = 1 WHERE id = ? AND uid = ?")
            .bind(id as i64)
            .bind(uid as i64)
            .execute(&self.pool)
            .await
            .context("标记弹幕已删除失败")?;
        Ok(())
    }

    pub async fn delete_danmu_permanently(&self, id: u64, uid: u64) -> Result<()> {
        sqlx::query("DELETE FROM danmus WHERE id = ? AND uid = ?")
            .bind(id as i64)
            .bind(uid as i64)
            .execute(&self.pool)
            .await
            .context("物理删除弹幕失败")?;
        Ok(())
    }

    /// 批量 upsert 通知
    pub async fn save_notifies(&self, records: &[NotifyRecord]) -> Result<usize> {
        let mut tx = self.pool.begin().await.context("开启事务失败")?;
        for r in records {
            sqlx::query(
                r#"
                INSERT INTO notifies
                    (id, uid, content, tp, system_notify_api, source,
                     created_time, synced_time, is_deleted)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id, uid) DO UPDATE SET
                    content = excluded.content,
                    tp = excluded.tp,
                    system_notify_api = excluded.system_notify_api,
                    source = excluded.source,
                    created_time = excluded.created_time,
                    synced_time = excluded.synced_time
                "#,
            )
            .bind(r.id)
            .bind(r.uid)
            .bind(&r.content)
            .bind(r.tp)
            .bind(r.system_notify_api)
            .bind(&r.source)
            .bind(r.created_time)
            .bind(r.synced_time)
            .bind(r.is_deleted as i64)
            .execute(&mut *tx)
            .await
            .context("写入通知失败")?;
        }
        tx.commit().await.context("提交通知事务失败")?;
        debug!("[DB] 已保存 {} 条通知", records.len());
        Ok(records.len())
    }

    pub async fn get_notifies(
        &self,
        uid: u64,
        limit: i64,
        offset: i64,
        include_deleted: bool,
    ) -> Result<Vec<NotifyRecord>> {
        let sql = if include_deleted {
            r#"SELECT * FROM notifies WHERE uid = ?
               ORDER BY created_time DESC LIMIT ? OFFSET ?"#
        } else {
            r#"SELECT * FROM notifies WHERE uid = ? AND is_deleted = 0
               ORDER BY created_time DESC LIMIT ? OFFSET ?"#
        };
        let rows = sqlx::query(sql)
            .bind(uid as i64)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .context("查询通知失败")?;

        Ok(rows.into_iter().map(notify_from_row).collect())
    }

    pub async fn mark_notify_deleted(&self, id: u64, uid: u64) -> Result<()> {
        sqlx::query("UPDATE notifies SET is_deleted = 1 WHERE id = ? AND uid = ?")
            .bind(id as i64)
            .bind(uid as i64)
            .execute(&self.pool)
            .await
            .context("标记通知已删除失败")?;
        Ok(())
    }

    pub async fn delete_notify_permanently(&self, id: u64, uid: u64) -> Result<()> {
        sqlx::query("DELETE FROM notifies WHERE id = ? AND uid = ?")
            .bind(id as i64)
            .bind(uid as i64)
            .execute(&self.pool)
            .await
            .context("物理删除通知失败")?;
        Ok(())
    }

    /// 保存增量同步游标（按 (uid, data_type) upsert）
    pub async fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (uid, data_type, cursor_id, cursor_time, last_sync, extra_data)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(uid, data_type) DO UPDATE SET
                cursor_id = excluded.cursor_id,
                cursor_time = excluded.cursor_time,
                last_sync = excluded.last_sync,
                extra_data = excluded.extra_data
            "#,
        )
        .bind(cursor.uid)
        .bind(&cursor.data_type)
        .bind(cursor.cursor_id)
        .bind(cursor.cursor_time)
        .bind(cursor.last_sync)
        .bind(&cursor.extra_data)
        .execute(&self.pool)
        .await
        .context("保存同步游标失败")?;
        Ok(())
    }

    pub async fn get_cursor(&self, uid: u64, data_type: &str) -> Result<Option<SyncCursor>> {
        let row = sqlx::query(
            "SELECT * FROM sync_cursors WHERE uid = ? AND data_type = ?",
        )
        .bind(uid as i64)
        .bind(data_type)
        .fetch_optional(&self.pool)
        .await
        .context("查询同步游标失败")?;

        Ok(row.map(|m| SyncCursor {
            uid: m.get("uid"),
            data_type: m.get("data_type"),
            cursor_id: m.get("cursor_id"),
            cursor_time: m.get("cursor_time"),
            last_sync: m.get("last_sync"),
            extra_data: m.get("extra_data"),
        }))
    }

    /// 某用户已存储的全部评论 id（增量同步去重用）
    pub async fn comment_ids(&self, uid: u64) -> Result<HashSet<u64>> {
        let rows = sqlx::query("SELECT id FROM comments WHERE uid = ?")
            .bind(uid as i64)
            .fetch_all(&self.pool)
            .await
            .context("查询评论ID失败")?;
        Ok(rows.into_iter().map(|m| m.get::<i64, _>("id") as u64).collect())
    }

    pub async fn danmu_ids(&self, uid: u64) -> Result<HashSet<u64>> {
        let rows = sqlx::query("SELECT id FROM danmus WHERE uid = ?")
            .bind(uid as i64)
            .fetch_all(&self.pool)
            .await
            .context("查询弹幕ID失败")?;
        Ok(rows.into_iter().map(|m| m.get::<i64, _>("id") as u64).collect())
    }

    pub async fn notify_ids(&self, uid: u64) -> Result<HashSet<u64>> {
        let rows = sqlx::query("SELECT id FROM notifies WHERE uid = ?")
            .bind(uid as i64)
            .fetch_all(&self.pool)
            .await
            .context("查询通知ID失败")?;
        Ok(rows.into_iter().map(|m| m.get::<i64, _>("id") as u64).collect())
    }

    /// 某类通知的最新 created_time（增量同步的水位线）
    pub async fn latest_notify_time(&self, uid: u64, tp: u8) -> Result<i64> {
        let row = sqlx::query(
            "SELECT MAX(created_time) AS t FROM notifies WHERE uid = ? AND tp = ?",
        )
        .bind(uid as i64)
        .bind(tp as i64)
        .fetch_one(&self.pool)
        .await
        .context("查询通知水位线失败")?;
        Ok(row.get::<Option<i64>, _>("t").unwrap_or(0))
    }

    /// 系统通知的水位线（按 system_notify_api 是否存在区分）
    pub async fn latest_system_notify_time(&self, uid: u64) -> Result<i64> {
        let row = sqlx::query(
            r#"SELECT MAX(created_time) AS t FROM notifies
               WHERE uid = ? AND system_notify_api IS NOT NULL"#,
        )
        .bind(uid as i64)
        .fetch_one(&self.pool)
        .await
        .context("查询系统通知水位线失败")?;
        Ok(row.get::<Option<i64>, _>("t").unwrap_or(0))
    }

    pub async fn latest_comment_time(&self, uid: u64, source: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT MAX(created_time) AS t FROM comments WHERE uid = ? AND source = ?",
        )
        .bind(uid as i64)
        .bind(source)
        .fetch_one(&self.pool)
        .await
        .context("查询评论水位线失败")?;
        Ok(row.get::<Option<i64>, _>("t").unwrap_or(0))
    }

    pub async fn latest_danmu_time(&self, uid: u64, source: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT MAX(created_time) AS t FROM danmus WHERE uid = ? AND source = ?",
        )
        .bind(uid as i64)
        .bind(source)
        .fetch_one(&self.pool)
        .await
        .context("查询弹幕水位线失败")?;
        Ok(row.get::<Option<i64>, _>("t").unwrap_or(0))
    }

    async fn count_rows(&self, table: &str, uid: u64, deleted: bool) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) AS c FROM {table} WHERE uid = ? AND is_deleted = {}",
            deleted as i64
        );
        let row = sqlx::query(&sql)
            .bind(uid as i64)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("统计 {table} 失败"))?;
        Ok(row.get("c"))
    }

    /// 按种类 × 删除标记统计，附带各 data_type 的最后同步时间
    pub async fn get_stats(&self, uid: u64) -> Result<UserStats> {
        let mut stats = UserStats {
            total_comments: self.count_rows("comments", uid, false).await?,
            deleted_comments: self.count_rows("comments", uid, true).await?,
            total_danmus: self.count_rows("danmus", uid, false).await?,
            deleted_danmus: self.count_rows("danmus", uid, true).await?,
            total_notifies: self.count_rows("notifies", uid, false).await?,
            deleted_notifies: self.count_rows("notifies", uid, true).await?,
            last_sync_times: HashMap::new(),
        };

        let rows = sqlx::query(
            r#"SELECT data_type, MAX(last_sync) AS t FROM sync_cursors
               WHERE uid = ? GROUP BY data_type"#,
        )
        .bind(uid as i64)
        .fetch_all(&self.pool)
        .await
        .context("查询同步时间失败")?;
        for m in rows {
            stats
                .last_sync_times
                .insert(m.get("data_type"), m.get::<Option<i64>, _>("t").unwrap_or(0));
        }

        Ok(stats)
    }

    /// 清除指定用户的全部数据
    pub async fn clear_user_data(&self, uid: u64) -> Result<()> {
        for table in ["comments", "danmus", "notifies", "sync_cursors"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE uid = ?"))
                .bind(uid as i64)
                .execute(&self.pool)
                .await
                .with_context(|| format!("清除 {table} 失败"))?;
        }
        info!("[DB] 已清除用户 {} 的所有数据", uid);
        Ok(())
    }
}

fn comment_from_row(m: sqlx::sqlite::SqliteRow) -> CommentRecord {
    let is_deleted: i64 = m.get("is_deleted");
    CommentRecord {
        id: m.get("id"),
        uid: m.get("uid"),
        oid: m.get("oid"),
        r#type: m.get("type"),
        content: m.get("content"),
        notify_id: m.get("notify_id"),
        tp: m.get("tp"),
        source: m.get("source"),
        created_time: m.get("created_time"),
        synced_time: m.get("synced_time"),
        is_deleted: is_deleted != 0,
        video_uri: m.get("video_uri"),
        like_count: m.get("like_count"),
    }
}

fn danmu_from_row(m: sqlx::sqlite::SqliteRow) -> DanmuRecord {
    let is_deleted: i64 = m.get("is_deleted");
    DanmuRecord {
        id: m.get("id"),
        uid: m.get("uid"),
        content: m.get("content"),
        cid: m.get("cid"),
        notify_id: m.get("notify_id"),
        source: m.get("source"),
        created_time: m.get("created_time"),
        synced_time: m.get("synced_time"),
        is_deleted: is_deleted != 0,
        video_url: m.get("video_url"),
    }
}

fn notify_from_row(m: sqlx::sqlite::SqliteRow) -> NotifyRecord {
    let is_deleted: i64 = m.get("is_deleted");
    NotifyRecord {
        id: m.get("id"),
        uid: m.get("uid"),
        content: m.get("content"),
        tp: m.get("tp"),
        system_notify_api: m.get("system_notify_api"),
        source: m.get("source"),
        created_time: m.get("created_time"),
        synced_time: m.get("synced_time"),
        is_deleted: is_deleted != 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> Database {
        Database::connect("sqlite::memory:").await.unwrap()
    }

    fn comment(id: i64, uid: i64, content: &str) -> CommentRecord {
        CommentRecord {
            id,
            uid,
            oid: 100,
            r#type: 1,
            content: content.to_string(),
            notify_id: None,
            tp: Some(0),
            source: "bilibili".to_string(),
            created_time: 1000 + id,
            synced_time: 2000,
            is_deleted: false,
            video_uri: None,
            like_count: 0,
        }
    }

    #[tokio::test]
    async fn upsert_overwrites_instead_of_duplicating() {
        let db = memory_db().await;
        db.save_comments(&[comment(1, 42, "第一版")]).await.unwrap();
        db.save_comments(&[comment(1, 42, "第二版")]).await.unwrap();

        let rows = db.get_comments(42, 100, 0, true).await.unwrap();
        assert_eq!(rows.len(), 1, "重复同步不应产生重复行");
        assert_eq!(rows[0].content, "第二版");
    }

    #[tokio::test]
    async fn soft_delete_hides_rows_from_default_reads() {
        let db = memory_db().await;
        db.save_comments(&[comment(1, 42, "a"), comment(2, 42, "b")])
            .await
            .unwrap();
        db.mark_comment_deleted(1, 42).await.unwrap();

        let live = db.get_comments(42, 100, 0, false).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, 2);

        let all = db.get_comments(42, 100, 0, true).await.unwrap();
        assert_eq!(all.len(), 2);

        let stats = db.get_stats(42).await.unwrap();
        assert_eq!(stats.total_comments, 1);
        assert_eq!(stats.deleted_comments, 1);
    }

    #[tokio::test]
    async fn same_id_under_different_uid_is_distinct() {
        let db = memory_db().await;
        db.save_comments(&[comment(1, 42, "a"), comment(1, 43, "b")])
            .await
            .unwrap();
        db.delete_comment_permanently(1, 42).await.unwrap();

        assert!(db.get_comments(42, 100, 0, true).await.unwrap().is_empty());
        assert_eq!(db.get_comments(43, 100, 0, true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cursor_roundtrip_and_overwrite() {
        let db = memory_db().await;
        let mut cursor = SyncCursor {
            uid: 42,
            data_type: "liked".to_string(),
            cursor_id: Some(90),
            cursor_time: Some(1000),
            last_sync: 5000,
            extra_data: "{}".to_string(),
        };
        db.save_cursor(&cursor).await.unwrap();
        cursor.cursor_id = Some(80);
        cursor.last_sync = 6000;
        db.save_cursor(&cursor).await.unwrap();

        let loaded = db.get_cursor(42, "liked").await.unwrap().unwrap();
        assert_eq!(loaded.cursor_id, Some(80));
        assert_eq!(loaded.last_sync, 6000);
        assert!(db.get_cursor(42, "replied").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watermark_is_max_created_time_per_filter() {
        let db = memory_db().await;
        let mut a = comment(1, 42, "aicu");
        a.source = "aicu".to_string();
        a.created_time = 900;
        let mut b = comment(2, 42, "live");
        b.created_time = 1200;
        db.save_comments(&[a, b]).await.unwrap();

        assert_eq!(db.latest_comment_time(42, "aicu").await.unwrap(), 900);
        assert_eq!(db.latest_comment_time(42, "bilibili").await.unwrap(), 1200);
        assert_eq!(db.latest_notify_time(42, 0).await.unwrap(), 0, "无数据水位线为 0");
    }

    #[tokio::test]
    async fn clear_user_data_removes_everything() {
        let db = memory_db().await;
        db.save_comments(&[comment(1, 42, "a")]).await.unwrap();
        db.save_cursor(&SyncCursor {
            uid: 42,
            data_type: "liked".to_string(),
            cursor_id: None,
            cursor_time: None,
            last_sync: 1,
            extra_data: "{}".to_string(),
        })
        .await
        .unwrap();

        db.clear_user_data(42).await.unwrap();
        assert!(db.get_comments(42, 100, 0, true).await.unwrap().is_empty());
        assert!(db.get_cursor(42, "liked").await.unwrap().is_none());
    }
}
