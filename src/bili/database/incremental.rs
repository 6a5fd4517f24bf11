//! 水位线增量同步
//!
//! 完整抓取代价太高，日常补数只从各信息流的最新端往回翻：
//! 水位线取本地存储中该类数据的最大 created_time，遇到不新于水位线的
//! 条目立即停止（信息流按时间倒序）。候选条目再按 id 与已存数据去重，
//! 余下的 upsert 入库并更新同步游标。不涉及断点机制，整个过程尽力而为，
//! 单类失败只记日志不中断其它类型。

use crate::bili::api_service::BiliApi;
use crate::bili::database::dao::Database;
use crate::bili::database::sync::{
    comments_to_records, danmus_to_records, notifies_to_records,
};
use crate::bili::fetch::feed::{
    collect_ated_item, collect_liked_item, collect_replyed_item, collect_system_notify_item,
    parse_time_at,
};
use crate::bili::fetch::archive::{collect_archived_comment, collect_archived_danmu};
use crate::bili::types::{Comment, Danmu, Notify, Progress, ProgressCallback};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

/// 信息流最多回看的页数，防止水位线失真时退化成全量抓取
const MAX_FEED_PAGES: u32 = 10;
/// 存档接口每页 500 条，放宽到 20 页
const MAX_ARCHIVE_PAGES: u32 = 20;

/// 增量同步覆盖的数据类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Liked,
    Replied,
    Ated,
    SystemNotify,
    AicuComments,
    AicuDanmus,
}

impl DataType {
    /// sync_cursors.data_type 的稳定字符串形式
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Liked => "liked",
            DataType::Replied => "replied",
            DataType::Ated => "ated",
            DataType::SystemNotify => "system_notify",
            DataType::AicuComments => "aicu_comments",
            DataType::AicuDanmus => "aicu_danmus",
        }
    }

    /// 信息流条目的时间戳字段名
    fn time_field(&self) -> &'static str {
        match self {
            DataType::Liked => "like_time",
            DataType::Replied => "reply_time",
            DataType::Ated => "at_time",
            DataType::SystemNotify => "time_at",
            DataType::AicuComments => "time",
            DataType::AicuDanmus => "ctime",
        }
    }
}

/// 一轮增量同步新增的条数
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncReport {
    pub new_notifies: usize,
    pub new_comments: usize,
    pub new_danmus: usize,
}

impl SyncReport {
    pub fn total(&self) -> usize {
        self.new_notifies + self.new_comments + self.new_danmus
    }

    fn merge(&mut self, other: SyncReport) {
        self.new_notifies += other.new_notifies;
        self.new_comments += other.new_comments;
        self.new_danmus += other.new_danmus;
    }
}

pub struct IncrementalFetcher {
    db: Database,
    feed_delay: Duration,
    archive_delay: Duration,
}

impl IncrementalFetcher {
    pub fn new(db: Database) -> IncrementalFetcher {
        IncrementalFetcher {
            db,
            feed_delay: Duration::from_secs(1),
            archive_delay: Duration::from_secs(2),
        }
    }

    /// 单元测试用的零延迟实例
    pub fn instant(db: Database) -> IncrementalFetcher {
        IncrementalFetcher {
            db,
            feed_delay: Duration::ZERO,
            archive_delay: Duration::ZERO,
        }
    }

    /// 某类数据的水位线：本地存储里该类的最大 created_time
    pub async fn latest_timestamp(&self, uid: u64, data_type: DataType) -> Result<i64> {
        match data_type {
            DataType::Liked => self.db.latest_notify_time(uid, 0).await,
            DataType::Replied => self.db.latest_notify_time(uid, 1).await,
            DataType::Ated => self.db.latest_notify_time(uid, 2).await,
            DataType::SystemNotify => self.db.latest_system_notify_time(uid).await,
            DataType::AicuComments => self.db.latest_comment_time(uid, "aicu").await,
            DataType::AicuDanmus => self.db.latest_danmu_time(uid, "aicu").await,
        }
    }

    /// 依次对所有类别做增量补数，单类失败不影响其它类别
    pub async fn sync_all(
        &self,
        api: &dyn BiliApi,
        uid: u64,
        aicu_enabled: bool,
        callback: &ProgressCallback,
    ) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        for data_type in [DataType::Liked, DataType::Replied, DataType::Ated] {
            callback(Progress::Status(format!(
                "获取新的{}数据...",
                data_type.as_str()
            )));
            match self.sync_feed(api, uid, data_type).await {
                Ok(r) => report.merge(r),
                Err(e) => warn!("[Incremental] {} 增量同步失败: {:#}", data_type.as_str(), e),
            }
        }

        callback(Progress::Status("获取新的系统通知...".to_string()));
        match self.sync_system_notify(api, uid).await {
            Ok(r) => report.merge(r),
            Err(e) => warn!("[Incremental] 系统通知增量同步失败: {:#}", e),
        }

        if aicu_enabled {
            callback(Progress::Status("获取新的AICU数据...".to_string()));
            match self.sync_aicu_comments(api, uid).await {
                Ok(r) => report.merge(r),
                Err(e) => warn!("[Incremental] AICU评论增量同步失败: {:#}", e),
            }
            match self.sync_aicu_danmus(api, uid).await {
                Ok(r) => report.merge(r),
                Err(e) => warn!("[Incremental] AICU弹幕增量同步失败: {:#}", e),
            }
        }

        info!(
            "[Incremental] ✅ 增量同步完成: 通知 +{}, 评论 +{}, 弹幕 +{}",
            report.new_notifies, report.new_comments, report.new_danmus
        );
        Ok(report)
    }

    /// 点赞 / 回复 / @ 信息流的增量补数
    pub async fn sync_feed(
        &self,
        api: &dyn BiliApi,
        uid: u64,
        data_type: DataType,
    ) -> Result<SyncReport> {
        let (base_url, nested_total) = match data_type {
            DataType::Liked => (
                "https://api.bilibili.com/x/msgfeed/like?platform=web&build=0&mobi_app=web",
                true,
            ),
            DataType::Replied => (
                "https://api.bilibili.com/x/msgfeed/reply?platform=web&build=0&mobi_app=web",
                false,
            ),
            DataType::Ated => (
                "https://api.bilibili.com/x/msgfeed/at?build=0&mobi_app=web",
                false,
            ),
            _ => return Ok(SyncReport::default()),
        };

        let watermark = self.latest_timestamp(uid, data_type).await?;
        let known_notifies = self.db.notify_ids(uid).await?;
        let time_field = data_type.time_field();

        let mut notifies: HashMap<u64, Notify> = HashMap::new();
        let mut comments: HashMap<u64, Comment> = HashMap::new();
        let mut danmus: HashMap<u64, Danmu> = HashMap::new();
        let mut cursor: Option<(u64, u64)> = None;
        let mut reached_watermark = false;

        for _page in 0..MAX_FEED_PAGES {
            let url = match cursor {
                None => base_url.to_string(),
                Some((id, time)) => format!("{base_url}&id={id}&{time_field}={time}"),
            };
            let json = api.get_json(&url).await?;
            if json["code"].as_i64().unwrap_or(0) != 0 {
                warn!(
                    "[Incremental] {} 接口返回错误码 {}",
                    data_type.as_str(),
                    json["code"]
                );
                break;
            }

            let container = if nested_total {
                &json["data"]["total"]
            } else {
                &json["data"]
            };
            let Some(items) = container["items"].as_array().filter(|v| !v.is_empty()) else {
                break;
            };

            for item in items {
                // 信息流按时间倒序，遇到水位线及更早的数据就可以收工
                if item[time_field].as_i64().unwrap_or(0) <= watermark {
                    reached_watermark = true;
                    break;
                }
                if let Some(id) = item["id"].as_u64() {
                    if known_notifies.contains(&id) {
                        continue;
                    }
                }
                match data_type {
                    DataType::Liked => collect_liked_item(&mut notifies, &mut comments, &mut danmus, item),
                    DataType::Replied => collect_replyed_item(&mut notifies, &mut comments, item),
                    DataType::Ated => collect_ated_item(&mut notifies, item),
                    _ => unreachable!("信息流增量只处理前三类"),
                }
            }

            let c = &container["cursor"];
            if let (Some(id), Some(time)) = (c["id"].as_u64(), c["time"].as_u64()) {
                cursor = Some((id, time));
            }
            if reached_watermark || c["is_end"].as_bool().unwrap_or(false) {
                break;
            }
            tokio::time::sleep(self.feed_delay).await;
        }

        let report = self.persist(uid, &notifies, &comments, &danmus).await?;
        if let Some((id, time)) = cursor {
            self.save_cursor(uid, data_type, Some(id as i64), Some(time as i64))
                .await?;
        }
        info!(
            "[Incremental] {} 新增 {} 项",
            data_type.as_str(),
            report.total()
        );
        Ok(report)
    }

    /// 系统通知的增量补数（只走主 API 变体）
    pub async fn sync_system_notify(&self, api: &dyn BiliApi, uid: u64) -> Result<SyncReport> {
        let watermark = self.latest_timestamp(uid, DataType::SystemNotify).await?;
        let known = self.db.notify_ids(uid).await?;

        let mut notifies: HashMap<u64, Notify> = HashMap::new();
        let mut cursor: Option<u64> = None;
        let mut reached_watermark = false;

        for _page in 0..MAX_FEED_PAGES {
            let url = match cursor {
                None => format!(
                    "https://message.bilibili.com/x/sys-msg/query_user_notify?csrf={}&page_size=20&build=0&mobi_app=web",
                    api.csrf()
                ),
                Some(c) => format!(
                    "https://message.bilibili.com/x/sys-msg/query_notify_list?csrf={}&data_type=1&cursor={}&build=0&mobi_app=web",
                    api.csrf(),
                    c
                ),
            };
            let json = api.get_json(&url).await?;
            if json["code"].as_i64().unwrap_or(0) != 0 {
                warn!("[Incremental] 系统通知接口返回错误码 {}", json["code"]);
                break;
            }

            let items: Vec<Value> = if cursor.is_none() {
                json["data"]["system_notify_list"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
            } else {
                json["data"].as_array().cloned().unwrap_or_default()
            };
            if items.is_empty() {
                break;
            }

            for item in &items {
                let t = item["time_at"]
                    .as_str()
                    .and_then(parse_time_at)
                    .unwrap_or(0);
                if t <= watermark {
                    reached_watermark = true;
                    break;
                }
                if let Some(id) = item["id"].as_u64() {
                    if known.contains(&id) {
                        continue;
                    }
                }
                collect_system_notify_item(&mut notifies, item, 0);
            }

            cursor = items.last().and_then(|it| it["cursor"].as_u64());
            if reached_watermark || cursor.is_none() {
                break;
            }
            tokio::time::sleep(self.feed_delay).await;
        }

        let report = self
            .persist(uid, &notifies, &HashMap::new(), &HashMap::new())
            .await?;
        if let Some(c) = cursor {
            self.save_cursor(uid, DataType::SystemNotify, Some(c as i64), None)
                .await?;
        }
        info!("[Incremental] 系统通知新增 {} 项", report.total());
        Ok(report)
    }

    /// AICU 存档评论的增量补数：从上次游标页起最多 20 页
    pub async fn sync_aicu_comments(&self, api: &dyn BiliApi, uid: u64) -> Result<SyncReport> {
        let watermark = self.latest_timestamp(uid, DataType::AicuComments).await?;
        let known = self.db.comment_ids(uid).await?;
        let start_page = self
            .db
            .get_cursor(uid, DataType::AicuComments.as_str())
            .await?
            .and_then(|c| c.cursor_id)
            .unwrap_or(1)
            .max(1) as u32;

        let mut comments: HashMap<u64, Comment> = HashMap::new();
        let mut last_page = start_page;

        for page in start_page..start_page + MAX_ARCHIVE_PAGES {
            last_page = page;
            let json = self
                .archive_page(api, "https://api.aicu.cc/api/v3/search/getreply", uid, page)
                .await?;
            if json["code"].as_i64().unwrap_or(0) != 0 {
                warn!("[Incremental] AICU评论接口返回错误: {}", json["code"]);
                break;
            }
            let data = &json["data"];
            let Some(items) = data["replies"].as_array().filter(|v| !v.is_empty()) else {
                break;
            };

            let before = comments.len();
            for item in items {
                if item["time"].as_i64().unwrap_or(0) <= watermark {
                    continue;
                }
                collect_archived_comment(&mut comments, item);
            }
            // 整页都不比水位线新，说明后面只会更旧
            if comments.len() == before {
                break;
            }
            if data["cursor"]["is_end"].as_bool().unwrap_or(false) {
                break;
            }
            tokio::time::sleep(self.archive_delay).await;
        }

        comments.retain(|id, _| !known.contains(id));
        let report = self
            .persist(uid, &HashMap::new(), &comments, &HashMap::new())
            .await?;
        if report.total() > 0 {
            self.save_cursor(uid, DataType::AicuComments, Some(last_page as i64), None)
                .await?;
        }
        info!("[Incremental] AICU评论新增 {} 项", report.total());
        Ok(report)
    }

    /// AICU 存档弹幕的增量补数
    pub async fn sync_aicu_danmus(&self, api: &dyn BiliApi, uid: u64) -> Result<SyncReport> {
        let watermark = self.latest_timestamp(uid, DataType::AicuDanmus).await?;
        let known = self.db.danmu_ids(uid).await?;
        let start_page = self
            .db
            .get_cursor(uid, DataType::AicuDanmus.as_str())
            .await?
            .and_then(|c| c.cursor_id)
            .unwrap_or(1)
            .max(1) as u32;

        let mut danmus: HashMap<u64, Danmu> = HashMap::new();
        let mut last_page = start_page;

        for page in start_page..start_page + MAX_ARCHIVE_PAGES {
            last_page = page;
            let json = self
                .archive_page(
                    api,
                    "https://api.aicu.cc/api/v3/search/getvideodm",
                    uid,
                    page,
                )
                .await?;
            if json["code"].as_i64().unwrap_or(0) != 0 {
                warn!("[Incremental] AICU弹幕接口返回错误: {}", json["code"]);
                break;
            }
            let data = &json["data"];
            let Some(items) = data["videodmlist"].as_array().filter(|v| !v.is_empty()) else {
                break;
            };

            let before = danmus.len();
            for item in items {
                if item["ctime"].as_i64().unwrap_or(0) <= watermark {
                    continue;
                }
                collect_archived_danmu(&mut danmus, item);
            }
            if danmus.len() == before {
                break;
            }
            if data["cursor"]["is_end"].as_bool().unwrap_or(false) {
                break;
            }
            tokio::time::sleep(self.archive_delay).await;
        }

        danmus.retain(|id, _| !known.contains(id));
        let report = self
            .persist(uid, &HashMap::new(), &HashMap::new(), &danmus)
            .await?;
        if report.total() > 0 {
            self.save_cursor(uid, DataType::AicuDanmus, Some(last_page as i64), None)
                .await?;
        }
        info!("[Incremental] AICU弹幕新增 {} 项", report.total());
        Ok(report)
    }

    async fn archive_page(
        &self,
        api: &dyn BiliApi,
        url: &str,
        uid: u64,
        page: u32,
    ) -> Result<Value> {
        let params = [
            ("uid", uid.to_string()),
            ("pn", page.to_string()),
            ("ps", "500".to_string()),
            ("mode", "0".to_string()),
            ("keyword", String::new()),
        ];
        api.get_archive_json(url, &params).await
    }

    async fn persist(
        &self,
        uid: u64,
        notifies: &HashMap<u64, Notify>,
        comments: &HashMap<u64, Comment>,
        danmus: &HashMap<u64, Danmu>,
    ) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        if !notifies.is_empty() {
            report.new_notifies = self.db.save_notifies(&notifies_to_records(notifies, uid)).await?;
        }
        if !comments.is_empty() {
            report.new_comments = self.db.save_comments(&comments_to_records(comments, uid)).await?;
        }
        if !danmus.is_empty() {
            report.new_danmus = self.db.save_danmus(&danmus_to_records(danmus, uid)).await?;
        }
        Ok(report)
    }

    async fn save_cursor(
        &self,
        uid: u64,
        data_type: DataType,
        cursor_id: Option<i64>,
        cursor_time: Option<i64>,
    ) -> Result<()> {
        self.db
            .save_cursor(&crate::bili::database::models::SyncCursor {
                uid: uid as i64,
                data_type: data_type.as_str().to_string(),
                cursor_id,
                cursor_time,
                last_sync: crate::bili::types::now_ts(),
                extra_data: "{}".to_string(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bili::database::models::NotifyRecord;
    use crate::bili::testutil::MockApi;
    use serde_json::json;

    const UID: u64 = 42;

    async fn db_with_watermark(tp: i64, created_time: i64) -> Database {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.save_notifies(&[NotifyRecord {
            id: 1,
            uid: UID as i64,
            content: "旧通知".to_string(),
            tp,
            system_notify_api: None,
            source: "bilibili".to_string(),
            created_time,
            synced_time: 0,
            is_deleted: false,
        }])
        .await
        .unwrap();
        db
    }

    fn liked_page(entries: &[(u64, i64)], is_end: bool) -> serde_json::Value {
        let items: Vec<serde_json::Value> = entries
            .iter()
            .map(|(id, t)| {
                json!({
                    "id": id,
                    "like_time": t,
                    "item": { "type": "unknown", "title": format!("通知{id}") },
                })
            })
            .collect();
        json!({
            "code": 0,
            "data": { "total": {
                "items": items,
                "cursor": { "id": 10, "time": 900, "is_end": is_end },
            }}
        })
    }

    #[tokio::test]
    async fn catch_up_stops_at_watermark() {
        // 水位线 1000：页面 [1200, 1100, 1000, 900] 里只有前两条是新的
        let db = db_with_watermark(0, 1000).await;
        let fetcher = IncrementalFetcher::instant(db.clone());
        let api = MockApi::new();
        api.enqueue(
            "msgfeed/like",
            liked_page(&[(12, 1200), (11, 1100), (10, 1000), (9, 900)], false),
        );

        let report = fetcher.sync_feed(&api, UID, DataType::Liked).await.unwrap();
        assert_eq!(report.new_notifies, 2);

        let ids = db.notify_ids(UID).await.unwrap();
        assert!(ids.contains(&12) && ids.contains(&11));
        assert!(!ids.contains(&10) && !ids.contains(&9));
        // 到达水位线后不再翻页
        assert_eq!(api.requested_urls().len(), 1);
        // 游标已推进
        let cursor = db.get_cursor(UID, "liked").await.unwrap().unwrap();
        assert_eq!(cursor.cursor_id, Some(10));
    }

    #[tokio::test]
    async fn already_stored_ids_are_not_duplicated() {
        let db = db_with_watermark(0, 1000).await;
        let fetcher = IncrementalFetcher::instant(db.clone());
        let api = MockApi::new();
        // id=1 已在库里（水位线之前入的库），即使时间比水位线新也要跳过
        api.enqueue(
            "msgfeed/like",
            liked_page(&[(1, 1300), (6, 1200), (5, 1000)], true),
        );

        let report = fetcher.sync_feed(&api, UID, DataType::Liked).await.unwrap();
        assert_eq!(report.new_notifies, 1);
        assert_eq!(db.notify_ids(UID).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn aicu_comment_catch_up_filters_by_time_and_id() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        // 已有一条 aicu 评论作为水位线 (created_time 500)
        let existing = crate::bili::database::models::CommentRecord {
            id: 100,
            uid: UID as i64,
            oid: 1,
            r#type: 1,
            content: "旧".to_string(),
            notify_id: None,
            tp: None,
            source: "aicu".to_string(),
            created_time: 500,
            synced_time: 0,
            is_deleted: false,
            video_uri: None,
            like_count: 0,
        };
        db.save_comments(std::slice::from_ref(&existing))
            .await
            .unwrap();

        let fetcher = IncrementalFetcher::instant(db.clone());
        let api = MockApi::new();
        api.enqueue(
            "getreply",
            json!({
                "code": 0,
                "data": {
                    "replies": [
                        { "rpid": 101, "message": "新评论", "time": 600, "dyn": { "oid": 2, "type": 1 } },
                        { "rpid": 100, "message": "旧评论", "time": 500, "dyn": { "oid": 1, "type": 1 } },
                    ],
                    "cursor": { "all_count": 2, "is_end": true },
                }
            }),
        );

        let report = fetcher.sync_aicu_comments(&api, UID).await.unwrap();
        assert_eq!(report.new_comments, 1);

        let ids = db.comment_ids(UID).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&101));
        // 游标记录了最后处理的页号
        let cursor = db.get_cursor(UID, "aicu_comments").await.unwrap().unwrap();
        assert_eq!(cursor.cursor_id, Some(1));
    }
}
