//! AICU 存档抓取：历史评论与历史弹幕
//!
//! 存档接口按页号分页（每页 500 条），首个响应带 all_count 总数，
//! 仅用于进度展示。断点记录 (uid, 页号, 总数)，恢复时跳过 uid 查询。

use crate::bili::activity::ActivityTracker;
use crate::bili::api_service::BiliApi;
use crate::bili::backoff::BackoffPolicy;
use crate::bili::fetch::progress::{ArchiveRecovery, FetchProgressState};
use crate::bili::types::{Comment, Danmu, ProgressCallback};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

struct ArchiveEndpoint {
    name: &'static str,
    url: &'static str,
    /// 响应里条目数组的字段名：replies / videodmlist
    list_key: &'static str,
}

const AICU_COMMENTS: ArchiveEndpoint = ArchiveEndpoint {
    name: "AICU评论",
    url: "https://api.aicu.cc/api/v3/search/getreply",
    list_key: "replies",
};

const AICU_DANMUS: ArchiveEndpoint = ArchiveEndpoint {
    name: "AICU弹幕",
    url: "https://api.aicu.cc/api/v3/search/getvideodm",
    list_key: "videodmlist",
};

enum ArchiveRun {
    Complete,
    Paused(ArchiveRecovery),
}

/// 存档分页驱动。`on_item` 返回是否新收录了该条目
async fn run_archive(
    api: &dyn BiliApi,
    ep: &ArchiveEndpoint,
    recovery: Option<ArchiveRecovery>,
    policy: &BackoffPolicy,
    stop: &AtomicBool,
    tracker: &mut ActivityTracker,
    mut on_item: impl FnMut(&Value) -> bool,
) -> Result<ArchiveRun> {
    let (uid, mut page, mut all_count) = match recovery {
        Some(r) => {
            info!(
                "[Fetch] 🔄 恢复{}抓取: uid={}, 从第 {} 页继续（共 {} 条）",
                ep.name, r.uid, r.page, r.all_count
            );
            (r.uid, r.page, r.all_count)
        }
        None => match api.get_uid().await {
            Ok(uid) => (uid, 1, 0),
            Err(e) => {
                warn!("[Fetch] 获取 uid 失败，跳过{}抓取: {:#}", ep.name, e);
                return Ok(ArchiveRun::Complete);
            }
        },
    };

    let mut consecutive_errors = 0u32;

    loop {
        if stop.load(Ordering::Relaxed) {
            info!("[Fetch] {}抓取被停止，保留断点", ep.name);
            return Ok(ArchiveRun::Paused(ArchiveRecovery {
                uid,
                page,
                all_count,
            }));
        }

        let params = [
            ("uid", uid.to_string()),
            ("pn", page.to_string()),
            ("ps", "500".to_string()),
            ("mode", "0".to_string()),
            ("keyword", String::new()),
        ];

        let json = match api.get_archive_json(ep.url, &params).await {
            Ok(json) => json,
            Err(e) => {
                consecutive_errors += 1;
                warn!(
                    "[Fetch] {}第 {} 页请求失败 ({}/{}): {:#}",
                    ep.name, page, consecutive_errors, policy.max_consecutive_errors, e
                );
                if consecutive_errors >= policy.max_consecutive_errors {
                    warn!("[Fetch] {}连续失败，保存断点退出", ep.name);
                    return Ok(ArchiveRun::Paused(ArchiveRecovery {
                        uid,
                        page,
                        all_count,
                    }));
                }
                tokio::time::sleep(policy.error_delay()).await;
                continue;
            }
        };

        if json["code"].as_i64().unwrap_or(0) != 0 {
            warn!(
                "[Fetch] {}接口返回错误: {}",
                ep.name,
                json["message"].as_str().unwrap_or("未知错误")
            );
            return Ok(ArchiveRun::Complete);
        }
        consecutive_errors = 0;
        let data = &json["data"];

        if all_count == 0 {
            all_count = data["cursor"]["all_count"].as_u64().unwrap_or(0);
            if all_count == 0 {
                info!("[Fetch] {}：该 uid 没有存档数据", ep.name);
                return Ok(ArchiveRun::Complete);
            }
            info!("[Fetch] {}共 {} 条 (uid={})", ep.name, all_count, uid);
        }

        let items = match data[ep.list_key].as_array() {
            Some(items) if !items.is_empty() => items,
            _ => {
                info!("[Fetch] ✅ {}已全部取完", ep.name);
                return Ok(ArchiveRun::Complete);
            }
        };

        let mut inserted = 0u64;
        for item in items {
            if on_item(item) {
                inserted += 1;
            }
        }
        tracker.update(inserted);

        if data["cursor"]["is_end"].as_bool().unwrap_or(false) {
            info!("[Fetch] ✅ {}已全部取完 (is_end)", ep.name);
            return Ok(ArchiveRun::Complete);
        }

        page += 1;
        tokio::time::sleep(policy.page_delay(page)).await;
    }
}

/// 抓取 AICU 存档评论。返回 true 表示中途暂停（断点已存）
pub async fn fetch_aicu_comments(
    api: &dyn BiliApi,
    state: &mut FetchProgressState,
    policy: &BackoffPolicy,
    stop: &AtomicBool,
    callback: &ProgressCallback,
) -> Result<bool> {
    let recovery = state.aicu_comment_recovery;
    let mut tracker = ActivityTracker::for_archive("aicu_comments", "正在获取AICU评论", callback.clone());

    let comments = &mut state.aicu_comments;
    let run = run_archive(
        api,
        &AICU_COMMENTS,
        recovery,
        policy,
        stop,
        &mut tracker,
        |item| collect_archived_comment(comments, item),
    )
    .await?;
    tracker.finish();

    match run {
        ArchiveRun::Complete => {
            state.aicu_comment_recovery = None;
            Ok(false)
        }
        ArchiveRun::Paused(r) => {
            state.aicu_comment_recovery = Some(r);
            Ok(true)
        }
    }
}

/// 抓取 AICU 存档弹幕
pub async fn fetch_aicu_danmus(
    api: &dyn BiliApi,
    state: &mut FetchProgressState,
    policy: &BackoffPolicy,
    stop: &AtomicBool,
    callback: &ProgressCallback,
) -> Result<bool> {
    let recovery = state.aicu_danmu_recovery;
    let mut tracker = ActivityTracker::for_archive("aicu_danmus", "正在获取AICU弹幕", callback.clone());

    let danmus = &mut state.aicu_danmus;
    let run = run_archive(
        api,
        &AICU_DANMUS,
        recovery,
        policy,
        stop,
        &mut tracker,
        |item| collect_archived_danmu(danmus, item),
    )
    .await?;
    tracker.finish();

    match run {
        ArchiveRun::Complete => {
            state.aicu_danmu_recovery = None;
            Ok(false)
        }
        ArchiveRun::Paused(r) => {
            state.aicu_danmu_recovery = Some(r);
            Ok(true)
        }
    }
}

pub(crate) fn collect_archived_comment(comments: &mut HashMap<u64, Comment>, item: &Value) -> bool {
    let Some(rpid) = value_u64(&item["rpid"]) else {
        debug!("[Fetch] 存档评论缺少 rpid，跳过");
        return false;
    };
    if comments.contains_key(&rpid) {
        return false;
    }
    let dyn_data = &item["dyn"];
    let (Some(oid), Some(tp)) = (value_u64(&dyn_data["oid"]), dyn_data["type"].as_i64()) else {
        debug!("[Fetch] 存档评论缺少 dyn 定位信息，跳过: rpid={rpid}");
        return false;
    };
    let content = item["message"].as_str().unwrap_or("").to_string();
    let created_time = item["time"].as_i64().unwrap_or(0);
    comments.insert(rpid, Comment::new_archived(oid, tp, content, created_time));
    true
}

pub(crate) fn collect_archived_danmu(danmus: &mut HashMap<u64, Danmu>, item: &Value) -> bool {
    let Some(dmid) = value_u64(&item["id"]) else {
        debug!("[Fetch] 存档弹幕缺少 id，跳过");
        return false;
    };
    // 弹幕接口里 oid 字段就是视频分 P 的 cid
    let Some(cid) = value_u64(&item["oid"]) else {
        debug!("[Fetch] 存档弹幕缺少 oid，跳过: dmid={dmid}");
        return false;
    };
    if danmus.contains_key(&dmid) {
        return false;
    }
    let content = item["content"].as_str().unwrap_or("").to_string();
    let created_time = item["ctime"].as_i64().unwrap_or(0);
    danmus.insert(dmid, Danmu::new_archived(content, cid, created_time));
    true
}

/// 存档接口的数值字段偶尔以字符串形式出现
fn value_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bili::testutil::MockApi;
    use crate::bili::types::{noop_callback, Source};
    use serde_json::json;

    fn reply_page(rpids: &[u64], all_count: u64, is_end: bool) -> Value {
        let replies: Vec<Value> = rpids
            .iter()
            .map(|id| {
                json!({
                    "rpid": id.to_string(),
                    "message": format!("存档评论{id}"),
                    "time": 1600000000 + id,
                    "dyn": { "oid": 777, "type": 1 },
                })
            })
            .collect();
        json!({
            "code": 0,
            "data": {
                "replies": replies,
                "cursor": { "all_count": all_count, "is_end": is_end },
            }
        })
    }

    #[tokio::test]
    async fn comments_paginate_until_end() {
        let api = MockApi::new();
        api.enqueue("getreply", reply_page(&[1, 2], 3, false));
        api.enqueue("getreply", reply_page(&[3], 3, true));

        let mut state = FetchProgressState::default();
        let paused = fetch_aicu_comments(
            &api,
            &mut state,
            &BackoffPolicy::instant(),
            &AtomicBool::new(false),
            &noop_callback(),
        )
        .await
        .unwrap();

        assert!(!paused);
        assert!(state.aicu_comment_recovery.is_none());
        assert_eq!(state.aicu_comments.len(), 3);
        let comment = &state.aicu_comments[&1];
        assert_eq!(comment.source, Source::Aicu);
        assert_eq!(comment.oid, 777);
        assert!(comment.notify_id.is_none());
    }

    #[tokio::test]
    async fn failures_checkpoint_with_page_and_total() {
        let api = MockApi::new();
        api.enqueue("getreply", reply_page(&[1], 100, false));
        for _ in 0..3 {
            api.enqueue_err("getreply", "Cloudflare 拦截");
        }

        let mut state = FetchProgressState::default();
        let paused = fetch_aicu_comments(
            &api,
            &mut state,
            &BackoffPolicy::instant(),
            &AtomicBool::new(false),
            &noop_callback(),
        )
        .await
        .unwrap();

        assert!(paused);
        assert_eq!(state.aicu_comments.len(), 1, "第一页的成果保留");
        let r = state.aicu_comment_recovery.expect("应保存断点");
        assert_eq!(r.page, 2);
        assert_eq!(r.all_count, 100);
        assert_eq!(r.uid, MockApi::UID);
    }

    #[tokio::test]
    async fn zero_total_means_nothing_to_fetch() {
        let api = MockApi::new();
        api.enqueue(
            "getvideodm",
            json!({ "code": 0, "data": { "videodmlist": [], "cursor": { "all_count": 0 } } }),
        );

        let mut state = FetchProgressState::default();
        let paused = fetch_aicu_danmus(
            &api,
            &mut state,
            &BackoffPolicy::instant(),
            &AtomicBool::new(false),
            &noop_callback(),
        )
        .await
        .unwrap();

        assert!(!paused);
        assert!(state.aicu_danmus.is_empty());
    }
}
