//! 通知信息流抓取：点赞 / 回复 / @ / 系统通知
//!
//! 前三个源共用一套游标分页驱动，只是 URL、时间参数和条目归集不同。
//! 系统通知结构特殊（双 API 探测 + 游标藏在最后一条里），单独成环。
//! 所有源的失败语义一致：连续 3 次失败保存断点暂停，完成的页不丢。

use crate::bili::activity::ActivityTracker;
use crate::bili::api_service::BiliApi;
use crate::bili::backoff::BackoffPolicy;
use crate::bili::fetch::parse::{extract_cid, parse_oid};
use crate::bili::fetch::progress::{FeedRecovery, FetchProgressState, SystemNotifyRecovery};
use crate::bili::types::{now_ts, Comment, Danmu, Notify, ProgressCallback};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// 信息流分页的端点描述
struct FeedEndpoint {
    name: &'static str,
    base_url: &'static str,
    /// 游标时间参数名：like_time / reply_time / at_time
    time_param: &'static str,
    /// 点赞接口的 items/cursor 多套了一层 "total"
    nested_total: bool,
}

const LIKED: FeedEndpoint = FeedEndpoint {
    name: "点赞",
    base_url: "https://api.bilibili.com/x/msgfeed/like?platform=web&build=0&mobi_app=web",
    time_param: "like_time",
    nested_total: true,
};

const REPLYED: FeedEndpoint = FeedEndpoint {
    name: "回复",
    base_url: "https://api.bilibili.com/x/msgfeed/reply?platform=web&build=0&mobi_app=web",
    time_param: "reply_time",
    nested_total: false,
};

const ATED: FeedEndpoint = FeedEndpoint {
    name: "@",
    base_url: "https://api.bilibili.com/x/msgfeed/at?build=0&mobi_app=web",
    time_param: "at_time",
    nested_total: false,
};

enum FeedRun {
    Complete,
    /// 断点可能为 None（第一页就失败，尚无游标可存）
    Paused(Option<FeedRecovery>),
}

/// 信息流分页驱动：翻页、限速、连续错误计数与断点产出
async fn run_feed(
    api: &dyn BiliApi,
    ep: &FeedEndpoint,
    recovery: Option<FeedRecovery>,
    policy: &BackoffPolicy,
    stop: &AtomicBool,
    tracker: &mut ActivityTracker,
    mut on_item: impl FnMut(&Value),
) -> Result<FeedRun> {
    let mut cursor = recovery;
    let mut consecutive_errors = 0u32;
    let mut page = 0u32;

    loop {
        if stop.load(Ordering::Relaxed) {
            info!("[Fetch] {}数据抓取被停止，保留断点", ep.name);
            return Ok(FeedRun::Paused(cursor));
        }

        let url = match cursor {
            None => ep.base_url.to_string(),
            Some(c) => format!(
                "{}&id={}&{}={}",
                ep.base_url, c.cursor_id, ep.time_param, c.cursor_time
            ),
        };

        let json = match api.get_json(&url).await {
            Ok(json) => json,
            Err(e) => {
                consecutive_errors += 1;
                warn!(
                    "[Fetch] {}数据请求失败 ({}/{}): {:#}",
                    ep.name, consecutive_errors, policy.max_consecutive_errors, e
                );
                if consecutive_errors >= policy.max_consecutive_errors {
                    warn!("[Fetch] {}数据连续失败，保存断点退出", ep.name);
                    return Ok(FeedRun::Paused(cursor));
                }
                tokio::time::sleep(policy.error_delay()).await;
                continue;
            }
        };

        let code = json["code"].as_i64().unwrap_or(0);
        if code != 0 {
            // 当前把非零错误码与"到达末尾"同样处理，留下日志便于区分
            warn!("[Fetch] {}接口返回错误码 {}，视为数据已取完", ep.name, code);
            return Ok(FeedRun::Complete);
        }
        consecutive_errors = 0;

        let container = if ep.nested_total {
            &json["data"]["total"]
        } else {
            &json["data"]
        };
        let items = match container["items"].as_array() {
            Some(items) if !items.is_empty() => items,
            _ => {
                info!("[Fetch] ✅ {}数据已全部取完", ep.name);
                return Ok(FeedRun::Complete);
            }
        };

        for item in items {
            on_item(item);
        }
        tracker.update(items.len() as u64);

        let c = &container["cursor"];
        if c["is_end"].as_bool().unwrap_or(false) {
            info!("[Fetch] ✅ {}数据已全部取完 (is_end)", ep.name);
            return Ok(FeedRun::Complete);
        }
        cursor = match (c["id"].as_u64(), c["time"].as_u64()) {
            (Some(id), Some(time)) => Some(FeedRecovery {
                cursor_id: id,
                cursor_time: time,
            }),
            _ => {
                info!("[Fetch] {}数据游标缺失，视为已取完", ep.name);
                return Ok(FeedRun::Complete);
            }
        };

        page += 1;
        tokio::time::sleep(policy.page_delay(page)).await;
    }
}

/// 抓取点赞通知及其关联的评论 / 弹幕。返回 true 表示中途暂停（断点已存）
pub async fn fetch_liked(
    api: &dyn BiliApi,
    state: &mut FetchProgressState,
    policy: &BackoffPolicy,
    stop: &AtomicBool,
    callback: &ProgressCallback,
) -> Result<bool> {
    let recovery = state.liked_recovery;
    let mut tracker = ActivityTracker::new("liked", "正在获取点赞数据", callback.clone());

    let notifies = &mut state.liked_notifies;
    let comments = &mut state.liked_comments;
    let danmus = &mut state.liked_danmus;
    let run = run_feed(api, &LIKED, recovery, policy, stop, &mut tracker, |item| {
        collect_liked_item(notifies, comments, danmus, item);
    })
    .await?;
    tracker.finish();

    match run {
        FeedRun::Complete => {
            state.liked_recovery = None;
            Ok(false)
        }
        FeedRun::Paused(r) => {
            state.liked_recovery = r;
            Ok(true)
        }
    }
}

/// 抓取回复通知及其关联评论
pub async fn fetch_replyed(
    api: &dyn BiliApi,
    state: &mut FetchProgressState,
    policy: &BackoffPolicy,
    stop: &AtomicBool,
    callback: &ProgressCallback,
) -> Result<bool> {
    let recovery = state.replyed_recovery;
    let mut tracker = ActivityTracker::new("replyed", "正在获取回复数据", callback.clone());

    let notifies = &mut state.replyed_notifies;
    let comments = &mut state.replyed_comments;
    let run = run_feed(api, &REPLYED, recovery, policy, stop, &mut tracker, |item| {
        collect_replyed_item(notifies, comments, item);
    })
    .await?;
    tracker.finish();

    match run {
        FeedRun::Complete => {
            state.replyed_recovery = None;
            Ok(false)
        }
        FeedRun::Paused(r) => {
            state.replyed_recovery = r;
            Ok(true)
        }
    }
}

/// 抓取 @ 通知（只产出通知，无关联实体）
pub async fn fetch_ated(
    api: &dyn BiliApi,
    state: &mut FetchProgressState,
    policy: &BackoffPolicy,
    stop: &AtomicBool,
    callback: &ProgressCallback,
) -> Result<bool> {
    let recovery = state.ated_recovery;
    let mut tracker = ActivityTracker::new("ated", "正在获取@数据", callback.clone());

    let notifies = &mut state.ated_notifies;
    let run = run_feed(api, &ATED, recovery, policy, stop, &mut tracker, |item| {
        collect_ated_item(notifies, item);
    })
    .await?;
    tracker.finish();

    match run {
        FeedRun::Complete => {
            state.ated_recovery = None;
            Ok(false)
        }
        FeedRun::Paused(r) => {
            state.ated_recovery = r;
            Ok(true)
        }
    }
}

pub(crate) fn collect_ated_item(notifies: &mut HashMap<u64, Notify>, item: &Value) {
    let Some(id) = item["id"].as_u64() else {
        debug!("[Fetch] @条目缺少 id，跳过");
        return;
    };
    let title = item["item"]["title"].as_str().unwrap_or("Unknown");
    let mut notify = Notify::new(format!("{title} (@)"), 2);
    notify.created_time = item["at_time"].as_i64().unwrap_or(0);
    notifies.entry(id).or_insert(notify);
}

pub(crate) fn collect_liked_item(
    notifies: &mut HashMap<u64, Notify>,
    comments: &mut HashMap<u64, Comment>,
    danmus: &mut HashMap<u64, Danmu>,
    item: &Value,
) {
    let Some(id) = item["id"].as_u64() else {
        debug!("[Fetch] 点赞条目缺少 id，跳过");
        return;
    };
    let detail = &item["item"];
    let title = detail["title"].as_str().unwrap_or("Unknown");
    let like_time = item["like_time"].as_i64().unwrap_or(0);

    let mut notify = Notify::new(format!("{title} (liked)"), 0);
    notify.created_time = like_time;
    notifies.entry(id).or_insert(notify);

    match detail["type"].as_str() {
        Some("reply") => {
            let Some(rpid) = detail["item_id"].as_u64() else {
                return;
            };
            let Some((oid, tp)) = parse_oid(detail) else {
                debug!("[Fetch] 点赞评论 URI 无法识别，跳过: rpid={rpid}");
                return;
            };
            let mut comment = Comment::new_with_notify(oid, tp, title.to_string(), id, 0);
            comment.created_time = like_time;
            comment.video_uri = detail["uri"].as_str().map(str::to_string);
            comment.like_count = item["counts"].as_i64().unwrap_or(0);
            comments.entry(rpid).or_insert(comment);
        }
        Some("danmu") => {
            let Some(dmid) = detail["item_id"].as_u64() else {
                return;
            };
            // 部分条目缺 cid，删除主要依赖 video_url，这里容忍 0
            let cid = extract_cid(detail["native_uri"].as_str().unwrap_or("")).unwrap_or(0);
            let mut danmu = Danmu::new_with_notify(title.to_string(), cid, id);
            danmu.created_time = like_time;
            danmu.video_url = detail["uri"].as_str().map(str::to_string);
            danmus.entry(dmid).or_insert(danmu);
        }
        _ => {}
    }
}

pub(crate) fn collect_replyed_item(
    notifies: &mut HashMap<u64, Notify>,
    comments: &mut HashMap<u64, Comment>,
    item: &Value,
) {
    let Some(id) = item["id"].as_u64() else {
        debug!("[Fetch] 回复条目缺少 id，跳过");
        return;
    };
    let detail = &item["item"];
    let title = detail["title"].as_str().unwrap_or("Unknown");

    let mut notify = Notify::new(format!("{title} (reply)"), 1);
    notify.created_time = item["reply_time"].as_i64().unwrap_or(0);
    notifies.entry(id).or_insert(notify);

    if detail["type"].as_str() == Some("reply") {
        // 回复通知里自己的评论在 target_id
        let Some(rpid) = detail["target_id"].as_u64() else {
            return;
        };
        let Some((oid, tp)) = parse_oid(detail) else {
            debug!("[Fetch] 回复评论 URI 无法识别，跳过: rpid={rpid}");
            return;
        };
        let content = detail["target_reply_content"]
            .as_str()
            .filter(|s| !s.is_empty())
            .unwrap_or(title)
            .to_string();
        let mut comment = Comment::new_with_notify(oid, tp, content, id, 1);
        comment.created_time = item["reply_time"].as_i64().unwrap_or(0);
        comment.video_uri = detail["uri"].as_str().map(str::to_string);
        comment.like_count = item["counts"].as_i64().unwrap_or(0);
        comments.entry(rpid).or_insert(comment);
    }
}

fn first_page_url(csrf: &str, api_type: u8) -> String {
    if api_type == 0 {
        format!(
            "https://message.bilibili.com/x/sys-msg/query_user_notify?csrf={csrf}&page_size=20&build=0&mobi_app=web"
        )
    } else {
        format!(
            "https://message.bilibili.com/x/sys-msg/query_unified_notify?csrf={csrf}&page_size=10&build=0&mobi_app=web"
        )
    }
}

/// 抓取系统通知
///
/// 首页先走 query_user_notify（api_type 0），返回空列表再退到
/// query_unified_notify（api_type 1）；后续翻页统一走 query_notify_list，
/// 下一页游标取自本页最后一条的 `cursor` 字段。api_type 要跟着断点一起
/// 保存，删除时要用同一变体的 API。
pub async fn fetch_system_notify(
    api: &dyn BiliApi,
    state: &mut FetchProgressState,
    policy: &BackoffPolicy,
    stop: &AtomicBool,
    callback: &ProgressCallback,
) -> Result<bool> {
    let mut cursor = state.system_recovery.map(|r| r.cursor);
    let mut api_type = state.system_recovery.map(|r| r.api_type).unwrap_or(0);
    let mut consecutive_errors = 0u32;
    let mut page = 0u32;
    let mut tracker = ActivityTracker::new("system", "正在获取系统通知", callback.clone());

    loop {
        if stop.load(Ordering::Relaxed) {
            info!("[Fetch] 系统通知抓取被停止，保留断点");
            state.system_recovery = cursor.map(|c| SystemNotifyRecovery {
                cursor: c,
                api_type,
            });
            tracker.finish();
            return Ok(true);
        }

        let url = match cursor {
            None => first_page_url(api.csrf(), api_type),
            Some(c) => format!(
                "https://message.bilibili.com/x/sys-msg/query_notify_list?csrf={}&data_type=1&cursor={}&build=0&mobi_app=web",
                api.csrf(),
                c
            ),
        };

        let json = match api.get_json(&url).await {
            Ok(json) => json,
            Err(e) => {
                consecutive_errors += 1;
                warn!(
                    "[Fetch] 系统通知请求失败 ({}/{}): {:#}",
                    consecutive_errors, policy.max_consecutive_errors, e
                );
                if consecutive_errors >= policy.max_consecutive_errors {
                    warn!("[Fetch] 系统通知连续失败，保存断点退出");
                    state.system_recovery = cursor.map(|c| SystemNotifyRecovery {
                        cursor: c,
                        api_type,
                    });
                    tracker.finish();
                    return Ok(true);
                }
                tokio::time::sleep(policy.error_delay()).await;
                continue;
            }
        };

        let code = json["code"].as_i64().unwrap_or(0);
        if code != 0 {
            warn!("[Fetch] 系统通知接口返回错误码 {}，视为数据已取完", code);
            break;
        }
        consecutive_errors = 0;

        let items: Vec<Value> = if cursor.is_none() {
            let list = json["data"]["system_notify_list"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            if list.is_empty() && api_type == 0 {
                // 主接口没有数据时换备用接口再试一次首页
                info!("[Fetch] 系统通知主接口为空，改用备用接口");
                api_type = 1;
                continue;
            }
            list
        } else {
            json["data"].as_array().cloned().unwrap_or_default()
        };

        if items.is_empty() {
            break;
        }

        for item in &items {
            collect_system_notify_item(&mut state.system_notifies, item, api_type);
        }
        tracker.update(items.len() as u64);

        // 下一页游标在本页最后一条里，缺失表示没有更多分页
        cursor = items.last().and_then(|it| it["cursor"].as_u64());
        if cursor.is_none() {
            break;
        }

        page += 1;
        tokio::time::sleep(policy.page_delay(page)).await;
    }

    info!(
        "[Fetch] ✅ 系统通知已全部取完: {} 条",
        state.system_notifies.len()
    );
    state.system_recovery = None;
    tracker.finish();
    Ok(false)
}

pub(crate) fn collect_system_notify_item(
    notifies: &mut HashMap<u64, Notify>,
    item: &Value,
    api_type: u8,
) {
    let Some(id) = item["id"].as_u64() else {
        debug!("[Fetch] 系统通知条目缺少 id，跳过");
        return;
    };
    let title = item["title"].as_str().unwrap_or("");
    let content = item["content"].as_str().unwrap_or("");
    let tp = item["type"].as_u64().unwrap_or(0) as u8;
    let mut notify = Notify::new_system_notify(format!("{title}\n{content}"), tp, api_type);
    if let Some(t) = item["time_at"].as_str() {
        notify.created_time = parse_time_at(t).unwrap_or_else(now_ts);
    }
    notifies.entry(id).or_insert(notify);
}

/// 解析系统通知的 "2024-01-02 03:04:05" 样式时间
pub(crate) fn parse_time_at(s: &str) -> Option<i64> {
    let naive = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok()?;
    Some(naive.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bili::testutil::MockApi;
    use crate::bili::types::noop_callback;
    use serde_json::json;

    fn liked_page(ids: &[u64], cursor_id: u64, cursor_time: u64, is_end: bool) -> Value {
        let items: Vec<Value> = ids
            .iter()
            .map(|id| {
                json!({
                    "id": id,
                    "like_time": 1700000000 + id,
                    "counts": 3,
                    "item": {
                        "type": "reply",
                        "item_id": id * 10,
                        "title": format!("评论{id}"),
                        "uri": format!("https://t.bilibili.com/{}", id * 100),
                        "native_uri": "",
                        "business_id": 0,
                    }
                })
            })
            .collect();
        json!({
            "code": 0,
            "data": { "total": {
                "items": items,
                "cursor": { "id": cursor_id, "time": cursor_time, "is_end": is_end },
            }}
        })
    }

    #[tokio::test]
    async fn liked_walks_pages_and_collects_comments() {
        let api = MockApi::new();
        api.enqueue("msgfeed/like", liked_page(&[1, 2], 90, 1000, false));
        api.enqueue("msgfeed/like", liked_page(&[3], 80, 900, true));

        let mut state = FetchProgressState::default();
        let paused = fetch_liked(
            &api,
            &mut state,
            &BackoffPolicy::instant(),
            &AtomicBool::new(false),
            &noop_callback(),
        )
        .await
        .unwrap();

        assert!(!paused);
        assert!(state.liked_recovery.is_none());
        assert_eq!(state.liked_notifies.len(), 3);
        assert_eq!(state.liked_comments.len(), 3);
        assert_eq!(state.liked_comments[&10].oid, 100);
        assert_eq!(state.liked_comments[&10].tp, Some(0));
    }

    #[tokio::test]
    async fn three_failures_on_page_two_checkpoint_then_resume() {
        let api = MockApi::new();
        api.enqueue("msgfeed/like", liked_page(&[1, 2], 90, 1000, false));
        for _ in 0..3 {
            api.enqueue_err("msgfeed/like", "连接被重置");
        }

        let mut state = FetchProgressState::default();
        let policy = BackoffPolicy::instant();
        let stop = AtomicBool::new(false);
        let cb = noop_callback();

        let paused = fetch_liked(&api, &mut state, &policy, &stop, &cb)
            .await
            .unwrap();
        assert!(paused, "连续三次失败后应暂停");
        // 第一页的成果保留，断点指向失败的第二页
        assert_eq!(state.liked_notifies.len(), 2);
        let recovery = state.liked_recovery.expect("应保存断点");
        assert_eq!(recovery.cursor_id, 90);
        assert_eq!(recovery.cursor_time, 1000);

        // 恢复：从断点继续抓第二页，旧数据不重复也不被覆盖
        api.enqueue("msgfeed/like", liked_page(&[2, 3], 80, 900, true));
        let paused = fetch_liked(&api, &mut state, &policy, &stop, &cb)
            .await
            .unwrap();
        assert!(!paused);
        assert!(state.liked_recovery.is_none());
        assert_eq!(state.liked_notifies.len(), 3);
        assert_eq!(state.liked_comments.len(), 3);
        // 断点续传请求必须带上游标参数
        let urls = api.requested_urls();
        assert!(urls
            .iter()
            .any(|u| u.contains("id=90") && u.contains("like_time=1000")));
    }

    #[tokio::test]
    async fn nonzero_code_is_treated_as_end() {
        let api = MockApi::new();
        api.enqueue("msgfeed/at", json!({ "code": -352, "message": "风控校验失败" }));

        let mut state = FetchProgressState::default();
        let paused = fetch_ated(
            &api,
            &mut state,
            &BackoffPolicy::instant(),
            &AtomicBool::new(false),
            &noop_callback(),
        )
        .await
        .unwrap();

        assert!(!paused, "非零错误码按到达末尾处理，不算失败");
        assert!(state.ated_recovery.is_none());
        assert!(state.ated_notifies.is_empty());
    }

    #[tokio::test]
    async fn replyed_prefers_target_reply_content() {
        let api = MockApi::new();
        api.enqueue(
            "msgfeed/reply",
            json!({
                "code": 0,
                "data": {
                    "items": [{
                        "id": 5,
                        "reply_time": 1700000100,
                        "item": {
                            "type": "reply",
                            "target_id": 55,
                            "title": "视频标题",
                            "target_reply_content": "我的原始评论",
                            "uri": "https://www.bilibili.com/video/BV1xx",
                            "native_uri": "bilibili://video/4567?cid=1",
                            "business_id": 1,
                        }
                    }],
                    "cursor": { "id": 0, "time": 0, "is_end": true }
                }
            }),
        );

        let mut state = FetchProgressState::default();
        fetch_replyed(
            &api,
            &mut state,
            &BackoffPolicy::instant(),
            &AtomicBool::new(false),
            &noop_callback(),
        )
        .await
        .unwrap();

        let comment = &state.replyed_comments[&55];
        assert_eq!(comment.content, "我的原始评论");
        assert_eq!(comment.oid, 4567);
        assert_eq!(comment.r#type, 1);
        assert_eq!(state.replyed_notifies[&5].tp, 1);
    }

    #[tokio::test]
    async fn system_notify_falls_back_to_unified_api() {
        let api = MockApi::new();
        api.enqueue(
            "query_user_notify",
            json!({ "code": 0, "data": { "system_notify_list": [] } }),
        );
        api.enqueue(
            "query_unified_notify",
            json!({ "code": 0, "data": { "system_notify_list": [
                { "id": 900, "title": "升级公告", "content": "正文",
                  "type": 4, "time_at": "2024-01-02 03:04:05", "cursor": 77 }
            ]}}),
        );
        // 翻页接口：空数组表示结束
        api.enqueue("query_notify_list", json!({ "code": 0, "data": [] }));

        let mut state = FetchProgressState::default();
        let paused = fetch_system_notify(
            &api,
            &mut state,
            &BackoffPolicy::instant(),
            &AtomicBool::new(false),
            &noop_callback(),
        )
        .await
        .unwrap();

        assert!(!paused);
        let notify = &state.system_notifies[&900];
        assert_eq!(notify.system_notify_api, Some(1), "备用接口的变体要记下来");
        assert!(notify.content.starts_with("升级公告\n"));
        assert!(notify.created_time > 0);
        let urls = api.requested_urls();
        assert!(urls.iter().any(|u| u.contains("cursor=77")));
    }
}
