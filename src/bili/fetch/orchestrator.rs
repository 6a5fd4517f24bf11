//! 抓取编排器
//!
//! 按固定顺序驱动六个数据源：点赞 → 回复 → @ → 系统通知 →
//! （启用存档时）AICU 评论 → AICU 弹幕。任何一个源留下断点，
//! 整轮立即暂停，由调用方择机重新进入，从断点处继续。
//! 六源全部完成后才做合并。

use crate::bili::api_service::BiliApi;
use crate::bili::backoff::BackoffPolicy;
use crate::bili::fetch::archive::{fetch_aicu_comments, fetch_aicu_danmus};
use crate::bili::fetch::feed::{fetch_ated, fetch_liked, fetch_replyed, fetch_system_notify};
use crate::bili::fetch::progress::{FetchProgressState, MergedData};
use crate::bili::types::{Progress, ProgressCallback};
use anyhow::Result;
use std::sync::atomic::AtomicBool;
use tracing::info;

/// 两个源家族的限速参数
#[derive(Debug, Clone)]
pub struct FetchPolicies {
    pub feed: BackoffPolicy,
    pub archive: BackoffPolicy,
}

impl Default for FetchPolicies {
    fn default() -> Self {
        FetchPolicies {
            feed: BackoffPolicy::feed(),
            archive: BackoffPolicy::archive(),
        }
    }
}

impl FetchPolicies {
    /// 单元测试用的零延迟参数
    pub fn instant() -> FetchPolicies {
        FetchPolicies {
            feed: BackoffPolicy::instant(),
            archive: BackoffPolicy::instant(),
        }
    }
}

/// 一轮编排的结果
pub enum FetchOutcome {
    /// 六源全部走完，给出合并数据；断点已全部清空
    Complete(MergedData),
    /// 某个源留下了断点，状态里保存着已完成的部分
    Paused,
}

/// 驱动一轮完整抓取
///
/// 每个源只在「有断点」或「累积表为空」时运行：已有数据且无断点的源
/// 视为上一轮已完成。注：真实为空的源与从未抓过的源无法区分，
/// 会被无害地重走一遍。
pub async fn fetch(
    api: &dyn BiliApi,
    state: &mut FetchProgressState,
    aicu_enabled: bool,
    policies: &FetchPolicies,
    stop: &AtomicBool,
    callback: &ProgressCallback,
) -> Result<FetchOutcome> {
    // 存档开关从开到关：上一轮的存档数据不能漏进这一轮的结果
    if !aicu_enabled && state.aicu_enabled_last_run {
        info!("[Fetch] 存档开关已关闭，清空上一轮的存档数据");
        state.clear_archive();
    }
    state.aicu_enabled_last_run = aicu_enabled;

    if state.liked_recovery.is_some() || state.liked_notifies.is_empty() {
        callback(Progress::Status("正在获取点赞数据...".to_string()));
        if fetch_liked(api, state, &policies.feed, stop, callback).await? {
            return Ok(FetchOutcome::Paused);
        }
    }

    if state.replyed_recovery.is_some() || state.replyed_notifies.is_empty() {
        callback(Progress::Status("正在获取回复数据...".to_string()));
        if fetch_replyed(api, state, &policies.feed, stop, callback).await? {
            return Ok(FetchOutcome::Paused);
        }
    }

    if state.ated_recovery.is_some() || state.ated_notifies.is_empty() {
        callback(Progress::Status("正在获取@数据...".to_string()));
        if fetch_ated(api, state, &policies.feed, stop, callback).await? {
            return Ok(FetchOutcome::Paused);
        }
    }

    if state.system_recovery.is_some() || state.system_notifies.is_empty() {
        callback(Progress::Status("正在获取系统通知...".to_string()));
        if fetch_system_notify(api, state, &policies.feed, stop, callback).await? {
            return Ok(FetchOutcome::Paused);
        }
    }

    if aicu_enabled {
        if state.aicu_comment_recovery.is_some() || state.aicu_comments.is_empty() {
            callback(Progress::Status("正在获取AICU评论...".to_string()));
            if fetch_aicu_comments(api, state, &policies.archive, stop, callback).await? {
                return Ok(FetchOutcome::Paused);
            }
        }

        if state.aicu_danmu_recovery.is_some() || state.aicu_danmus.is_empty() {
            callback(Progress::Status("正在获取AICU弹幕...".to_string()));
            if fetch_aicu_danmus(api, state, &policies.archive, stop, callback).await? {
                return Ok(FetchOutcome::Paused);
            }
        }
    }

    let merged = state.merged(aicu_enabled);
    info!(
        "[Fetch] ✅ 全部数据源完成: 通知 {} 条, 评论 {} 条, 弹幕 {} 条",
        merged.notifies.len(),
        merged.comments.len(),
        merged.danmus.len()
    );
    Ok(FetchOutcome::Complete(merged))
}
