//! 远端删除调用：评论 / 弹幕 / 通知各一个端点
//!
//! 只有远端确认删除（code == 0）才算成功，本地清理由执行器负责。

use crate::bili::api_service::BiliApi;
use crate::bili::types::{Comment, Danmu, Notify};
use anyhow::{bail, Context, Result};
use serde_json::json;
use tracing::info;

/// 删除一条评论
///
/// type 11（带图动态）的接口要求 csrf 挂在查询串上而不是表单里。
pub async fn remove_comment(api: &dyn BiliApi, comment: &Comment, rpid: u64) -> Result<()> {
    let json_res = if comment.r#type == 11 {
        let url = format!(
            "https://api.bilibili.com/x/v2/reply/del?csrf={}",
            api.csrf()
        );
        let form = [
            ("oid", comment.oid.to_string()),
            ("type", comment.r#type.to_string()),
            ("rpid", rpid.to_string()),
        ];
        api.post_form(&url, &form).await
    } else {
        let form = [
            ("oid", comment.oid.to_string()),
            ("type", comment.r#type.to_string()),
            ("rpid", rpid.to_string()),
            ("csrf", api.csrf().to_string()),
        ];
        api.post_form("https://api.bilibili.com/x/v2/reply/del", &form)
            .await
    }
    .context("删除评论请求失败")?;

    if json_res["code"].as_i64().unwrap_or(-1) != 0 {
        bail!(
            "删除评论失败: {}",
            json_res["message"].as_str().unwrap_or("未知错误")
        );
    }
    info!("[Delete] 评论 {} 已删除", rpid);
    Ok(())
}

/// 删除一条弹幕
///
/// 上游接口对弹幕实际已失效，仍按原样发请求，非错误响应视为成功。
pub async fn remove_danmu(api: &dyn BiliApi, danmu: &Danmu, dmid: u64) -> Result<()> {
    let form = [
        ("dmid", dmid.to_string()),
        ("cid", danmu.cid.to_string()),
        ("type", "1".to_string()),
        ("csrf", api.csrf().to_string()),
    ];
    let json_res = api
        .post_form("https://api.bilibili.com/x/msgfeed/del", &form)
        .await
        .context("删除弹幕请求失败")?;

    if json_res["code"].as_i64().unwrap_or(-1) != 0 {
        bail!(
            "删除弹幕失败 (接口可能已失效): {}",
            json_res["message"].as_str().unwrap_or("未知错误")
        );
    }
    info!("[Delete] 弹幕 {} 已删除", dmid);
    Ok(())
}

/// 删除一条通知
///
/// 系统通知走 del_notify_list，两种 API 变体的 id 放进不同的字段；
/// 普通通知走 msgfeed/del 表单。
pub async fn remove_notify(api: &dyn BiliApi, notify: &Notify, id: u64) -> Result<()> {
    let json_res = if let Some(api_type) = notify.system_notify_api {
        let csrf = api.csrf();
        let body = if api_type == 0 {
            json!({
                "csrf": csrf, "ids": [id], "station_ids": [], "type": notify.tp,
                "build": 8140300, "mobi_app": "android",
            })
        } else {
            json!({
                "csrf": csrf, "ids": [], "station_ids": [id], "type": notify.tp,
                "build": 8140300, "mobi_app": "android",
            })
        };
        let url = format!(
            "https://message.bilibili.com/x/sys-msg/del_notify_list?build=8140300&mobi_app=android&csrf={csrf}"
        );
        api.post_json(&url, body).await
    } else {
        let form = [
            ("tp", notify.tp.to_string()),
            ("id", id.to_string()),
            ("build", "0".to_string()),
            ("mobi_app", "web".to_string()),
            ("csrf_token", api.csrf().to_string()),
            ("csrf", api.csrf().to_string()),
        ];
        api.post_form("https://api.bilibili.com/x/msgfeed/del", &form)
            .await
    }
    .context("删除通知请求失败")?;

    if json_res["code"].as_i64().unwrap_or(-1) != 0 {
        bail!(
            "删除通知失败: {}",
            json_res["message"].as_str().unwrap_or("未知错误")
        );
    }
    info!("[Delete] 通知 {} 已删除", id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bili::testutil::MockApi;
    use serde_json::json;

    #[tokio::test]
    async fn type_11_comment_puts_csrf_in_query() {
        let api = MockApi::new();
        let comment = Comment::new_with_notify(100, 11, "x".into(), 1, 0);
        remove_comment(&api, &comment, 555).await.unwrap();

        let posts = api.recorded_posts();
        let (url, body) = &posts[0];
        assert!(url.contains("csrf=test_csrf"));
        assert!(body["form"]["rpid"] == json!("555"));
        assert!(body["form"].get("csrf").is_none(), "type 11 的表单不带 csrf");
    }

    #[tokio::test]
    async fn system_notify_api_variant_selects_id_field() {
        let api = MockApi::new();
        let notify = Notify::new_system_notify("系统".into(), 4, 1);
        remove_notify(&api, &notify, 900).await.unwrap();

        let posts = api.recorded_posts();
        let (url, body) = &posts[0];
        assert!(url.contains("del_notify_list"));
        assert_eq!(body["station_ids"], json!([900]));
        assert_eq!(body["ids"], json!([]));
        assert_eq!(body["mobi_app"], json!("android"));
    }

    #[tokio::test]
    async fn nonzero_code_is_an_error() {
        let api = MockApi::new();
        api.enqueue(
            "reply/del",
            json!({ "code": 12022, "message": "评论已被删除" }),
        );
        let comment = Comment::new_with_notify(100, 1, "x".into(), 1, 0);
        let err = remove_comment(&api, &comment, 1).await.unwrap_err();
        assert!(err.to_string().contains("评论已被删除"));
    }
}
