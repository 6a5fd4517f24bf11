//! HTTP 会话层
//!
//! 持有两个会话句柄：B 站官方接口用的异步 reqwest 客户端，
//! 以及 AICU 存档接口用的同步客户端（对方有 Cloudflare 反爬，
//! 同步调用经 `spawn_blocking` 驱动，任意时刻最多一个在途请求）。
//! 抓取与删除逻辑只依赖 `BiliApi` trait，方便在单测中用脚本化实现替换。

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
(KHTML, like Gecko) Chrome/110.0.0.0 Safari/537.36";

/// 抓取与删除逻辑依赖的 HTTP 接口
#[async_trait]
pub trait BiliApi: Send + Sync {
    /// bili_jct，授权所有写操作
    fn csrf(&self) -> &str;

    /// GET 并解析 JSON（B 站官方接口）
    async fn get_json(&self, url: &str) -> Result<Value>;

    /// 表单 POST（删除评论/通知等写接口）
    async fn post_form(&self, url: &str, form: &[(&str, String)]) -> Result<Value>;

    /// JSON POST（系统通知删除接口）
    async fn post_json(&self, url: &str, body: Value) -> Result<Value>;

    /// AICU 存档接口的 GET，底层走同步客户端
    async fn get_archive_json(&self, url: &str, params: &[(&str, String)]) -> Result<Value>;

    /// 当前登录用户的 uid（带缓存）
    async fn get_uid(&self) -> Result<u64>;
}

/// 缓存的用户信息（uid、用户名、头像）
#[derive(Debug, Clone, Default)]
struct UserInfoCache {
    uid: Option<u64>,
    username: Option<String>,
    face_url: Option<String>,
}

/// B 站 API 会话
pub struct ApiService {
    csrf: String,
    client: reqwest::Client,
    /// AICU 同步客户端，首次使用时在阻塞线程里创建
    archive_client: Arc<Mutex<Option<reqwest::blocking::Client>>>,
    user_cache: Mutex<UserInfoCache>,
}

impl ApiService {
    /// 从完整 cookie 字符串创建会话，csrf 取自 bili_jct 字段
    pub fn new(cookie: &str) -> Result<ApiService> {
        let start = cookie
            .find("bili_jct=")
            .context("cookie 中缺少 bili_jct 字段")?;
        let rest = &cookie[start + "bili_jct=".len()..];
        let csrf = match rest.find(';') {
            Some(end) => &rest[..end],
            None => rest,
        };
        Self::new_with_fields(csrf.trim(), cookie)
    }

    /// 用已知的 csrf 和 cookie 创建会话
    pub fn new_with_fields(csrf: &str, cookie: &str) -> Result<ApiService> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::USER_AGENT, UA.parse().context("无效的 UA")?);
        headers.insert(
            reqwest::header::COOKIE,
            cookie.parse().context("cookie 含非法字符，无法作为请求头")?,
        );
        headers.insert(
            reqwest::header::REFERER,
            "https://www.bilibili.com".parse().context("无效的 Referer")?,
        );
        let client = reqwest::ClientBuilder::new()
            .default_headers(headers)
            .build()
            .context("创建 HTTP 客户端失败")?;

        Ok(ApiService {
            csrf: csrf.to_string(),
            client,
            archive_client: Arc::new(Mutex::new(None)),
            user_cache: Mutex::new(UserInfoCache::default()),
        })
    }

    /// 获取用户信息（uid、用户名、头像 URL），优先走缓存
    pub async fn get_user_info(&self) -> Result<(u64, String, String)> {
        {
            let cache = self.user_cache.lock().expect("user_cache 锁中毒");
            if let (Some(uid), Some(name), Some(face)) =
                (cache.uid, cache.username.clone(), cache.face_url.clone())
            {
                return Ok((uid, name, face));
            }
        }

        let json = self
            .get_json("https://api.bilibili.com/x/space/myinfo")
            .await
            .context("获取用户信息失败")?;
        if json["code"].as_i64().unwrap_or(-1) != 0 {
            bail!("获取用户信息接口返回错误: {}", json);
        }
        let data = &json["data"];
        let uid = data["mid"].as_u64().context("用户信息缺少 mid")?;
        let name = data["name"].as_str().unwrap_or("用户").to_string();
        let face = data["face"].as_str().unwrap_or("").to_string();

        let mut cache = self.user_cache.lock().expect("user_cache 锁中毒");
        cache.uid = Some(uid);
        cache.username = Some(name.clone());
        cache.face_url = Some(face.clone());
        info!("[Api] 用户信息已缓存: uid={}, 用户名={}", uid, name);
        Ok((uid, name, face))
    }

    /// AICU 接口专用请求头（同一 IP 多 UA 容易被识别，统一用固定 UA）
    fn archive_headers() -> Vec<(&'static str, &'static str)> {
        vec![
            ("User-Agent", UA),
            ("Accept", "*/*"),
            ("Accept-Language", "en-US,en;q=0.9,zh-CN;q=0.8,zh;q=0.7"),
            ("Origin", "https://www.aicu.cc"),
            ("Sec-Fetch-Dest", "empty"),
            ("Sec-Fetch-Mode", "cors"),
            ("Sec-Fetch-Site", "same-site"),
        ]
    }
}

#[async_trait]
impl BiliApi for ApiService {
    fn csrf(&self) -> &str {
        &self.csrf
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("请求失败: {url}"))?
            .error_for_status()
            .with_context(|| format!("HTTP 状态错误: {url}"))?;
        let json: Value = resp.json().await.context("解析响应 JSON 失败")?;
        if json["code"].as_i64().unwrap_or(0) != 0 {
            warn!("[Api] 接口返回非零错误码: {}", json["code"]);
        }
        debug!("[Api] GET {} -> code={}", url, json["code"]);
        Ok(json)
    }

    async fn post_form(&self, url: &str, form: &[(&str, String)]) -> Result<Value> {
        let resp = self
            .client
            .post(url)
            .form(form)
            .send()
            .await
            .with_context(|| format!("表单请求失败: {url}"))?
            .error_for_status()
            .with_context(|| format!("HTTP 状态错误: {url}"))?;
        resp.json().await.context("解析响应 JSON 失败")
    }

    async fn post_json(&self, url: &str, body: Value) -> Result<Value> {
        let resp = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("JSON 请求失败: {url}"))?
            .error_for_status()
            .with_context(|| format!("HTTP 状态错误: {url}"))?;
        resp.json().await.context("解析响应 JSON 失败")
    }

    async fn get_archive_json(&self, url: &str, params: &[(&str, String)]) -> Result<Value> {
        let holder = self.archive_client.clone();
        let url = url.to_string();
        let params: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();

        // 同步请求放到阻塞线程池执行，不占用协作式调度器
        let json = tokio::task::spawn_blocking(move || -> Result<Value> {
            let client = {
                let mut guard = holder.lock().expect("archive_client 锁中毒");
                if guard.is_none() {
                    let built = reqwest::blocking::ClientBuilder::new()
                        .timeout(std::time::Duration::from_secs(30))
                        .build()
                        .context("创建存档接口客户端失败")?;
                    *guard = Some(built);
                }
                guard.as_ref().expect("刚刚初始化过").clone()
            };

            let mut req = client.get(&url).query(&params);
            for (k, v) in ApiService::archive_headers() {
                req = req.header(k, v);
            }
            let resp = req
                .send()
                .with_context(|| format!("存档接口请求失败: {url}"))?
                .error_for_status()
                .with_context(|| format!("存档接口 HTTP 状态错误: {url}"))?;
            resp.json().context("解析存档接口 JSON 失败")
        })
        .await
        .context("存档接口任务被取消")??;

        Ok(json)
    }

    async fn get_uid(&self) -> Result<u64> {
        {
            let cache = self.user_cache.lock().expect("user_cache 锁中毒");
            if let Some(uid) = cache.uid {
                return Ok(uid);
            }
        }

        let json = self
            .get_json("https://api.bilibili.com/x/member/web/account")
            .await
            .context("获取 uid 失败")?;
        if json["code"].as_i64().unwrap_or(-1) != 0 {
            bail!("获取 uid 接口返回错误: {}", json);
        }
        let uid = json["data"]["mid"].as_u64().context("响应缺少 mid 字段")?;

        self.user_cache.lock().expect("user_cache 锁中毒").uid = Some(uid);
        Ok(uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csrf_extracted_from_cookie() {
        let svc = ApiService::new("SESSDATA=xxx; bili_jct=abc123; other=1").unwrap();
        assert_eq!(svc.csrf(), "abc123");
    }

    #[test]
    fn csrf_at_cookie_tail() {
        let svc = ApiService::new("SESSDATA=xxx; bili_jct=tail_token").unwrap();
        assert_eq!(svc.csrf(), "tail_token");
    }

    #[test]
    fn missing_csrf_is_an_error() {
        assert!(ApiService::new("SESSDATA=xxx; other=1").is_err());
    }
}
