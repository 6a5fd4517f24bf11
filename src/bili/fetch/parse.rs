//! 通知条目里嵌套 URI 的解析
//!
//! 评论删除接口需要 (oid, type) 定位评论所在的承载对象，
//! 不同承载类型的 URI 形态各异，只能逐一模式匹配。
//! 识别不出的条目由调用方整条跳过。

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static VIDEO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"bilibili://video/(\d+)").unwrap());
static CID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"cid=(\d+)").unwrap());

/// 从通知条目的 `item` 细节中解析 (oid, type)
///
/// - 动态 `t.bilibili.com/{id}`：type 取 business_id，为 0 时退回 17
/// - 带图动态 `h.bilibili.com/ywh/{id}`：type 11
/// - 专栏 `read/cv{id}`：type 12
/// - 新版动态 `opus/{id}`：同动态
/// - 视频 / 番剧：aid 从 native_uri 的 `bilibili://video/` 中取，type 1
pub fn parse_oid(detail: &Value) -> Option<(u64, i64)> {
    let uri = detail["uri"].as_str().unwrap_or("");
    let native_uri = detail["native_uri"].as_str().unwrap_or("");
    let business_id = detail["business_id"].as_i64().unwrap_or(0);

    if let Some(rest) = uri.strip_prefix("https://t.bilibili.com/") {
        let oid = parse_leading_digits(rest)?;
        let tp = if business_id != 0 { business_id } else { 17 };
        return Some((oid, tp));
    }
    if let Some(rest) = uri.strip_prefix("https://h.bilibili.com/ywh/") {
        return Some((parse_leading_digits(rest)?, 11));
    }
    if let Some(rest) = uri.strip_prefix("https://www.bilibili.com/read/cv") {
        return Some((parse_leading_digits(rest)?, 12));
    }
    if let Some(rest) = uri.strip_prefix("https://www.bilibili.com/opus/") {
        let oid = parse_leading_digits(rest)?;
        let tp = if business_id != 0 { business_id } else { 17 };
        return Some((oid, tp));
    }
    if uri.starts_with("https://www.bilibili.com/video/")
        || uri.starts_with("https://www.bilibili.com/bangumi/play/")
    {
        let caps = VIDEO_RE.captures(native_uri)?;
        return Some((caps[1].parse().ok()?, 1));
    }
    None
}

/// 从 native_uri 中提取弹幕所在视频分 P 的 cid
pub fn extract_cid(native_uri: &str) -> Option<u64> {
    let caps = CID_RE.captures(native_uri)?;
    caps[1].parse().ok()
}

/// URI 尾部可能带查询串或多余路径段，只取开头的数字
fn parse_leading_digits(s: &str) -> Option<u64> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    s[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dynamic_uri_uses_business_id_fallback() {
        let detail = json!({ "uri": "https://t.bilibili.com/71200531234567", "business_id": 0 });
        assert_eq!(parse_oid(&detail), Some((71200531234567, 17)));

        let detail = json!({ "uri": "https://t.bilibili.com/712005312", "business_id": 33 });
        assert_eq!(parse_oid(&detail), Some((712005312, 33)));
    }

    #[test]
    fn article_and_album_uris() {
        let cv = json!({ "uri": "https://www.bilibili.com/read/cv12345?from=search" });
        assert_eq!(parse_oid(&cv), Some((12345, 12)));

        let ywh = json!({ "uri": "https://h.bilibili.com/ywh/998877" });
        assert_eq!(parse_oid(&ywh), Some((998877, 11)));
    }

    #[test]
    fn video_oid_comes_from_native_uri() {
        let detail = json!({
            "uri": "https://www.bilibili.com/video/BV1xx411c7mD",
            "native_uri": "bilibili://video/170001?comment_root_id=1&cid=279786",
        });
        assert_eq!(parse_oid(&detail), Some((170001, 1)));
    }

    #[test]
    fn unrecognized_uri_is_skipped() {
        let detail = json!({ "uri": "https://live.bilibili.com/123", "native_uri": "" });
        assert_eq!(parse_oid(&detail), None);
    }

    #[test]
    fn cid_extraction() {
        assert_eq!(
            extract_cid("bilibili://video/170001?comment_root_id=1&cid=279786"),
            Some(279786)
        );
        assert_eq!(extract_cid("bilibili://video/170001"), None);
    }
}
