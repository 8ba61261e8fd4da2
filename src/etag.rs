//! ETag 计算与条件请求判断。

use axum::http::{HeaderMap, header};
use httpdate::parse_http_date;
use std::fs::Metadata;
use std::time::{SystemTime, UNIX_EPOCH};

/// 根据文件大小与修改时间生成弱 ETag。
pub fn etag_from_metadata(metadata: &Metadata) -> String {
    let size = metadata.len();
    let modified = metadata.modified().ok();
    if let Some(modified) = modified
        && let Ok(duration) = modified.duration_since(UNIX_EPOCH)
    {
        return format!(
            "W/\"{}-{}-{}\"",
            size,
            duration.as_secs(),
            duration.subsec_nanos()
        );
    }
    format!("W/\"{}\"", size)
}

/// 判断能否以 304 响应；存在 `If-None-Match` 时忽略 `If-Modified-Since`。
pub fn is_not_modified(headers: &HeaderMap, etag: &str, modified: Option<SystemTime>) -> bool {
    if let Some(value) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
    {
        return value.trim() == "*" || etag_matches(value, etag);
    }

    let Some(since) = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_http_date(value).ok())
    else {
        return false;
    };
    modified
        .map(|modified| truncate_to_secs(modified) <= since)
        .unwrap_or(false)
}

/// 根据 `If-Range` 判断是否处理 Range 请求。
pub fn if_range_matches(headers: &HeaderMap, etag: &str, modified: Option<SystemTime>) -> bool {
    let Some(value) = headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
    else {
        return true;
    };
    let value = value.trim();
    if value.starts_with('"') || value.starts_with("W/") {
        return !value.starts_with("W/") && !etag.starts_with("W/") && value == etag;
    }
    match parse_http_date(value) {
        Ok(date) => modified
            .map(|ts| truncate_to_secs(ts) <= date)
            .unwrap_or(false),
        Err(_) => false,
    }
}

fn etag_matches(header_value: &str, current: &str) -> bool {
    header_value
        .split(',')
        .map(|item| item.trim())
        .any(|item| item == current || item.trim_start_matches("W/") == current.trim_start_matches("W/"))
}

fn truncate_to_secs(time: SystemTime) -> SystemTime {
    match time.duration_since(UNIX_EPOCH) {
        Ok(duration) => UNIX_EPOCH + std::time::Duration::from_secs(duration.as_secs()),
        Err(_) => time,
    }
}
