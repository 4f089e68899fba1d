//! 后端失败分类：配额耗尽 / 临时不可用 / 致命错误。
//!
//! 判定规则集中在下面的表里，编排器只看分类结果，不再自行猜测是否可重试。

use crate::provider::ProviderError;
use sonic_rs::{JsonContainerTrait, JsonValueTrait};
use std::time::Duration;

/// 配额耗尽。
const QUOTA_STATUS: u16 = 429;

/// 视为临时不可用、值得退避重试的状态码。
const TRANSIENT_STATUS: &[u16] = &[500, 502, 503, 504];

/// 错误文本里出现这些片段（不区分大小写）即视为临时不可用。
const TRANSIENT_PHRASES: &[&str] = &["503", "overloaded", "unavailable", "try again later"];

const DEFAULT_QUOTA_MESSAGE: &str = "后端配额已耗尽";

#[derive(Debug, Clone, PartialEq)]
pub struct QuotaErrorInfo {
    pub status: u16,
    pub message: String,
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    QuotaExceeded(QuotaErrorInfo),
    Transient,
    Fatal,
}

pub fn classify(err: &ProviderError) -> FailureKind {
    let text = error_text(err);
    let status = err.status().or_else(|| sniff_status(&text));

    if status == Some(QUOTA_STATUS) {
        return FailureKind::QuotaExceeded(parse_quota_error(err, &text));
    }

    if status.is_some_and(|s| TRANSIENT_STATUS.contains(&s)) {
        return FailureKind::Transient;
    }

    let lower = text.to_lowercase();
    if TRANSIENT_PHRASES.iter().any(|p| lower.contains(p)) {
        return FailureKind::Transient;
    }

    FailureKind::Fatal
}

fn error_text(err: &ProviderError) -> String {
    match err {
        ProviderError::Http { message, body, .. } if body.is_empty() => message.clone(),
        ProviderError::Http { message, body, .. } => format!("{message} {body}"),
        ProviderError::Transport(e) => format!("{e:#}"),
    }
}

/// 错误文本中第一个独立的三位数字（如 "Error 503: ..."）。
fn sniff_status(text: &str) -> Option<u16> {
    text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .find(|tok| tok.len() == 3 && tok.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|tok| tok.parse().ok())
}

fn parse_quota_error(err: &ProviderError, text: &str) -> QuotaErrorInfo {
    let payload = match err {
        ProviderError::Http { body, .. } if !body.trim().is_empty() => parse_payload(body),
        _ => None,
    }
    .or_else(|| text.find('{').and_then(|idx| parse_payload(&text[idx..])));

    let mut message = None;
    let mut retry_after = None;

    if let Some(obj) = payload
        .as_ref()
        .and_then(|v| v.as_object())
        .and_then(|o| o.get(&"error"))
        .and_then(|e| e.as_object())
    {
        message = obj
            .get(&"message")
            .and_then(|m| m.as_str())
            .filter(|m| !m.trim().is_empty())
            .map(str::to_string);
        if let Some(details) = obj.get(&"details").and_then(|d| d.as_array()) {
            retry_after = details.iter().find_map(retry_after_from_detail);
        }
    }

    if retry_after.is_none() {
        retry_after = find_retry_in(&text.to_lowercase());
    }

    QuotaErrorInfo {
        status: QUOTA_STATUS,
        message: message.unwrap_or_else(|| DEFAULT_QUOTA_MESSAGE.to_string()),
        retry_after,
    }
}

fn parse_payload(s: &str) -> Option<sonic_rs::Value> {
    sonic_rs::from_str::<sonic_rs::Value>(s.trim()).ok()
}

/// 单个 detail 中的重试提示：优先 RetryInfo.retryDelay，其次 violations 描述里的 "retry in Ns"。
fn retry_after_from_detail(detail: &sonic_rs::Value) -> Option<Duration> {
    let obj = detail.as_object()?;

    let ty = obj.get(&"@type").and_then(|t| t.as_str()).unwrap_or("");
    let delay = obj.get(&"retryDelay").or_else(|| obj.get(&"retry_delay"));
    if ty.ends_with("RetryInfo")
        && let Some(delay) = delay
    {
        let parsed = if let Some(secs) = delay.as_f64() {
            secs_to_duration(secs)
        } else {
            delay.as_str().and_then(parse_seconds_prefix)
        };
        if parsed.is_some() {
            return parsed;
        }
    }

    obj.get(&"violations")
        .and_then(|v| v.as_array())?
        .iter()
        .filter_map(|v| v.as_object())
        .filter_map(|v| {
            v.get(&"description")
                .or_else(|| v.get(&"message"))
                .and_then(|h| h.as_str())
        })
        .find_map(|hint| find_retry_in(&hint.to_lowercase()))
}

/// 匹配 "retry in <空白><秒数>s"（输入需已转小写）。
fn find_retry_in(lower: &str) -> Option<Duration> {
    const NEEDLE: &str = "retry in";
    lower.match_indices(NEEDLE).find_map(|(idx, _)| {
        let rest = &lower[idx + NEEDLE.len()..];
        let trimmed = rest.trim_start();
        if trimmed.len() == rest.len() {
            return None;
        }
        parse_seconds_prefix(trimmed)
    })
}

/// 解析形如 "12s" / "1.5s" 的前缀（允许后面还有其他内容）。
fn parse_seconds_prefix(s: &str) -> Option<Duration> {
    let s = s.trim_start();
    let int_len = s.bytes().take_while(u8::is_ascii_digit).count();
    if int_len == 0 {
        return None;
    }
    let mut end = int_len;
    let bytes = s.as_bytes();
    if bytes.get(end) == Some(&b'.') {
        let frac_len = bytes[end + 1..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
        if frac_len > 0 {
            end += 1 + frac_len;
        }
    }
    if bytes.get(end) != Some(&b's') {
        return None;
    }
    s[..end].parse::<f64>().ok().and_then(secs_to_duration)
}

fn secs_to_duration(secs: f64) -> Option<Duration> {
    if !(secs.is_finite() && secs >= 0.0) {
        return None;
    }
    Some(Duration::from_secs_f64(secs))
}
