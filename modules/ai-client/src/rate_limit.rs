//! Retry hints on HTTP 429 responses.
//!
//! Vendors disagree on how to say "come back later". We look at, in order:
//!
//! 1. `retry-after` as delta-seconds (`"5"`, `"1.5"`) or an HTTP-date
//! 2. `x-ratelimit-reset-tokens`, `x-ratelimit-reset-requests`, `x-ratelimit-reset`
//!    as a duration (`"1s"`, `"250ms"`, `"6m0s"`) or an epoch timestamp
//!    (seconds or milliseconds)
//!
//! Callers fall back to their own default window when nothing parses.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};

const RESET_HEADERS: [&str; 3] = [
    "x-ratelimit-reset-tokens",
    "x-ratelimit-reset-requests",
    "x-ratelimit-reset",
];

/// Extract a retry delay from response headers, relative to `now`.
pub fn retry_after_from_headers(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    if let Some(delay) = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_retry_after(v, now))
    {
        return Some(delay);
    }

    RESET_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_reset(v, now))
    })
}

/// `retry-after`: delta-seconds or HTTP-date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    if is_decimal(trimmed) {
        let secs: f64 = trimmed.parse().ok()?;
        return Some(millis((secs * 1000.0).round()));
    }

    let at = DateTime::parse_from_rfc2822(trimmed).ok()?;
    let delta = at.with_timezone(&Utc) - now;
    Some(millis(delta.num_milliseconds() as f64))
}

/// Vendor reset headers: `"1s"`, `"250ms"`, `"1m30s"`, or an epoch timestamp.
pub fn parse_reset(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.len() >= 9 && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        let n: f64 = trimmed.parse().ok()?;
        // Ten digits or fewer is seconds since the epoch, beyond that milliseconds.
        let at_ms = if n < 10_000_000_000.0 { n * 1000.0 } else { n };
        return Some(millis(at_ms - now.timestamp_millis() as f64));
    }

    parse_compound_duration(trimmed)
}

/// Parses Go-style durations as emitted by OpenAI: `"20ms"`, `"1s"`, `"6m0s"`, `"1h2m"`.
fn parse_compound_duration(s: &str) -> Option<Duration> {
    let lower = s.to_ascii_lowercase();
    let mut rest = lower.as_str();
    let mut total_ms = 0.0_f64;
    let mut parsed_any = false;

    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return None;
        }
        let n: f64 = rest[..num_len].parse().ok()?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let factor = match &rest[..unit_len] {
            "ms" => 1.0,
            "s" => 1000.0,
            "m" => 60_000.0,
            "h" => 3_600_000.0,
            _ => return None,
        };
        rest = &rest[unit_len..];

        total_ms += n * factor;
        parsed_any = true;
    }

    parsed_any.then(|| millis(total_ms.round()))
}

fn is_decimal(s: &str) -> bool {
    let mut parts = s.splitn(2, '.');
    let whole = parts.next().unwrap_or_default();
    let frac = parts.next();
    !whole.is_empty()
        && whole.bytes().all(|b| b.is_ascii_digit())
        && frac.map_or(true, |f| !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()))
}

fn millis(ms: f64) -> Duration {
    Duration::from_millis(ms.max(0.0) as u64)
}
