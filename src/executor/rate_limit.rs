//! Rate-limit classification — a pure function over captured CLI output.
//!
//! Grounded in the teacher's per-format parser split (`parsers::codex`,
//! `parsers::gemini`), generalized to a single provider-agnostic classifier
//! since the executor contract here is "some external CLI", not a fixed set
//! of known backends.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Default substrings that mark output as rate-limit related (spec.md §4.2).
pub const DEFAULT_SIGNALS: &[&str] = &["rate limit", "quota", "too many requests", "retry after"];

/// Scan combined stdout+stderr for a rate-limit signal. Returns the reset
/// timestamp to resume at, or `None` if no signal matched.
///
/// When a signal matches but no parseable reset time is found, falls back
/// to `now + backoff_seconds` (spec.md §4.2: "rate-limited, retry after a
/// default backoff window").
pub fn classify(
    combined: &str,
    signals: &[String],
    backoff_seconds: i64,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let lower = combined.to_lowercase();
    let matched = signals.iter().any(|s| lower.contains(&s.to_lowercase()));
    if !matched {
        return None;
    }

    if let Some(reset_at) = parse_retry_after(combined, now) {
        return Some(reset_at);
    }
    if let Some(reset_at) = parse_iso8601_timestamp(combined) {
        return Some(reset_at);
    }
    Some(now + ChronoDuration::seconds(backoff_seconds))
}

/// Look for `retry-after: <seconds>` (case-insensitive) and return
/// `now + seconds`.
fn parse_retry_after(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let lower = text.to_lowercase();
    let marker = "retry-after:";
    let idx = lower.find(marker)?;
    let rest = text[idx + marker.len()..].trim_start();
    let token: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let seconds: i64 = token.parse().ok()?;
    Some(now + ChronoDuration::seconds(seconds))
}

/// Scan whitespace/quote-delimited tokens for the first one that parses as
/// an RFC3339 timestamp.
fn parse_iso8601_timestamp(text: &str) -> Option<DateTime<Utc>> {
    for token in text.split(|c: char| c.is_whitespace() || c == '"' || c == '\'' || c == ',') {
        let trimmed = token.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '-' && c != ':' && c != '+' && c != '.');
        if trimmed.len() < 10 {
            continue;
        }
        if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    None
}
