//! Rate Limit Detection
//!
//! Recognises rate-limit answers from the upstream and reads how long it asks
//! us to back off.

use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::Duration;

/// Detect if a response indicates a rate limit error
pub fn is_rate_limit_error(status: u16, body: &str) -> bool {
    // HTTP 429 Too Many Requests
    if status == 429 {
        return true;
    }

    // Quota errors sometimes arrive as 400 or 403
    if status != 400 && status != 403 {
        return false;
    }

    let lower_body = body.to_lowercase();
    lower_body.contains("rate limit")
        || lower_body.contains("rate_limit")
        || lower_body.contains("too many requests")
        || lower_body.contains("quota exceeded")
}

/// Read the `Retry-After` header as seconds or a duration string.
///
/// HTTP-date values are ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    parse_duration_string(value)
}

/// Parse a duration string like "1m30s", "2h" or "500ms"
pub fn parse_duration_string(s: &str) -> Option<Duration> {
    let s = s.trim();

    if let Some(stripped) = s.strip_suffix("ms") {
        return stripped.parse::<u64>().ok().map(Duration::from_millis);
    }

    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut saw_unit = false;

    for c in s.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }

        let value: f64 = number.parse().ok()?;
        number.clear();

        let unit_secs = match c {
            'h' => 3600.0,
            'm' => 60.0,
            's' => 1.0,
            _ => return None,
        };
        let secs = value * unit_secs;
        if !secs.is_finite() {
            return None;
        }
        // Out-of-range values are treated as unparsable
        total = total.checked_add(Duration::try_from_secs_f64(secs).ok()?)?;
        saw_unit = true;
    }

    // Trailing digits without a unit
    if !number.is_empty() || !saw_unit {
        return None;
    }

    Some(total)
}
