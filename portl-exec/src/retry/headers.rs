use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use httpdate::parse_http_date;

/// `Retry-After` as delta-seconds or an HTTP-date relative to `now`.
pub fn parse_retry_after(headers: &BTreeMap<String, String>, now: SystemTime) -> Option<Duration> {
    let v = get_header_ci(headers, "retry-after")?.trim();
    if let Ok(secs) = v.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let dt = parse_http_date(v).ok()?;
    Some(dt.duration_since(now).unwrap_or(Duration::ZERO))
}

pub(crate) fn get_header_ci<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
