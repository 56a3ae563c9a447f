use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use portl_exec::retry::parse_retry_after;

fn headers(name: &str, value: &str) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert(name.to_string(), value.to_string());
    headers
}

#[test]
fn parse_retry_after_delta_seconds() {
    let result = parse_retry_after(&headers("Retry-After", "5"), SystemTime::now());
    assert_eq!(result, Some(Duration::from_secs(5)));
}

#[test]
fn parse_retry_after_http_date() {
    let now = SystemTime::now();
    let http_date = httpdate::fmt_http_date(now + Duration::from_secs(10));

    let delay = parse_retry_after(&headers("Retry-After", &http_date), now).unwrap();
    assert!(delay.as_secs() >= 9 && delay.as_secs() <= 11);
}

#[test]
fn parse_retry_after_date_in_the_past_is_zero() {
    let now = SystemTime::now();
    let http_date = httpdate::fmt_http_date(now - Duration::from_secs(60));

    assert_eq!(parse_retry_after(&headers("Retry-After", &http_date), now), Some(Duration::ZERO));
}

#[test]
fn parse_retry_after_case_insensitive() {
    let result = parse_retry_after(&headers("retry-after", " 3 "), SystemTime::now());
    assert_eq!(result, Some(Duration::from_secs(3)));
}

#[test]
fn parse_retry_after_ignores_garbage_and_absence() {
    assert_eq!(parse_retry_after(&headers("Retry-After", "soon"), SystemTime::now()), None);
    assert_eq!(parse_retry_after(&BTreeMap::new(), SystemTime::now()), None);
}
