use chrono::Utc;

pub(crate) fn is_false(b: &bool) -> bool {
    !(*b)
}

/// Milliseconds since the Unix epoch, the unit used by big segment store metadata.
pub(crate) fn unix_millis_now() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn trim_trailing_slashes(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}
