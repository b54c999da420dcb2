//! Small shared helpers.

/// Current unix time in seconds. Claim timestamps are whole seconds.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Hours → seconds, the unit conversion for every `valid_for` field.
pub fn hours(h: i64) -> i64 {
    h * 3600
}
