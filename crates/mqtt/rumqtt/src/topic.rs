//! MQTT topic filter matching.

/// Whether `topic` matches the subscription `filter`.
///
/// `+` matches exactly one level, `#` matches the remaining levels including
/// the parent (`a/#` matches `a`). Topics starting with `$` are only matched
/// by filters that name their first level explicitly.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
