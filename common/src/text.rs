/// Truncate `s` to at most `max` characters, appending an ellipsis when
/// anything was cut. `max` counts the payload, not the marker.
pub fn truncate_with_ellipsis(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push('…');
    out
}

/// Collapse a multi-line string into its first line, marking continuation.
pub fn first_line(s: &str) -> String {
    match s.split_once('\n') {
        Some((head, _)) => format!("{head} …"),
        None => s.to_string(),
    }
}
