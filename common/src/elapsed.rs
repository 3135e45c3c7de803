use chrono::DateTime;
use chrono::Utc;

/// Returns a string representing how long ago `instant` was, like
/// "just now", "5m ago" or "2h ago". Used in session headers.
pub fn format_ago(instant: DateTime<Utc>) -> String {
    let elapsed = Utc::now().signed_duration_since(instant);
    format_ago_delta(elapsed)
}

fn format_ago_delta(elapsed: chrono::TimeDelta) -> String {
    let secs = elapsed.num_seconds().max(0);
    if secs < 60 {
        "just now".to_string()
    } else if secs < 3_600 {
        format!("{}m ago", secs / 60)
    } else if secs < 86_400 {
        let hours = secs / 3_600;
        let minutes = (secs % 3_600) / 60;
        if minutes == 0 {
            format!("{hours}h ago")
        } else {
            format!("{hours}h {minutes}m ago")
        }
    } else {
        format!("{}d ago", secs / 86_400)
    }
}
