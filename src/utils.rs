//! Formatting helpers for CLI output and logs.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Format how long ago a timestamp was.
///
/// # Examples
/// ```
/// use chrono::{Duration, Utc};
/// use cloudflare_ufw_sync::utils::format_duration_ago;
/// assert_eq!(format_duration_ago(Utc::now() - Duration::hours(5)), "5h ago");
/// ```
pub fn format_duration_ago(dt: DateTime<Utc>) -> String {
    let seconds = Utc::now().signed_duration_since(dt).num_seconds();
    if seconds < 60 {
        "just now".to_string()
    } else if seconds < 3600 {
        format!("{}m ago", seconds / 60)
    } else if seconds < 86400 {
        format!("{}h ago", seconds / 3600)
    } else {
        format!("{}d ago", seconds / 86400)
    }
}

/// Format an interval in the largest unit that divides it exactly.
///
/// # Examples
/// ```
/// use std::time::Duration;
/// use cloudflare_ufw_sync::utils::format_interval;
/// assert_eq!(format_interval(Duration::from_secs(86_400)), "1d");
/// assert_eq!(format_interval(Duration::from_secs(90)), "90s");
/// ```
pub fn format_interval(interval: Duration) -> String {
    let secs = interval.as_secs();
    match secs {
        0 => "0s".to_string(),
        s if s % 86_400 == 0 => format!("{}d", s / 86_400),
        s if s % 3_600 == 0 => format!("{}h", s / 3_600),
        s if s % 60 == 0 => format!("{}m", s / 60),
        s => format!("{}s", s),
    }
}

/// Truncate a string to a maximum number of characters, adding "..." if truncated.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
