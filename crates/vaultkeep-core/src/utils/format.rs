use std::time::Duration;

/// Truncate a string to a maximum number of characters, noting the total
/// length when anything was cut
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len).collect();
        format!("{}... (truncated, {} total bytes)", truncated, s.len())
    }
}

/// Format a duration as fractional hours with one decimal, e.g. `8.7h`
pub fn format_hours(duration: Duration) -> String {
    format!("{:.1}h", duration.as_secs_f64() / 3600.0)
}
