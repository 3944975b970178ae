use crate::api::Time;

/// Compact age of a comment: `now`, then minutes, hours and days
pub fn relative_time(at: Time, now: Time) -> String {
    let minutes = (now - at).num_minutes();
    match minutes {
        m if m < 1 => String::from("now"),
        m if m < 60 => format!("{m}m"),
        m if m < 60 * 24 => format!("{}h", m / 60),
        m => format!("{}d", m / (60 * 24)),
    }
}

/// First `max` characters of `s`, with `...` appended when something was cut
pub fn excerpt(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        None => String::from(s),
        Some((cut, _)) => format!("{}...", &s[..cut]),
    }
}
