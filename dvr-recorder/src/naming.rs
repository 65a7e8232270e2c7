use chrono::{DateTime, Utc};

/// Timestamp format for file names: ISO 8601 without colons.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

/// Make a channel name safe to use in a file name.
///
/// Each run of characters other than ASCII letters and digits becomes a single
/// `_`, with none at either end. A name with nothing usable becomes `channel`.
pub fn sanitize_channel_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_separator = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_separator && !out.is_empty() {
                out.push('_');
            }
            pending_separator = false;
            out.push(c);
        } else {
            pending_separator = true;
        }
    }
    if out.is_empty() {
        out.push_str("channel");
    }
    out
}

/// `{sanitized name}-{timestamp}.{extension}`
pub fn recording_file_name(channel_name: &str, started: DateTime<Utc>, extension: &str) -> String {
    format!(
        "{}-{}.{}",
        sanitize_channel_name(channel_name),
        started.format(TIMESTAMP_FORMAT),
        extension.trim_start_matches('.')
    )
}
