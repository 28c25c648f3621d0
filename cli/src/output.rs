//! Table and value formatting helpers for CLI output.

use comfy_table::{ContentArrangement, Table};

/// Create a styled table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a timestamp relative to now ("3 hours ago").
pub fn format_ago(dt: &chrono::DateTime<chrono::Utc>) -> String {
    let duration = chrono::Utc::now().signed_duration_since(*dt);

    let secs = duration.num_seconds();
    if secs < 0 {
        return "just now".to_string();
    }
    if secs < 60 {
        return format!("{secs} seconds ago");
    }

    let mins = duration.num_minutes();
    if mins < 60 {
        return format!("{mins} minutes ago");
    }

    let hours = duration.num_hours();
    if hours < 24 {
        return format!("{hours} hours ago");
    }

    let days = duration.num_days();
    if days < 30 {
        return format!("{days} days ago");
    }
    if days < 365 {
        return format!("{} months ago", days / 30);
    }
    format!("{} years ago", days / 365)
}

/// Parse an age like "90s", "30m", "12h", "7d" or "2w".
///
/// No suffix means seconds.
pub fn parse_age(s: &str) -> Result<chrono::Duration, String> {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        return Err("empty age value".to_string());
    }

    let (num_str, unit) = match s.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => (&s[..i], c),
        _ => (s.as_str(), 's'),
    };
    let num: i64 = num_str
        .parse()
        .map_err(|_| format!("invalid age value: {s}"))?;
    if num < 0 {
        return Err(format!("invalid age value: {s}"));
    }

    match unit {
        's' => Ok(chrono::Duration::seconds(num)),
        'm' => Ok(chrono::Duration::minutes(num)),
        'h' => Ok(chrono::Duration::hours(num)),
        'd' => Ok(chrono::Duration::days(num)),
        'w' => Ok(chrono::Duration::weeks(num)),
        other => Err(format!("unknown age unit '{other}' in {s}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(2 * 1024 * 1024 * 1024), "2.0 GB");
    }

    #[test]
    fn test_new_table_with_rows() {
        let mut table = new_table(&["KIND", "DIGEST"]);
        table.add_row(vec!["blob", "sha256:0123456789ab"]);
        let rendered = table.to_string();
        assert!(rendered.contains("KIND"));
        assert!(rendered.contains("sha256:0123456789ab"));
    }

    #[test]
    fn test_format_ago() {
        let now = chrono::Utc::now();
        assert!(format_ago(&(now - chrono::Duration::seconds(5))).ends_with("seconds ago"));
        assert_eq!(format_ago(&(now - chrono::Duration::hours(3))), "3 hours ago");
        assert_eq!(format_ago(&(now - chrono::Duration::days(10))), "10 days ago");
        assert_eq!(format_ago(&(now - chrono::Duration::days(400))), "1 years ago");
        assert_eq!(format_ago(&(now + chrono::Duration::hours(1))), "just now");
    }

    #[test]
    fn test_parse_age() {
        assert_eq!(parse_age("90").unwrap(), chrono::Duration::seconds(90));
        assert_eq!(parse_age("30m").unwrap(), chrono::Duration::minutes(30));
        assert_eq!(parse_age(" 12H ").unwrap(), chrono::Duration::hours(12));
        assert_eq!(parse_age("7d").unwrap(), chrono::Duration::days(7));
        assert_eq!(parse_age("2w").unwrap(), chrono::Duration::weeks(2));
    }

    #[test]
    fn test_parse_age_invalid() {
        assert!(parse_age("").is_err());
        assert!(parse_age("d").is_err());
        assert!(parse_age("-1h").is_err());
        assert!(parse_age("1.5h").is_err());
        assert!(parse_age("3y").is_err());
    }
}
