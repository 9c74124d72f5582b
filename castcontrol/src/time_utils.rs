//! Conversions between ticks (100 ns), seconds and the `HH:MM:SS` strings
//! AVTransport speaks.

pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Formats a duration in seconds as HH:MM:SS.
pub fn format_hhmmss(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, secs)
}

/// Formats a tick position as the HH:MM:SS string Seek expects.
pub fn ticks_to_hhmmss(ticks: i64) -> String {
    format_hhmmss((ticks.max(0) / TICKS_PER_SECOND) as u64)
}

/// Parses HH:MM:SS, MM:SS or SS to seconds.
///
/// Returns None for empty or sentinel values such as "NOT_IMPLEMENTED" or
/// "-:--:--", which renderers use for "no information".
pub fn parse_hms_to_secs(input: &str) -> Option<u64> {
    let input = input.trim();
    if input.is_empty() || input == "NOT_IMPLEMENTED" || input == "-:--:--" {
        return None;
    }

    let parts: Vec<&str> = input.split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }

    let mut total = 0u64;
    for part in parts {
        // Some firmwares emit fractional seconds ("00:00:01.000").
        let whole = part.split('.').next().unwrap_or(part);
        let value = whole.parse::<u64>().ok()?;
        total = total * 60 + value;
    }
    Some(total)
}

/// Parses an AVTransport time string to ticks.
pub fn parse_hms_to_ticks(input: &str) -> Option<i64> {
    parse_hms_to_secs(input).map(|s| s as i64 * TICKS_PER_SECOND)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_hhmmss() {
        assert_eq!(format_hhmmss(0), "00:00:00");
        assert_eq!(format_hhmmss(61), "00:01:01");
        assert_eq!(format_hhmmss(3661), "01:01:01");
        assert_eq!(format_hhmmss(86399), "23:59:59");
    }

    #[test]
    fn test_ticks_to_hhmmss() {
        // 500 s of ticks
        assert_eq!(ticks_to_hhmmss(5_000_000_000), "00:08:20");
        assert_eq!(ticks_to_hhmmss(0), "00:00:00");
        assert_eq!(ticks_to_hhmmss(-5), "00:00:00");
    }

    #[test]
    fn test_parse_hms_to_secs() {
        assert_eq!(parse_hms_to_secs("01:02:03"), Some(3723));
        assert_eq!(parse_hms_to_secs("02:03"), Some(123));
        assert_eq!(parse_hms_to_secs("42"), Some(42));
        assert_eq!(parse_hms_to_secs("00:00:01.000"), Some(1));
        assert_eq!(parse_hms_to_secs("NOT_IMPLEMENTED"), None);
        assert_eq!(parse_hms_to_secs("-:--:--"), None);
        assert_eq!(parse_hms_to_secs(""), None);
        assert_eq!(parse_hms_to_secs("1:2:3:4"), None);
        assert_eq!(parse_hms_to_secs("abc"), None);
    }

    #[test]
    fn test_round_trip() {
        let ticks = 3723 * TICKS_PER_SECOND;
        assert_eq!(parse_hms_to_ticks(&ticks_to_hhmmss(ticks)), Some(ticks));
    }
}
