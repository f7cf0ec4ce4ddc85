use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use log::warn;

/// Canonical on-disk format: UTC, second precision, no zone suffix.
pub const DB_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const NAIVE_FORMATS: [&str; 2] = [DB_FORMAT, "%Y-%m-%d %H:%M:%S%.f"];
const OFFSET_FORMATS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S %z",
    "%Y-%m-%d %H:%M:%S%.f %z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
];

/// Normalize a timestamp for storage
pub fn to_db(ts: &DateTime<Utc>) -> String {
    ts.trunc_subsecs(0).format(DB_FORMAT).to_string()
}

pub fn opt_to_db(ts: &Option<DateTime<Utc>>) -> Option<String> {
    ts.as_ref().map(to_db)
}

/// Parse a stored timestamp.
///
/// Rows written by earlier releases used several layouts: plain UTC, with an
/// offset, with an offset followed by a zone abbreviation, and RFC 3339.
/// Unparseable values are logged and treated as absent.
pub fn from_db(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }

    // "2025-10-15 22:35:57 +0300 EEST": the abbreviation carries no information
    // the offset doesn't, so drop it before parsing
    let without_zone_name = match s.rsplit_once(' ') {
        Some((head, tail)) if tail.chars().all(|c| c.is_ascii_alphabetic()) => head,
        _ => s,
    };

    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(without_zone_name, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    warn!("Failed to parse timestamp: '{}'", s);
    None
}

pub fn opt_from_db(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().and_then(from_db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn expected() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 15, 19, 35, 57).unwrap()
    }

    #[test]
    fn test_to_db_truncates_and_normalizes() {
        let ts = Utc.with_ymd_and_hms(2025, 10, 15, 19, 35, 57).unwrap()
            + chrono::Duration::milliseconds(750);
        assert_eq!(to_db(&ts), "2025-10-15 19:35:57");
    }

    #[test]
    fn test_parse_plain() {
        assert_eq!(from_db("2025-10-15 19:35:57"), Some(expected()));
    }

    #[test]
    fn test_parse_with_offset() {
        assert_eq!(from_db("2025-10-15 22:35:57 +0300"), Some(expected()));
    }

    #[test]
    fn test_parse_with_offset_and_zone_name() {
        assert_eq!(from_db("2025-10-15 22:35:57 +0300 EEST"), Some(expected()));
        assert_eq!(from_db("2025-10-15 19:35:57 +0000 UTC"), Some(expected()));
    }

    #[test]
    fn test_parse_rfc3339() {
        assert_eq!(from_db("2025-10-15T22:35:57+03:00"), Some(expected()));
        assert_eq!(from_db("2025-10-15T19:35:57Z"), Some(expected()));
    }

    #[test]
    fn test_parse_fractional_seconds() {
        let parsed = from_db("2025-10-15 19:35:57.123456").unwrap();
        assert_eq!(parsed.trunc_subsecs(0), expected());
    }

    #[test]
    fn test_garbage_is_absent() {
        assert_eq!(from_db("yesterday-ish"), None);
        assert_eq!(from_db(""), None);
        assert_eq!(opt_from_db(None), None);
    }
}
