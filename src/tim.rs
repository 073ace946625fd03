//! Wall-clock helpers
//!
//! The core keeps timestamps as `f64` seconds since the epoch, which makes
//! TTL arithmetic and "NaN means unset" conventions cheap.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Current wall-clock time.
pub fn real() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Format a timestamp as an RFC 7231 HTTP-date.
pub fn format_http_date(t: f64) -> String {
    let dt: DateTime<Utc> = Utc
        .timestamp_opt(t.floor() as i64, 0)
        .single()
        .unwrap_or_default();
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parse the three date formats RFC 7231 requires recipients to accept.
pub fn parse_http_date(s: &str) -> Option<f64> {
    let s = s.trim();
    for fmt in [
        "%a, %d %b %Y %H:%M:%S GMT",
        "%A, %d-%b-%y %H:%M:%S GMT",
        "%a %b %e %H:%M:%S %Y",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc().timestamp() as f64);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_round_trip() {
        let t = 784_111_777.0;
        let s = format_http_date(t);
        assert_eq!(s, "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(parse_http_date(&s), Some(t));
    }

    #[test]
    fn legacy_formats_parse() {
        let t = Some(784_111_777.0);
        assert_eq!(parse_http_date("Sunday, 06-Nov-94 08:49:37 GMT"), t);
        assert_eq!(parse_http_date("Sun Nov  6 08:49:37 1994"), t);
        assert_eq!(parse_http_date("junk"), None);
    }
}
