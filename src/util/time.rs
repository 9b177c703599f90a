use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use tracing::warn;

/// Outcome of best-effort publish-time parsing.
///
/// `fallback` is set when the input was missing or unparseable and `time` is
/// just the current clock, so callers and tests can tell a real "today" apart
/// from a parser giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedPublishTime {
    pub time: DateTime<Utc>,
    pub fallback: bool,
}

pub fn parse_publish_time(raw: Option<&str>) -> ParsedPublishTime {
    parse_publish_time_at(raw, Utc::now())
}

/// Parse a raw date string against an explicit `now`, used for the year
/// inference on month/day-only values.
pub fn parse_publish_time_at(raw: Option<&str>, now: DateTime<Utc>) -> ParsedPublishTime {
    let trimmed = raw.map(str::trim).unwrap_or("");
    if trimmed.is_empty() {
        return ParsedPublishTime {
            time: now,
            fallback: true,
        };
    }

    match try_parse(trimmed, now) {
        Some(time) => ParsedPublishTime {
            time,
            fallback: false,
        },
        None => {
            warn!(raw = %trimmed, "publish time not parseable, falling back to now");
            ParsedPublishTime {
                time: now,
                fallback: true,
            }
        }
    }
}

fn try_parse(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if raw.chars().all(|c| c.is_ascii_digit()) {
        // 8 digits is a compact date, handled by the format list below.
        match raw.len() {
            10 => return Utc.timestamp_opt(raw.parse().ok()?, 0).single(),
            13 => return Utc.timestamp_millis_opt(raw.parse().ok()?).single(),
            _ => {}
        }
    }

    // Day glued in front of year-month, e.g. "252025-11" -> 2025-11-25.
    if let Some(caps) = Regex::new(r"^(\d{1,2})(\d{4})-(\d{2})$").ok()?.captures(raw) {
        return date_utc(
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
            caps[1].parse().ok()?,
        );
    }

    // Day/year/month, e.g. "25/2025/11" -> 2025-11-25.
    if let Some(caps) = Regex::new(r"^(\d{1,2})/(\d{4})/(\d{1,2})$")
        .ok()?
        .captures(raw)
    {
        return date_utc(
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
            caps[1].parse().ok()?,
        );
    }

    // Month-day with the year trailing after whitespace, e.g. "11-25  2025".
    if let Some(caps) = Regex::new(r"^(\d{1,2})[-/.](\d{1,2})\s+(\d{4})$")
        .ok()?
        .captures(raw)
    {
        return date_utc(
            caps[3].parse().ok()?,
            caps[1].parse().ok()?,
            caps[2].parse().ok()?,
        );
    }

    // Day-month with no year; pick this year unless that lands in the future.
    if let Some(caps) = Regex::new(r"^(\d{1,2})[-/.](\d{1,2})$").ok()?.captures(raw) {
        let first: u32 = caps[1].parse().ok()?;
        let second: u32 = caps[2].parse().ok()?;
        // Sites disagree on day-month vs month-day order; when the second
        // number cannot be a month, read it as the day instead.
        let (day, month) = if second > 12 && first <= 12 {
            (second, first)
        } else {
            (first, second)
        };
        let year = if (month, day) <= (now.month(), now.day()) {
            now.year()
        } else {
            now.year() - 1
        };
        return date_utc(year, month, day);
    }

    for fmt in ["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d", "%Y%m%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return date_utc(date.year(), date.month(), date.day());
        }
    }

    None
}

/// Parse a timestamp or datetime string without the now-fallback, for
/// callers that must keep an unparseable value raw instead.
pub fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        match trimmed.len() {
            10 => return Utc.timestamp_opt(trimmed.parse().ok()?, 0).single(),
            13 => return Utc.timestamp_millis_opt(trimmed.parse().ok()?).single(),
            _ => {}
        }
    }
    for fmt in [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y/%m/%d %H:%M:%S",
        "%Y/%m/%d %H:%M",
    ] {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(Utc.from_utc_datetime(&datetime));
        }
    }
    for fmt in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, fmt) {
            return date_utc(date.year(), date.month(), date.day());
        }
    }
    None
}

fn date_utc(year: i32, month: u32, day: u32) -> Option<DateTime<Utc>> {
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_now(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn expect_date(parsed: ParsedPublishTime, y: i32, m: u32, d: u32) {
        assert!(!parsed.fallback);
        assert_eq!(
            parsed.time,
            Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn iso_date_parses() {
        let parsed = parse_publish_time_at(Some("2024-03-05"), fixed_now(2024, 6, 1));
        expect_date(parsed, 2024, 3, 5);
    }

    #[test]
    fn slash_dot_and_compact_variants_parse() {
        let now = fixed_now(2024, 6, 1);
        expect_date(parse_publish_time_at(Some("2024/03/05"), now), 2024, 3, 5);
        expect_date(parse_publish_time_at(Some("2024.03.05"), now), 2024, 3, 5);
        expect_date(parse_publish_time_at(Some("20240305"), now), 2024, 3, 5);
    }

    #[test]
    fn epoch_seconds_and_millis_parse() {
        let now = fixed_now(2024, 6, 1);
        // 2024-03-05 00:00:00 UTC
        let parsed = parse_publish_time_at(Some("1709596800"), now);
        expect_date(parsed, 2024, 3, 5);
        let parsed = parse_publish_time_at(Some("1709596800000"), now);
        expect_date(parsed, 2024, 3, 5);
    }

    #[test]
    fn day_month_assumes_current_year_when_not_in_future() {
        let parsed = parse_publish_time_at(Some("05-03"), fixed_now(2024, 3, 10));
        expect_date(parsed, 2024, 3, 5);
    }

    #[test]
    fn day_month_rolls_back_a_year_when_in_future() {
        let parsed = parse_publish_time_at(Some("05-03"), fixed_now(2024, 2, 1));
        expect_date(parsed, 2023, 3, 5);
    }

    #[test]
    fn swapped_month_day_recovers_when_month_impossible() {
        // "11-25" cannot be day 11 month 25, so it reads as Nov 25.
        let parsed = parse_publish_time_at(Some("11-25"), fixed_now(2025, 12, 1));
        expect_date(parsed, 2025, 11, 25);
    }

    #[test]
    fn glued_day_year_month_parses() {
        let parsed = parse_publish_time_at(Some("252025-11"), fixed_now(2025, 12, 1));
        expect_date(parsed, 2025, 11, 25);
    }

    #[test]
    fn day_year_month_parses() {
        let parsed = parse_publish_time_at(Some("25/2025/11"), fixed_now(2025, 12, 1));
        expect_date(parsed, 2025, 11, 25);
    }

    #[test]
    fn month_day_with_trailing_year_parses() {
        let parsed = parse_publish_time_at(Some("11-25 2025"), fixed_now(2026, 1, 1));
        expect_date(parsed, 2025, 11, 25);
    }

    #[test]
    fn garbage_falls_back_to_now_and_is_flagged() {
        let now = fixed_now(2024, 3, 10);
        let parsed = parse_publish_time_at(Some("昨天"), now);
        assert!(parsed.fallback);
        assert_eq!(parsed.time, now);
    }

    #[test]
    fn fallback_is_distinguishable_from_genuine_today() {
        let now = fixed_now(2024, 3, 10);
        let genuine = parse_publish_time_at(Some("2024-03-10"), now);
        let fallen_back = parse_publish_time_at(Some("not a date"), now);
        assert!(!genuine.fallback);
        assert!(fallen_back.fallback);
    }

    #[test]
    fn missing_input_falls_back_silently() {
        let now = fixed_now(2024, 3, 10);
        let parsed = parse_publish_time_at(None, now);
        assert!(parsed.fallback);
        assert_eq!(parsed.time, now);
    }

    #[test]
    fn strict_datetime_accepts_clock_times_and_epochs() {
        assert_eq!(
            parse_datetime("2024-03-05 10:30:00"),
            Some(Utc.with_ymd_and_hms(2024, 3, 5, 10, 30, 0).unwrap())
        );
        assert_eq!(
            parse_datetime("1709596800"),
            Some(Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn strict_datetime_rejects_garbage_instead_of_falling_back() {
        assert_eq!(parse_datetime("三月五日"), None);
        assert_eq!(parse_datetime(""), None);
    }
}
