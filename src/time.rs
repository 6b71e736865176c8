//! Shared relative-time parsing and temporal bucketing.
//!
//! All chart specs resolve their time ranges through `since_until` so that
//! "Last week", "30 days ago : now" and absolute ISO bounds behave identically
//! across chart kinds. `now` is always injected by the caller, which keeps the
//! resolution deterministic under test.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use regex::Regex;

use crate::error::VizError;

/// Temporal bucketing unit applied to a time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeGrain {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl TimeGrain {
    /// Accepts both plain unit names and the ISO-8601 duration codes used by
    /// chart specs ("PT1M", "P1D", ...).
    pub fn parse(s: &str) -> Option<TimeGrain> {
        match s.to_ascii_lowercase().as_str() {
            "second" | "pt1s" | "sec" => Some(TimeGrain::Second),
            "minute" | "pt1m" | "min" => Some(TimeGrain::Minute),
            "hour" | "pt1h" => Some(TimeGrain::Hour),
            "day" | "p1d" => Some(TimeGrain::Day),
            "week" | "p1w" => Some(TimeGrain::Week),
            "month" | "p1m" => Some(TimeGrain::Month),
            "quarter" | "p3m" => Some(TimeGrain::Quarter),
            "year" | "p1y" => Some(TimeGrain::Year),
            _ => None,
        }
    }

    pub fn iso_code(&self) -> &'static str {
        match self {
            TimeGrain::Second => "PT1S",
            TimeGrain::Minute => "PT1M",
            TimeGrain::Hour => "PT1H",
            TimeGrain::Day => "P1D",
            TimeGrain::Week => "P1W",
            TimeGrain::Month => "P1M",
            TimeGrain::Quarter => "P3M",
            TimeGrain::Year => "P1Y",
        }
    }

    /// Truncate a timestamp (epoch millis, UTC) down to the start of its bucket.
    pub fn truncate_ms(&self, ts_ms: i64) -> i64 {
        let dt = match Utc.timestamp_millis_opt(ts_ms).single() {
            Some(dt) => dt,
            None => return ts_ms,
        };
        let d = dt.date_naive();
        let floored = match self {
            TimeGrain::Second => dt.with_nanosecond(0).unwrap_or(dt),
            TimeGrain::Minute => dt.with_second(0).and_then(|x| x.with_nanosecond(0)).unwrap_or(dt),
            TimeGrain::Hour => dt
                .with_minute(0)
                .and_then(|x| x.with_second(0))
                .and_then(|x| x.with_nanosecond(0))
                .unwrap_or(dt),
            TimeGrain::Day => day_start(d),
            TimeGrain::Week => {
                let weekday = d.weekday().num_days_from_monday() as i64;
                day_start(d - Duration::days(weekday))
            }
            TimeGrain::Month => day_start(d.with_day(1).unwrap_or(d)),
            TimeGrain::Quarter => {
                let month0 = (d.month0() / 3) * 3;
                day_start(d.with_day(1).and_then(|x| x.with_month0(month0)).unwrap_or(d))
            }
            TimeGrain::Year => day_start(d.with_day(1).and_then(|x| x.with_month(1)).unwrap_or(d)),
        };
        floored.timestamp_millis()
    }
}

fn day_start(d: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).unwrap_or(NaiveDateTime::MIN))
}

fn unit_duration(unit: &str, n: i64, anchor: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match unit {
        "second" => Some(anchor - Duration::seconds(n)),
        "minute" => Some(anchor - Duration::minutes(n)),
        "hour" => Some(anchor - Duration::hours(n)),
        "day" => Some(anchor - Duration::days(n)),
        "week" => Some(anchor - Duration::weeks(n)),
        "month" => anchor.checked_sub_months(Months::new(n as u32)),
        "quarter" => anchor.checked_sub_months(Months::new(3 * n as u32)),
        "year" => anchor.checked_sub_months(Months::new(12 * n as u32)),
        _ => None,
    }
}

/// Parse one side of a time expression: empty, "now", "today", "<n> <unit> ago",
/// or an absolute timestamp ("2024-01-31" / "2024-01-31T12:00:00").
fn parse_point(s: &str, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, VizError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }
    let low = s.to_ascii_lowercase();
    if low == "now" {
        return Ok(Some(now));
    }
    if low == "today" {
        return Ok(Some(day_start(now.date_naive())));
    }
    let ago = Regex::new(r"(?i)^(\d+)\s+(second|minute|hour|day|week|month|quarter|year)s?\s+ago$").unwrap();
    if let Some(caps) = ago.captures(&low) {
        let n: i64 = caps[1].parse().map_err(|_| VizError::validation(format!("bad time expression: {s}")))?;
        return unit_duration(&caps[2], n, now)
            .map(Some)
            .ok_or_else(|| VizError::validation(format!("bad time expression: {s}")));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Some(Utc.from_utc_datetime(&dt)));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(Some(Utc.from_utc_datetime(&dt)));
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(Some(day_start(d)));
    }
    Err(VizError::validation(format!("unable to parse time expression: {s}")))
}

/// Resolve a chart time range into absolute bounds.
///
/// `time_range` takes precedence over `since`/`until`. "Last <unit>" and
/// "last <n> <unit>s" anchor at `now`; "<a> : <b>" resolves each side
/// independently; "No filter" yields open bounds.
pub fn since_until(
    time_range: Option<&str>,
    since: Option<&str>,
    until: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>), VizError> {
    if let Some(tr) = time_range.map(str::trim).filter(|s| !s.is_empty()) {
        let low = tr.to_ascii_lowercase();
        if low == "no filter" {
            return Ok((None, None));
        }
        if let Some(rest) = low.strip_prefix("last ") {
            let last = Regex::new(r"^(?:(\d+)\s+)?(second|minute|hour|day|week|month|quarter|year)s?$").unwrap();
            if let Some(caps) = last.captures(rest.trim()) {
                let n: i64 = caps.get(1).map(|m| m.as_str().parse().unwrap_or(1)).unwrap_or(1);
                let from = unit_duration(&caps[2], n, now)
                    .ok_or_else(|| VizError::validation(format!("unable to parse time range: {tr}")))?;
                return Ok((Some(from), Some(now)));
            }
        }
        if let Some((a, b)) = tr.split_once(" : ") {
            return Ok((parse_point(a, now)?, parse_point(b, now)?));
        }
        // A bare expression is treated as the start bound.
        return Ok((parse_point(tr, now)?, Some(now)));
    }
    let from = match since {
        Some(s) => parse_point(s, now)?,
        None => None,
    };
    let to = match until {
        Some(s) => parse_point(s, now)?,
        None => None,
    };
    Ok((from, to))
}

/// Parse a past time offset such as "1 week ago", "8 days" or "" (zero).
/// Month-family units use fixed-width approximations, matching how time-shift
/// overlays slide both bounds by a constant delta.
pub fn parse_past_timedelta(expr: &str) -> Result<Duration, VizError> {
    let s = expr.trim().to_ascii_lowercase();
    if s.is_empty() {
        return Ok(Duration::zero());
    }
    let re = Regex::new(r"^(\d+)\s+(second|minute|hour|day|week|month|quarter|year)s?(?:\s+ago)?$").unwrap();
    let caps = re
        .captures(&s)
        .ok_or_else(|| VizError::validation(format!("unable to parse time delta: {expr}")))?;
    let n: i64 = caps[1].parse().map_err(|_| VizError::validation(format!("unable to parse time delta: {expr}")))?;
    let dur = match &caps[2] {
        "second" => Duration::seconds(n),
        "minute" => Duration::minutes(n),
        "hour" => Duration::hours(n),
        "day" => Duration::days(n),
        "week" => Duration::weeks(n),
        "month" => Duration::days(30 * n),
        "quarter" => Duration::days(91 * n),
        "year" => Duration::days(365 * n),
        _ => unreachable!(),
    };
    Ok(dur)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn last_week_is_seven_days() {
        let (from, to) = since_until(Some("Last week"), None, None, fixed_now()).unwrap();
        assert_eq!(to.unwrap(), fixed_now());
        assert_eq!(to.unwrap() - from.unwrap(), Duration::days(7));
    }

    #[test]
    fn last_n_days() {
        let (from, to) = since_until(Some("last 30 days"), None, None, fixed_now()).unwrap();
        assert_eq!(to.unwrap() - from.unwrap(), Duration::days(30));
    }

    #[test]
    fn split_range_absolute() {
        let (from, to) = since_until(Some("2024-01-01 : 2024-02-01"), None, None, fixed_now()).unwrap();
        assert_eq!(from.unwrap(), Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(to.unwrap(), Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn no_filter_is_open() {
        let (from, to) = since_until(Some("No filter"), None, None, fixed_now()).unwrap();
        assert!(from.is_none() && to.is_none());
    }

    #[test]
    fn since_until_fallback() {
        let (from, to) = since_until(None, Some("7 days ago"), Some("now"), fixed_now()).unwrap();
        assert_eq!(to.unwrap(), fixed_now());
        assert_eq!(to.unwrap() - from.unwrap(), Duration::days(7));
    }

    #[test]
    fn garbage_expression_rejected() {
        assert!(since_until(Some("sometime nice"), None, None, fixed_now()).is_err());
    }

    #[test]
    fn past_timedelta() {
        assert_eq!(parse_past_timedelta("").unwrap(), Duration::zero());
        assert_eq!(parse_past_timedelta("1 week ago").unwrap(), Duration::weeks(1));
        assert_eq!(parse_past_timedelta("8 days").unwrap(), Duration::days(8));
        assert!(parse_past_timedelta("whenever").is_err());
    }

    #[test]
    fn grain_truncation() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 15, 13, 45, 30).unwrap().timestamp_millis();
        let day = TimeGrain::Day.truncate_ms(ts);
        assert_eq!(day, Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap().timestamp_millis());
        let month = TimeGrain::Month.truncate_ms(ts);
        assert_eq!(month, Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap().timestamp_millis());
        // 2024-06-15 is a Saturday; the week starts Monday the 10th.
        let week = TimeGrain::Week.truncate_ms(ts);
        assert_eq!(week, Utc.with_ymd_and_hms(2024, 6, 10, 0, 0, 0).unwrap().timestamp_millis());
    }

    #[test]
    fn grain_codes_roundtrip() {
        for g in [
            TimeGrain::Second,
            TimeGrain::Minute,
            TimeGrain::Hour,
            TimeGrain::Day,
            TimeGrain::Week,
            TimeGrain::Month,
            TimeGrain::Quarter,
            TimeGrain::Year,
        ] {
            assert_eq!(TimeGrain::parse(g.iso_code()), Some(g));
        }
    }
}
