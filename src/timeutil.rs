//! Date parsing and time bucketing.
//!
//! The pipeline accepts timestamps in several loose shapes: epoch seconds or
//! milliseconds (disambiguated by magnitude), bare year integers, and a fixed
//! set of common date-string layouts. Anything else is not a date; in
//! particular, bare short digit runs never parse, so numeric IDs cannot leak
//! into time analysis.

use std::sync::OnceLock;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dataset::Row;
use crate::value::{is_null_like, parse_number};

const EPOCH_MILLIS_FLOOR: f64 = 10_000_000_000.0;
const EPOCH_SECONDS_FLOOR: f64 = 1_000_000_000.0;
pub const YEAR_MIN: i64 = 1900;
pub const YEAR_MAX: i64 = 2100;

/// Cap on parsed timestamps when computing coverage.
const COVERAGE_PARSE_CAP: usize = 8_000;

fn date_shape_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            ^\d{4}-\d{1,2}-\d{1,2}
            | ^\d{4}/\d{1,2}/\d{1,2}
            | ^\d{1,2}/\d{1,2}/\d{2,4}
            | ^\d{1,2}-\d{1,2}-\d{2,4}
            | ^\d{4}-\d{2}-\d{2}T
            | ^\d{4}-\d{2}-\d{2}\s",
        )
        .expect("date shape pattern compiles")
    })
}

fn bare_digits_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{1,6}$").expect("bare digit pattern compiles"))
}

/// Whether a string matches one of the accepted date layouts. Bare 1–6 digit
/// runs are rejected up front so values like `"2024"` or row IDs are never
/// mistaken for dates here.
pub fn looks_like_date_string(s: &str) -> bool {
    let s = s.trim();
    if s.is_empty() || bare_digits_re().is_match(s) {
        return false;
    }
    date_shape_re().is_match(s)
}

fn parse_date_str(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    for fmt in [
        "%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%m/%d/%y", "%m-%d-%Y", "%m-%d-%y",
    ] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}

fn date_from_year(y: i64) -> Option<NaiveDateTime> {
    if !(YEAR_MIN..=YEAR_MAX).contains(&y) {
        return None;
    }
    NaiveDate::from_ymd_opt(y as i32, 1, 1).and_then(|d| d.and_hms_opt(0, 0, 0))
}

fn date_from_epoch(n: f64) -> Option<NaiveDateTime> {
    if n > EPOCH_MILLIS_FLOOR {
        return DateTime::from_timestamp_millis(n as i64).map(|d| d.naive_utc());
    }
    if n > EPOCH_SECONDS_FLOOR {
        return DateTime::from_timestamp((n) as i64, 0).map(|d| d.naive_utc());
    }
    None
}

/// Parse a cell as a timestamp.
///
/// Numeric cells: integers in `[1900, 2100]` are year literals (January 1),
/// values above 1e10 are epoch milliseconds, values in `(1e9, 1e10)` are
/// epoch seconds. String cells: a bare 4-digit year in range, or any of the
/// accepted date layouts.
pub fn parse_date_value(v: &Value) -> Option<NaiveDateTime> {
    if is_null_like(v) {
        return None;
    }
    if let Value::Number(_) = v {
        let n = parse_number(v)?;
        if n.fract() == 0.0 && (YEAR_MIN as f64..=YEAR_MAX as f64).contains(&n) {
            return date_from_year(n as i64);
        }
        return date_from_epoch(n);
    }
    if let Value::String(s) = v {
        let s = s.trim();
        if s.len() == 4 && s.chars().all(|c| c.is_ascii_digit()) {
            return date_from_year(s.parse::<i64>().ok()?);
        }
        if !looks_like_date_string(s) {
            return None;
        }
        return parse_date_str(s);
    }
    None
}

/// Like [`parse_date_value`] but without the year-literal affordance:
/// numeric cells only parse as epoch timestamps, and a bare `"2024"` is not
/// a date. Profiling uses this so that fiscal-year columns are classified by
/// the year probe rather than counted as parseable dates.
pub fn parse_date_value_strict(v: &Value) -> Option<NaiveDateTime> {
    if is_null_like(v) {
        return None;
    }
    match v {
        Value::Number(_) => date_from_epoch(parse_number(v)?),
        Value::String(s) => {
            let s = s.trim();
            if !looks_like_date_string(s) {
                return None;
            }
            parse_date_str(s)
        }
        _ => None,
    }
}

/// Epoch milliseconds for a parsed timestamp.
pub fn millis(dt: NaiveDateTime) -> i64 {
    dt.and_utc().timestamp_millis()
}

/// ISO-8601 rendering used by the normalizer (millisecond precision, UTC).
pub fn to_iso_string(dt: NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Time-bucketing resolution for trend analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeGrain {
    Day,
    Week,
    Month,
}

impl TimeGrain {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeGrain::Day => "day",
            TimeGrain::Week => "week",
            TimeGrain::Month => "month",
        }
    }
}

/// Bucket key for a timestamp at the given grain: `YYYY-MM-DD` for day,
/// `YYYY-MM-01` for month, and the Monday starting the ISO week for week.
/// Keys sort lexicographically in time order.
pub fn grain_bucket_key(dt: NaiveDateTime, grain: TimeGrain) -> String {
    let d = dt.date();
    match grain {
        TimeGrain::Day => d.format("%Y-%m-%d").to_string(),
        TimeGrain::Month => format!("{:04}-{:02}-01", d.year(), d.month()),
        TimeGrain::Week => {
            let monday = d - Duration::days(d.weekday().num_days_from_monday() as i64);
            monday.format("%Y-%m-%d").to_string()
        }
    }
}

/// Observed time range of a column, capped at [`COVERAGE_PARSE_CAP`] parsed
/// values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeCoverage {
    pub min_ts: i64,
    pub max_ts: i64,
    pub min_iso: String,
    pub max_iso: String,
    pub coverage_days: i64,
    pub parsed: usize,
}

pub fn compute_time_coverage(rows: &[Row], time_column: &str) -> Option<TimeCoverage> {
    let mut min_dt: Option<NaiveDateTime> = None;
    let mut max_dt: Option<NaiveDateTime> = None;
    let mut parsed = 0usize;
    for row in rows {
        let Some(v) = row.get(time_column) else {
            continue;
        };
        let Some(dt) = parse_date_value(v) else {
            continue;
        };
        parsed += 1;
        min_dt = Some(min_dt.map_or(dt, |cur| cur.min(dt)));
        max_dt = Some(max_dt.map_or(dt, |cur| cur.max(dt)));
        if parsed >= COVERAGE_PARSE_CAP {
            break;
        }
    }
    let (min_dt, max_dt) = (min_dt?, max_dt?);
    let (min_ts, max_ts) = (millis(min_dt), millis(max_dt));
    let span = (max_ts - min_ts) as f64 / 86_400_000.0;
    Some(TimeCoverage {
        min_ts,
        max_ts,
        min_iso: min_dt.date().format("%Y-%m-%d").to_string(),
        max_iso: max_dt.date().format("%Y-%m-%d").to_string(),
        coverage_days: span.round().max(0.0) as i64,
        parsed,
    })
}
