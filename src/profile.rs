//! Dataset profiling: per-column role candidates, cardinality, missingness,
//! duplicates, and parse diagnostics.
//!
//! The profile is advisory. Nothing here rejects a dataset; quality findings
//! flow into plan confidence and data-quality blocks downstream. Every list
//! the profile emits is sorted so the same dataset always profiles to the
//! same bytes.

use std::sync::OnceLock;

use regex::Regex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::EngineConfig;
use crate::dataset::{CanonicalDataset, ColumnType, Row};
use crate::rowkey::row_digest;
use crate::timeutil::parse_date_value_strict;
use crate::value::{clamp01, distinct_key, is_null_like, parse_number};

/// Distinct sample values kept per profiled column.
const PROFILE_SAMPLE_VALUES: usize = 8;
/// Date-parse probe depth for columns typed (or named like) dates.
const DATE_PROBE_CAP: usize = 500;
/// Date-parse probe depth for everything else.
const GENERIC_DATE_PROBE_CAP: usize = 250;
/// Number-parse probe depth for numeric columns.
const NUMBER_PROBE_CAP: usize = 2_000;
/// Distinct-count scan stops once this many keys have been seen.
const DISTINCT_CAP: usize = 50_000;
/// Values checked by the US-state probe.
const STATE_PROBE_CAP: usize = 50;
/// Values checked by the latitude/longitude range probe.
const GEO_RANGE_PROBE_CAP: usize = 200;
/// Values checked by the year-integer probe.
const YEAR_PROBE_CAP: usize = 500;

const US_STATES: [&str; 51] = [
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "FL", "GA", "HI", "ID", "IL", "IN", "IA",
    "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV", "NH", "NJ",
    "NM", "NY", "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT", "VT",
    "VA", "WA", "WV", "WI", "WY", "DC",
];

pub(crate) fn date_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(date|time|posted|due|created|updated|deadline|response)")
            .expect("date name pattern compiles")
    })
}

fn id_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(id|uuid|key|notice|solicitation)").expect("id name pattern compiles")
    })
}

fn geo_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(state|city|country|lat|latitude|lon|lng|longitude|zip|postal|address)")
            .expect("geo name pattern compiles")
    })
}

pub(crate) fn year_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(year|yr|fy|fiscal)").expect("year name pattern compiles"))
}

/// Analysis role a column is a candidate for. Priority when several tests
/// pass: time, then geo, id, measure, text, dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnRole {
    Time,
    Geo,
    Id,
    Measure,
    Text,
    Dimension,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnProfile {
    pub name: String,
    pub inferred_type: ColumnType,
    pub role: ColumnRole,
    pub null_pct: f64,
    pub distinct_count: usize,
    pub sample_values: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProfileFlags {
    pub has_time: bool,
    pub has_geo: bool,
    pub has_numeric: bool,
    pub has_categorical: bool,
    pub has_text: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseIssueKind {
    DateParseFailed,
    NumberParseFailed,
    GeoOutOfRange,
}

impl ParseIssueKind {
    fn as_str(self) -> &'static str {
        match self {
            ParseIssueKind::DateParseFailed => "date_parse_failed",
            ParseIssueKind::NumberParseFailed => "number_parse_failed",
            ParseIssueKind::GeoOutOfRange => "geo_out_of_range",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseIssue {
    pub column: String,
    #[serde(rename = "type")]
    pub kind: ParseIssueKind,
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingnessSummary {
    pub overall_missing_pct: f64,
    pub columns_over_50_pct_missing: Vec<String>,
    pub columns_over_90_pct_missing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityReport {
    pub duplicates_pct: f64,
    pub missingness: MissingnessSummary,
    pub parse_issues: Vec<ParseIssue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetStats {
    pub row_count: usize,
    pub column_count: usize,
    pub profiled_row_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetProfile {
    pub dataset_stats: DatasetStats,
    pub columns: Vec<ColumnProfile>,
    pub flags: ProfileFlags,
    pub quality: QualityReport,
}

impl DatasetProfile {
    pub fn column(&self, name: &str) -> Option<&ColumnProfile> {
        self.columns.iter().find(|c| c.name == name)
    }
}

struct YearProbe {
    ok: bool,
    monotonic_non_decreasing: bool,
}

fn probe_year_integers(values: &[&Value]) -> YearProbe {
    let mut checked = 0usize;
    let mut in_range = 0usize;
    let mut seq: Vec<i64> = Vec::new();
    for v in values {
        let Some(num) = parse_number(v) else { continue };
        checked += 1;
        if num.fract() == 0.0 && (1900.0..=2100.0).contains(&num) {
            in_range += 1;
            seq.push(num as i64);
        }
        if checked >= YEAR_PROBE_CAP {
            break;
        }
    }
    let ratio = if checked > 0 {
        in_range as f64 / checked as f64
    } else {
        0.0
    };
    let monotonic = seq.windows(2).all(|w| w[1] >= w[0]);
    YearProbe {
        ok: ratio >= 0.8 && in_range >= 3,
        monotonic_non_decreasing: monotonic,
    }
}

fn is_likely_us_state(values: &[&Value]) -> bool {
    let mut checked = 0usize;
    let mut matched = 0usize;
    for v in values {
        let s = distinct_key(v);
        let s = s.trim().to_ascii_uppercase();
        if s.is_empty() {
            continue;
        }
        checked += 1;
        if US_STATES.contains(&s.as_str()) {
            matched += 1;
        }
        if checked >= STATE_PROBE_CAP {
            break;
        }
    }
    checked >= 5 && matched as f64 / checked as f64 >= 0.8
}

fn geo_out_of_range(name: &str, values: &[&Value]) -> Option<ParseIssue> {
    let lower = name.to_lowercase();
    let is_lat = lower.contains("lat");
    let is_lon = !is_lat && (lower.contains("lon") || lower.contains("lng"));
    if !is_lat && !is_lon {
        return None;
    }
    let mut bad = 0usize;
    let mut seen = 0usize;
    for v in values {
        let Some(num) = parse_number(v) else { continue };
        seen += 1;
        if is_lat && !(-90.0..=90.0).contains(&num) {
            bad += 1;
        }
        if is_lon && !(-180.0..=180.0).contains(&num) {
            bad += 1;
        }
        if seen >= GEO_RANGE_PROBE_CAP {
            break;
        }
    }
    if bad == 0 {
        return None;
    }
    Some(ParseIssue {
        column: name.to_string(),
        kind: ParseIssueKind::GeoOutOfRange,
        count: bad,
        hint: Some(
            if is_lat {
                "Latitude should be between -90 and 90"
            } else {
                "Longitude should be between -180 and 180"
            }
            .to_string(),
        ),
    })
}

fn avg_string_length(values: &[&Value]) -> f64 {
    let mut n = 0usize;
    let mut total = 0usize;
    for v in values {
        n += 1;
        total += distinct_key(v).chars().count();
    }
    if n > 0 {
        total as f64 / n as f64
    } else {
        0.0
    }
}

fn first_n_unique(values: &[&Value], limit: usize) -> Vec<Value> {
    let mut out = Vec::new();
    let mut seen: FxHashSet<String> = FxHashSet::default();
    for v in values {
        let key = distinct_key(v);
        if key.is_empty() || !seen.insert(key) {
            continue;
        }
        out.push((*v).clone());
        if out.len() >= limit {
            break;
        }
    }
    out
}

/// Profile a canonical dataset over at most `config.max_profile_rows` rows.
pub fn profile_dataset(dataset: &CanonicalDataset, config: &EngineConfig) -> DatasetProfile {
    let profiled_rows: &[Row] =
        &dataset.rows[..dataset.rows.len().min(config.max_profile_rows.max(1))];
    let profiled_row_count = profiled_rows.len();
    let row_count = if dataset.metadata.row_count > 0 {
        dataset.metadata.row_count
    } else {
        dataset.rows.len()
    };

    let mut columns: Vec<&str> = dataset
        .schema
        .iter()
        .map(|c| c.name.trim())
        .filter(|n| !n.is_empty())
        .collect();
    columns.sort_unstable();

    let mut parse_issues: Vec<ParseIssue> = Vec::new();
    let mut per_column: Vec<ColumnProfile> = Vec::with_capacity(columns.len());
    let mut flags = ProfileFlags::default();

    let mut missing_cells = 0usize;
    let total_cells = profiled_row_count.max(1) * columns.len().max(1);
    let mut columns_over_50: Vec<String> = Vec::new();
    let mut columns_over_90: Vec<String> = Vec::new();

    for name in &columns {
        let inferred_type = dataset
            .column(name)
            .map(|c| c.inferred_type)
            .unwrap_or(ColumnType::String);

        let non_null: Vec<&Value> = profiled_rows
            .iter()
            .filter_map(|r| r.get(*name))
            .filter(|v| !is_null_like(v))
            .collect();
        let null_count = profiled_row_count - non_null.len();
        let null_pct = if profiled_row_count > 0 {
            null_count as f64 / profiled_row_count as f64
        } else {
            0.0
        };
        missing_cells += null_count;

        let mut distinct_set: FxHashSet<String> = FxHashSet::default();
        for v in &non_null {
            let k = distinct_key(v);
            if !k.is_empty() {
                distinct_set.insert(k);
            }
            if distinct_set.len() > DISTINCT_CAP {
                break;
            }
        }
        let distinct_count = distinct_set.len();

        let avg_len = avg_string_length(&non_null);
        let name_is_date = date_name_re().is_match(name);

        // Date parse probe. Typed-date and date-named columns get the deeper
        // probe; failures are only an issue when the schema claims dates.
        let mut date_parseable = 0usize;
        if inferred_type == ColumnType::Date || name_is_date {
            let mut failed = 0usize;
            for v in non_null.iter().take(DATE_PROBE_CAP) {
                if parse_date_value_strict(v).is_some() {
                    date_parseable += 1;
                } else {
                    failed += 1;
                }
            }
            if failed > 0 && inferred_type == ColumnType::Date {
                parse_issues.push(ParseIssue {
                    column: (*name).to_string(),
                    kind: ParseIssueKind::DateParseFailed,
                    count: failed,
                    hint: None,
                });
            }
        } else {
            for v in non_null.iter().take(GENERIC_DATE_PROBE_CAP) {
                if parse_date_value_strict(v).is_some() {
                    date_parseable += 1;
                }
            }
        }
        let probe_cap = if inferred_type == ColumnType::Date {
            DATE_PROBE_CAP
        } else {
            GENERIC_DATE_PROBE_CAP
        };
        let denom = if non_null.is_empty() {
            1
        } else {
            non_null.len().min(probe_cap)
        };
        let date_parse_rate = if non_null.is_empty() {
            0.0
        } else {
            date_parseable as f64 / denom as f64
        };
        let is_time_by_date = name_is_date
            || date_parse_rate >= 0.7
            || (inferred_type == ColumnType::Date && date_parse_rate >= 0.5);

        let cardinality_ratio = if profiled_row_count > 0 {
            distinct_count as f64 / profiled_row_count as f64
        } else {
            0.0
        };
        let year_probe = if inferred_type == ColumnType::Number && year_name_re().is_match(name) {
            probe_year_integers(&non_null)
        } else {
            YearProbe {
                ok: false,
                monotonic_non_decreasing: false,
            }
        };
        let is_time_by_year =
            year_probe.ok && (cardinality_ratio >= 0.6 || year_probe.monotonic_non_decreasing);
        let is_time = is_time_by_year || is_time_by_date;

        let geo_state = name.to_lowercase().contains("state") && is_likely_us_state(&non_null);
        if let Some(issue) = geo_out_of_range(name, &non_null) {
            parse_issues.push(issue);
        }
        let is_geo = geo_name_re().is_match(name) || geo_state;

        let high_cardinality = if profiled_row_count <= 50 {
            cardinality_ratio >= 0.6
        } else {
            cardinality_ratio >= 0.9
        };
        let is_id = id_name_re().is_match(name) && high_cardinality;

        let mut is_measure = false;
        if inferred_type == ColumnType::Number {
            let mut nums: Vec<f64> = Vec::new();
            let mut failed = 0usize;
            for v in non_null.iter().take(NUMBER_PROBE_CAP) {
                match parse_number(v) {
                    Some(n) => nums.push(n),
                    None => failed += 1,
                }
            }
            if failed > 0 {
                parse_issues.push(ParseIssue {
                    column: (*name).to_string(),
                    kind: ParseIssueKind::NumberParseFailed,
                    count: failed,
                    hint: None,
                });
            }
            let mut distinct: FxHashSet<u64> = FxHashSet::default();
            let mut min = f64::INFINITY;
            let mut max = f64::NEG_INFINITY;
            for n in &nums {
                min = min.min(*n);
                max = max.max(*n);
                distinct.insert(n.to_bits());
                if distinct.len() > 50 {
                    break;
                }
            }
            is_measure = !nums.is_empty() && distinct.len() >= 2 && (max - min).abs() > 0.0;
        }
        if is_time {
            is_measure = false;
        }

        let is_text = inferred_type == ColumnType::String
            && (avg_len > 30.0
                || (!is_time
                    && !is_geo
                    && !is_id
                    && !is_measure
                    && cardinality_ratio > 0.5
                    && avg_len > 15.0));

        let role = if is_time {
            ColumnRole::Time
        } else if is_geo {
            ColumnRole::Geo
        } else if is_id {
            ColumnRole::Id
        } else if is_measure {
            ColumnRole::Measure
        } else if is_text {
            ColumnRole::Text
        } else {
            ColumnRole::Dimension
        };

        match role {
            ColumnRole::Time => flags.has_time = true,
            ColumnRole::Geo => flags.has_geo = true,
            ColumnRole::Text => flags.has_text = true,
            ColumnRole::Dimension => flags.has_categorical = true,
            _ => {}
        }
        if inferred_type == ColumnType::Number {
            flags.has_numeric = true;
        }
        if inferred_type == ColumnType::Boolean {
            flags.has_categorical = true;
        }

        if null_pct >= 0.5 {
            columns_over_50.push((*name).to_string());
        }
        if null_pct >= 0.9 {
            columns_over_90.push((*name).to_string());
        }

        per_column.push(ColumnProfile {
            name: (*name).to_string(),
            inferred_type,
            role,
            null_pct: clamp01(null_pct),
            distinct_count,
            sample_values: first_n_unique(&non_null, PROFILE_SAMPLE_VALUES),
        });
    }

    let mut duplicates_pct = 0.0;
    if profiled_row_count > 0 {
        let mut seen: FxHashSet<u64> = FxHashSet::default();
        let mut dup = 0usize;
        for row in profiled_rows {
            if !seen.insert(row_digest(row)) {
                dup += 1;
            }
        }
        duplicates_pct = dup as f64 / profiled_row_count as f64;
    }

    columns_over_50.sort_unstable();
    columns_over_90.sort_unstable();
    parse_issues.retain(|x| x.count > 0);
    parse_issues.sort_by(|a, b| {
        format!("{}{}", a.column, a.kind.as_str()).cmp(&format!("{}{}", b.column, b.kind.as_str()))
    });

    DatasetProfile {
        dataset_stats: DatasetStats {
            row_count,
            column_count: columns.len(),
            profiled_row_count,
        },
        columns: per_column,
        flags,
        quality: QualityReport {
            duplicates_pct: clamp01(duplicates_pct),
            missingness: MissingnessSummary {
                overall_missing_pct: clamp01(missing_cells as f64 / total_cells as f64),
                columns_over_50_pct_missing: columns_over_50,
                columns_over_90_pct_missing: columns_over_90,
            },
            parse_issues,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{ColumnDef, DatasetMetadata};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn col(name: &str, ty: ColumnType) -> ColumnDef {
        ColumnDef {
            name: name.to_string(),
            inferred_type: ty,
            nullable: true,
            sample_values: Vec::new(),
        }
    }

    fn dataset(schema: Vec<ColumnDef>, rows: Vec<Row>) -> CanonicalDataset {
        let metadata = DatasetMetadata {
            row_count: rows.len(),
            ..Default::default()
        };
        CanonicalDataset::new(schema, rows, metadata)
    }

    fn sales_rows() -> Vec<Row> {
        let regions = ["East", "West", "East", "North", "South", "East", "West", "North"];
        (0..8)
            .map(|i| {
                BTreeMap::from([
                    ("posted_date".to_string(), json!(format!("2024-01-{:02}", i + 1))),
                    ("order_id".to_string(), json!(format!("ORD-{i:04}"))),
                    ("region".to_string(), json!(regions[i])),
                    ("amount".to_string(), json!((i as f64 + 1.0) * 10.0)),
                    (
                        "description".to_string(),
                        json!(format!(
                            "A rather long free-text field describing order number {i} in detail"
                        )),
                    ),
                ])
            })
            .collect()
    }

    #[test]
    fn roles_follow_priority_order() {
        let ds = dataset(
            vec![
                col("posted_date", ColumnType::Date),
                col("order_id", ColumnType::String),
                col("region", ColumnType::String),
                col("amount", ColumnType::Number),
                col("description", ColumnType::String),
            ],
            sales_rows(),
        );
        let profile = profile_dataset(&ds, &EngineConfig::default());
        let role = |n: &str| profile.column(n).unwrap().role;
        assert_eq!(role("posted_date"), ColumnRole::Time);
        assert_eq!(role("order_id"), ColumnRole::Id);
        assert_eq!(role("region"), ColumnRole::Dimension);
        assert_eq!(role("amount"), ColumnRole::Measure);
        assert_eq!(role("description"), ColumnRole::Text);
        assert!(profile.flags.has_time);
        assert!(profile.flags.has_numeric);
        assert!(profile.flags.has_categorical);
        assert!(!profile.flags.has_geo);
    }

    #[test]
    fn columns_are_sorted_by_name() {
        let ds = dataset(
            vec![col("b", ColumnType::String), col("a", ColumnType::String)],
            vec![BTreeMap::from([
                ("b".to_string(), json!("x")),
                ("a".to_string(), json!("y")),
            ])],
        );
        let profile = profile_dataset(&ds, &EngineConfig::default());
        let names: Vec<&str> = profile.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn year_columns_become_time_not_measure() {
        let rows: Vec<Row> = [2019, 2020, 2021, 2022, 2023, 2024]
            .iter()
            .map(|y| BTreeMap::from([("fiscal_year".to_string(), json!(y))]))
            .collect();
        let ds = dataset(vec![col("fiscal_year", ColumnType::Number)], rows);
        let profile = profile_dataset(&ds, &EngineConfig::default());
        assert_eq!(profile.column("fiscal_year").unwrap().role, ColumnRole::Time);
    }

    #[test]
    fn state_codes_flag_geo_even_without_geo_name_keywords() {
        let codes = ["CA", "TX", "NY", "WA", "FL", "CA", "TX"];
        let rows: Vec<Row> = codes
            .iter()
            .map(|s| BTreeMap::from([("customer_state".to_string(), json!(s))]))
            .collect();
        let ds = dataset(vec![col("customer_state", ColumnType::String)], rows);
        let profile = profile_dataset(&ds, &EngineConfig::default());
        assert_eq!(profile.column("customer_state").unwrap().role, ColumnRole::Geo);
        assert!(profile.flags.has_geo);
    }

    #[test]
    fn out_of_range_latitude_is_a_parse_issue() {
        let rows: Vec<Row> = [12.5, 95.0, -45.0]
            .iter()
            .map(|n| BTreeMap::from([("latitude".to_string(), json!(n))]))
            .collect();
        let ds = dataset(vec![col("latitude", ColumnType::Number)], rows);
        let profile = profile_dataset(&ds, &EngineConfig::default());
        let issue = &profile.quality.parse_issues[0];
        assert_eq!(issue.kind, ParseIssueKind::GeoOutOfRange);
        assert_eq!(issue.count, 1);
        assert!(issue.hint.as_deref().unwrap().contains("-90"));
    }

    #[test]
    fn duplicate_rows_and_missingness_are_reported() {
        let base = BTreeMap::from([
            ("region".to_string(), json!("East")),
            ("mostly_missing".to_string(), Value::Null),
        ]);
        let mut rows = vec![base.clone(), base.clone(), base];
        rows.push(BTreeMap::from([
            ("region".to_string(), json!("West")),
            ("mostly_missing".to_string(), json!("x")),
        ]));
        let ds = dataset(
            vec![
                col("region", ColumnType::String),
                col("mostly_missing", ColumnType::String),
            ],
            rows,
        );
        let profile = profile_dataset(&ds, &EngineConfig::default());
        assert!((profile.quality.duplicates_pct - 0.5).abs() < 1e-12);
        assert_eq!(
            profile.quality.missingness.columns_over_50_pct_missing,
            vec!["mostly_missing".to_string()]
        );
        assert!(profile
            .quality
            .missingness
            .columns_over_90_pct_missing
            .is_empty());
    }
}
