//! Plan execution: one well-formed [`InsightBlock`] per plan entry.
//!
//! The executor is a pure function of `(dataset, semantic graph, plan,
//! config)`. Applicability and sparsity conditions become block statuses,
//! never errors, and every grouping/sorting step uses stable ordering with
//! explicit tie-breaks so repeated runs are byte-identical.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use rustc_hash::FxHashSet;

use crate::config::EngineConfig;
use crate::dataset::{CanonicalDataset, ColumnType, Row};
use crate::insight::{
    Badge, BadgeStatus, BlockPayload, BlockStatus, Change, ColumnMissingness, ComparePayload,
    ComparePeriod, CompareUnavailablePayload, ContributionRow, DetailsPayload,
    DistributionPayload, DriverOverall, DriverPayload, DriverRow, EmptyPayload, ExecutiveKpis,
    GeoPoint, GeoPointsPayload, GeoRegionPayload, GroupedPayload, HistogramBin, InsightBlock,
    KeyValue, KpiPayload, MetricSummary, PeriodValue, QualityPayload, Quantiles, RangeCompare,
    RangeTotal, TimeKpis, TopContributor, TrendBucket, TrendPayload,
};
use crate::numeric::{compute_numeric_summary, quantile};
use crate::plan::{Aggregation, AnalysisPlan, GeoMode, PlanBlock, PlanSelections};
use crate::profile::{self, ParseIssue, ParseIssueKind};
use crate::rowkey::row_digest;
use crate::semantic::SemanticGraph;
use crate::timeutil::{
    compute_time_coverage, grain_bucket_key, millis, parse_date_value, to_iso_string,
    TimeCoverage, TimeGrain,
};
use crate::value::{clamp01, group_key, is_null_like, parse_number};

/// Valid geographic points emitted per block.
const GEO_POINT_CAP: usize = 2_000;
/// Region-mode geo grouping keeps this many groups, no "Other" rollup.
const GEO_REGION_LIMIT: usize = 60;
/// Values scanned per column when scoring KPI measures.
const MEASURE_SCAN_CAP: usize = 5_000;
/// Rows stamped for executive time KPIs.
const EXEC_STAMP_CAP: usize = 20_000;
/// Values checked per column by data-quality parse probes.
const QUALITY_PROBE_CAP: usize = 500;
/// Values checked by the year-literal probe.
const YEAR_PROBE_CAP: usize = 300;
/// Z-score threshold for marking a trend bucket as anomalous.
const ANOMALY_Z_THRESHOLD: f64 = 2.0;
/// Columns surfaced as search keys in the details table.
const SEARCH_KEY_LIMIT: usize = 12;

fn geo_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(state|city|country|lat|latitude|lon|lng|longitude|zip|postal)")
            .expect("geo column pattern compiles")
    })
}

fn lat_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(lat|latitude)").expect("lat pattern compiles"))
}

fn lon_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(lon|lng|longitude)").expect("lon pattern compiles"))
}

fn region_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(state|country)").expect("region pattern compiles"))
}

fn contributor_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(category|region|product)").expect("contributor pattern compiles")
    })
}

fn compare_dim_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(category|region)").expect("compare pattern compiles"))
}

fn search_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(id|name|title|solicitation|notice|state|city|country|date|posted|created)")
            .expect("search key pattern compiles")
    })
}

/// Column shortlists the executor falls back on when a plan entry leaves a
/// parameter unspecified. Role assignments from the semantic graph take
/// precedence over name patterns, in graph order.
struct DetectedColumns {
    schema_names: Vec<String>,
    string_cols: Vec<String>,
    numeric: Vec<String>,
    date: Vec<String>,
    geo: Vec<String>,
}

fn dedup_preserving(parts: Vec<Vec<String>>) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen: FxHashSet<String> = FxHashSet::default();
    for part in parts {
        for name in part {
            if seen.insert(name.clone()) {
                out.push(name);
            }
        }
    }
    out
}

fn detect_columns(dataset: &CanonicalDataset, graph: &SemanticGraph) -> DetectedColumns {
    use crate::profile::ColumnRole;

    let role_of = |name: &str| graph.column(name).map(|c| c.role);
    let by_role = |role: ColumnRole| -> Vec<String> {
        dataset
            .schema
            .iter()
            .filter(|c| role_of(&c.name) == Some(role))
            .map(|c| c.name.clone())
            .collect()
    };

    let numeric_typed: Vec<String> = dataset
        .schema
        .iter()
        .filter(|c| c.inferred_type == ColumnType::Number)
        .map(|c| c.name.clone())
        .collect();
    let date_named: Vec<String> = dataset
        .schema
        .iter()
        .filter(|c| {
            c.inferred_type == ColumnType::Date || profile::date_name_re().is_match(&c.name)
        })
        .map(|c| c.name.clone())
        .collect();
    let geo_named: Vec<String> = dataset
        .schema
        .iter()
        .filter(|c| geo_name_re().is_match(&c.name))
        .map(|c| c.name.clone())
        .collect();
    let time_roles = by_role(ColumnRole::Time);
    let geo_roles = by_role(ColumnRole::Geo);
    let measure_roles = by_role(ColumnRole::Measure);

    let excluded: FxHashSet<&String> = time_roles.iter().chain(geo_roles.iter()).collect();
    let numeric = dedup_preserving(vec![measure_roles, numeric_typed])
        .into_iter()
        .filter(|c| !excluded.contains(c))
        .collect();

    DetectedColumns {
        schema_names: dataset.schema.iter().map(|c| c.name.clone()).collect(),
        string_cols: dataset
            .schema
            .iter()
            .filter(|c| c.inferred_type == ColumnType::String)
            .map(|c| c.name.clone())
            .collect(),
        numeric,
        date: dedup_preserving(vec![time_roles, date_named]),
        geo: dedup_preserving(vec![geo_roles, geo_named]),
    }
}

fn build_id(prefix: &str, idx: usize, extra: Option<&str>) -> String {
    match extra {
        Some(extra) => format!("{prefix}-{:02}-{extra}", idx + 1),
        None => format!("{prefix}-{:02}", idx + 1),
    }
}

fn trim_decimal(v: f64) -> String {
    let rounded = (v * 100.0).round() / 100.0;
    if rounded.fract() == 0.0 {
        format!("{rounded:.0}")
    } else if (rounded * 10.0).fract() == 0.0 {
        format!("{rounded:.1}")
    } else {
        format!("{rounded:.2}")
    }
}

fn format_number_short(n: f64) -> String {
    if !n.is_finite() {
        return "—".to_string();
    }
    let abs = n.abs();
    if abs >= 1_000_000_000.0 {
        format!("{:.2}B", n / 1_000_000_000.0)
    } else if abs >= 1_000_000.0 {
        format!("{:.2}M", n / 1_000_000.0)
    } else if abs >= 1_000.0 {
        format!("{:.2}K", n / 1_000.0)
    } else {
        trim_decimal(n)
    }
}

fn format_pct(p: Option<f64>) -> String {
    match p {
        Some(p) if p.is_finite() => {
            let v = (p * 1000.0).round() / 10.0;
            if v.fract() == 0.0 {
                format!("{v:.0}%")
            } else {
                format!("{v:.1}%")
            }
        }
        _ => "—".to_string(),
    }
}

fn compute_badges(
    sample_size: usize,
    coverage: Option<&TimeCoverage>,
    penalty: Option<f64>,
) -> Vec<Badge> {
    let mut badges = vec![Badge {
        id: "sampleSize",
        label: format!("Sample {sample_size}"),
        status: if sample_size >= 50 {
            BadgeStatus::Ok
        } else {
            BadgeStatus::Warn
        },
    }];
    if let Some(cov) = coverage {
        badges.push(Badge {
            id: "timeCoverage",
            label: format!("Time {}→{}", cov.min_iso, cov.max_iso),
            status: if cov.coverage_days >= 30 {
                BadgeStatus::Ok
            } else {
                BadgeStatus::Warn
            },
        });
    }
    let p = clamp01(penalty.unwrap_or(0.0));
    badges.push(Badge {
        id: "dataQualityPenalty",
        label: format!("Quality penalty {}%", (p * 100.0).round() as i64),
        status: if p <= 0.25 {
            BadgeStatus::Ok
        } else {
            BadgeStatus::Warn
        },
    });
    badges
}

fn key_of(row: &Row, column: &str) -> String {
    match row.get(column) {
        Some(v) => group_key(v),
        None => "(missing)".to_string(),
    }
}

/// Top-K by value descending, equal values ordered by key ascending.
fn stable_top_n(mut items: Vec<KeyValue>, limit: usize) -> Vec<KeyValue> {
    items.sort_by(|a, b| b.value.total_cmp(&a.value).then_with(|| a.key.cmp(&b.key)));
    items.truncate(limit);
    items
}

/// Score numeric columns by spread and fill so the most informative measures
/// lead the KPI summary.
fn pick_top_measures(rows: &[Row], numeric_cols: &[String], limit: usize) -> Vec<String> {
    let mut scored: Vec<(String, f64)> = Vec::new();
    for col in numeric_cols {
        let mut nums: Vec<f64> = Vec::new();
        let mut non_null = 0usize;
        for row in rows {
            let Some(n) = row.get(col).and_then(parse_number) else {
                continue;
            };
            non_null += 1;
            nums.push(n);
            if nums.len() >= MEASURE_SCAN_CAP {
                break;
            }
        }
        if non_null < 2 {
            continue;
        }
        nums.sort_by(f64::total_cmp);
        let range = nums[nums.len() - 1] - nums[0];
        let p50 = quantile(&nums, 0.5).unwrap_or(0.0);
        let non_trivial = if range.abs() > 0.0 { 1.0 } else { 0.0 };
        let fill_rate = non_null as f64 / rows.len().max(1) as f64;
        let score = non_trivial * 1000.0 + range.abs() + p50.abs() * 0.01 + fill_rate * 10.0;
        scored.push((col.clone(), score));
    }
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    scored.into_iter().take(limit).map(|(n, _)| n).collect()
}

fn is_year_time_column(name: &str, rows: &[Row]) -> bool {
    if !profile::year_name_re().is_match(name) {
        return false;
    }
    let mut checked = 0usize;
    let mut ok = 0usize;
    for row in rows {
        let Some(n) = row.get(name).and_then(parse_number) else {
            continue;
        };
        checked += 1;
        if n.fract() == 0.0 && (1900.0..=2100.0).contains(&n) {
            ok += 1;
        }
        if checked >= YEAR_PROBE_CAP {
            break;
        }
    }
    checked >= 3 && ok as f64 / checked as f64 >= 0.8
}

/// Year-over-year comparison for year-literal time columns: latest year vs.
/// the immediately prior year when present, else the second-latest observed.
fn compute_latest_and_yoy(rows: &[Row], time_col: &str, measure_col: &str) -> Option<TimeKpis> {
    if !is_year_time_column(time_col, rows) {
        return None;
    }
    let mut by_year: BTreeMap<i64, f64> = BTreeMap::new();
    for row in rows {
        let Some(y) = row.get(time_col).and_then(parse_number) else {
            continue;
        };
        if y.fract() != 0.0 || !(1900.0..=2100.0).contains(&y) {
            continue;
        }
        let Some(m) = row.get(measure_col).and_then(parse_number) else {
            continue;
        };
        *by_year.entry(y as i64).or_insert(0.0) += m;
    }
    if by_year.len() < 2 {
        return None;
    }
    let years: Vec<i64> = by_year.keys().copied().collect();
    let latest_year = years[years.len() - 1];
    let prev_year = if by_year.contains_key(&(latest_year - 1)) {
        latest_year - 1
    } else {
        years[years.len() - 2]
    };
    let latest = by_year[&latest_year];
    let prev = by_year[&prev_year];
    let delta = latest - prev;
    let pct = if prev != 0.0 { Some(delta / prev) } else { None };
    Some(TimeKpis {
        measure: Some(measure_col.to_string()),
        time_column: time_col.to_string(),
        latest_period: latest_year,
        prev_period: prev_year,
        latest_value: latest,
        prev_value: prev,
        delta,
        pct,
    })
}

fn millis_to_day(t: i64) -> String {
    chrono::DateTime::from_timestamp_millis(t)
        .map(|d| d.date_naive().format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

fn millis_to_iso(t: i64) -> String {
    chrono::DateTime::from_timestamp_millis(t)
        .map(|d| to_iso_string(d.naive_utc()))
        .unwrap_or_default()
}

fn compute_executive_time_kpis(
    rows: &[Row],
    time_column: &str,
    grain: TimeGrain,
    measure: &str,
    contributor_dims: &[String],
) -> Option<ExecutiveKpis> {
    struct Stamped<'a> {
        t: i64,
        period: String,
        row: &'a Row,
        value: f64,
    }
    let mut stamped: Vec<Stamped<'_>> = Vec::new();
    for row in rows {
        let Some(dt) = row.get(time_column).and_then(|v| parse_date_value(v)) else {
            continue;
        };
        let Some(value) = row.get(measure).and_then(parse_number) else {
            continue;
        };
        stamped.push(Stamped {
            t: millis(dt),
            period: grain_bucket_key(dt, grain),
            row,
            value,
        });
        if stamped.len() >= EXEC_STAMP_CAP {
            break;
        }
    }
    if stamped.len() < 3 {
        return None;
    }

    let mut by_period: BTreeMap<String, f64> = BTreeMap::new();
    for x in &stamped {
        *by_period.entry(x.period.clone()).or_insert(0.0) += x.value;
    }
    if by_period.len() < 2 {
        return None;
    }
    let periods: Vec<&String> = by_period.keys().collect();
    let latest_period = periods[periods.len() - 1].clone();
    let prev_period = periods[periods.len() - 2].clone();
    let latest_value = by_period[&latest_period];
    let prev_value = by_period[&prev_period];
    let delta_abs = latest_value - prev_value;
    let delta_pct = if prev_value != 0.0 {
        Some(delta_abs / prev_value)
    } else {
        None
    };

    stamped.sort_by_key(|x| x.t);
    let min_t = stamped[0].t;
    let max_t = stamped[stamped.len() - 1].t;
    let range_ms = (max_t - min_t).max(1);
    let prev_start = min_t - range_ms;
    let mut current_total = 0.0;
    let mut previous_total = 0.0;
    for x in &stamped {
        if x.t >= min_t && x.t <= max_t {
            current_total += x.value;
        }
        if x.t >= prev_start && x.t < min_t {
            previous_total += x.value;
        }
    }
    let range_delta = current_total - previous_total;
    let range_pct = if previous_total != 0.0 {
        Some(range_delta / previous_total)
    } else {
        None
    };

    let mut top_contributor = None;
    if let Some(dim) = contributor_dims.first() {
        let mut groups: BTreeMap<String, f64> = BTreeMap::new();
        for x in &stamped {
            if x.period != latest_period {
                continue;
            }
            *groups.entry(key_of(x.row, dim)).or_insert(0.0) += x.value;
        }
        let mut group_rows: Vec<KeyValue> = groups
            .into_iter()
            .map(|(key, value)| KeyValue { key, value })
            .collect();
        group_rows.sort_by(|a, b| b.value.total_cmp(&a.value).then_with(|| a.key.cmp(&b.key)));
        let total: f64 = group_rows.iter().map(|r| r.value).sum();
        if let Some(top) = group_rows.first() {
            top_contributor = Some(TopContributor {
                dimension: dim.clone(),
                group: top.key.clone(),
                value: top.value,
                share: if total != 0.0 { top.value / total } else { 0.0 },
            });
        }
    }

    Some(ExecutiveKpis {
        time_column: time_column.to_string(),
        grain,
        measure: measure.to_string(),
        latest: PeriodValue {
            period: latest_period,
            value: latest_value,
        },
        previous: PeriodValue {
            period: prev_period,
            value: prev_value,
        },
        change: Change {
            abs: delta_abs,
            pct: delta_pct,
        },
        range_compare: RangeCompare {
            current: RangeTotal {
                from: millis_to_day(min_t),
                to: millis_to_day(max_t),
                total: current_total,
            },
            previous: RangeTotal {
                from: millis_to_day(prev_start),
                to: millis_to_day(min_t),
                total: previous_total,
            },
            change: Change {
                abs: range_delta,
                pct: range_pct,
            },
        },
        top_contributor,
    })
}

/// Z-score anomaly marks on a trend series' first differences.
fn simple_anomaly_detection(series: &[TrendBucket]) -> Vec<String> {
    if series.len() < 4 {
        return Vec::new();
    }
    let vals: Vec<f64> = series
        .iter()
        .map(|s| s.sum.unwrap_or(s.count as f64))
        .collect();
    let diffs: Vec<f64> = vals.windows(2).map(|w| w[1] - w[0]).collect();
    if diffs.len() < 2 {
        return Vec::new();
    }
    let mean = diffs.iter().sum::<f64>() / diffs.len() as f64;
    let variance = diffs.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / diffs.len() as f64;
    let std = variance.sqrt().max(1e-9);
    let mut out = Vec::new();
    for (i, d) in diffs.iter().enumerate() {
        if (d - mean).abs() > ANOMALY_Z_THRESHOLD * std {
            out.push(series[i + 1].t.clone());
        }
    }
    out
}

fn looks_like_us_state_keys(rows: &[KeyValue]) -> bool {
    let keys: Vec<&str> = rows.iter().take(10).map(|r| r.key.trim()).collect();
    if keys.is_empty() {
        return false;
    }
    let matches = keys
        .iter()
        .filter(|k| k.len() == 2 && k.chars().all(|c| c.is_ascii_alphabetic()))
        .count();
    matches >= 3.min(keys.len())
}

#[derive(Default)]
struct GroupAccum {
    count: usize,
    sum: f64,
    non_null: usize,
}

fn group_rows(rows: &[Row], dimension: &str, measure: Option<&str>) -> BTreeMap<String, GroupAccum> {
    let mut groups: BTreeMap<String, GroupAccum> = BTreeMap::new();
    for row in rows {
        let entry = groups.entry(key_of(row, dimension)).or_default();
        entry.count += 1;
        if let Some(m) = measure {
            if let Some(n) = row.get(m).and_then(parse_number) {
                entry.sum += n;
                entry.non_null += 1;
            }
        }
    }
    groups
}

fn group_value(g: &GroupAccum, agg: Aggregation) -> f64 {
    match agg {
        Aggregation::Count => g.count as f64,
        Aggregation::Sum => g.sum,
        Aggregation::Avg => {
            if g.non_null > 0 {
                g.sum / g.non_null as f64
            } else {
                0.0
            }
        }
    }
}

/// Fallback plan when a caller hands the executor an empty block list: the
/// broadest applicable analyses over detected columns.
fn default_plan(cols: &DetectedColumns) -> Vec<PlanBlock> {
    let time = cols.date.first().cloned();
    let measure = cols.numeric.first().cloned();
    let dimension = cols
        .geo
        .iter()
        .find(|c| region_re().is_match(c))
        .cloned()
        .or_else(|| cols.string_cols.first().cloned());

    let agg = if measure.is_some() {
        Aggregation::Sum
    } else {
        Aggregation::Count
    };
    let mut blocks = vec![PlanBlock::Kpi];
    if let Some(time) = time {
        blocks.push(PlanBlock::Trend {
            time_column: time,
            grain: TimeGrain::Day,
            measure: measure.clone(),
            agg,
        });
    }
    if let Some(dimension) = dimension {
        blocks.push(PlanBlock::TopN {
            dimension,
            measure: measure.clone(),
            agg: Some(agg),
            limit: Some(10),
            include_other: true,
        });
    }
    if let Some(m) = &measure {
        blocks.push(PlanBlock::Distribution {
            measure: m.clone(),
            bins: Some(10),
        });
    }
    blocks.push(PlanBlock::Geo {
        geo_mode: None,
        lat_column: None,
        lon_column: None,
        region_column: None,
        measure: None,
        agg: Aggregation::Sum,
    });
    blocks.push(PlanBlock::DataQuality);
    blocks.push(PlanBlock::DetailsTable {
        preview_rows: Some(50),
    });
    blocks
}

struct Executor<'a> {
    dataset: &'a CanonicalDataset,
    graph: &'a SemanticGraph,
    config: &'a EngineConfig,
    rows: &'a [Row],
    rows_all: &'a [Row],
    sample_size: usize,
    cols: DetectedColumns,
    selections: Option<&'a PlanSelections>,
    default_badges: Vec<Badge>,
}

impl<'a> Executor<'a> {
    fn base_assumptions(&self) -> Vec<String> {
        vec![format!(
            "Computed from first {} rows (maxComputeRows={}).",
            self.sample_size, self.config.max_compute_rows
        )]
    }

    fn penalty(&self) -> Option<f64> {
        self.selections.map(|s| s.data_quality_penalty)
    }

    fn fallback_measure(&self) -> Option<String> {
        pick_top_measures(self.rows, &self.cols.numeric, 1)
            .into_iter()
            .next()
    }

    fn kpi(&self, idx: usize) -> InsightBlock {
        let primary_measure = self
            .selections
            .and_then(|s| s.primary_measure.clone())
            .or_else(|| self.graph.primary_measure.clone())
            .or_else(|| self.fallback_measure());
        let top_measures = pick_top_measures(self.rows, &self.cols.numeric, 5);
        let time_col = self
            .selections
            .and_then(|s| s.time_column.clone())
            .or_else(|| self.cols.date.first().cloned());
        let grain = self.selections.map(|s| s.grain).unwrap_or(TimeGrain::Day);
        let contributor_dims: Vec<String> = self
            .selections
            .map(|s| {
                s.top_dims
                    .iter()
                    .filter(|d| contributor_re().is_match(d))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let exec = match (&time_col, &primary_measure) {
            (Some(t), Some(m)) => {
                compute_executive_time_kpis(self.rows, t, grain, m, &contributor_dims)
            }
            _ => None,
        };
        let yoy = match (&time_col, &primary_measure) {
            (Some(t), Some(m)) => compute_latest_and_yoy(self.rows, t, m),
            _ => None,
        };

        let row_count = if self.dataset.metadata.row_count > 0 {
            self.dataset.metadata.row_count
        } else {
            self.rows_all.len()
        };
        let status = if self.rows_all.is_empty() {
            BlockStatus::InsufficientData
        } else {
            BlockStatus::Ok
        };
        let coverage = time_col
            .as_deref()
            .and_then(|t| compute_time_coverage(self.rows, t));
        let badges = compute_badges(self.sample_size, coverage.as_ref(), self.penalty());

        let mut narrative_parts = Vec::new();
        if let Some(exec) = &exec {
            narrative_parts.push(format!(
                "Latest {} ({}) in {}: {} (Δ {}, {} vs {}).",
                exec.measure,
                exec.grain.as_str(),
                exec.latest.period,
                format_number_short(exec.latest.value),
                format_number_short(exec.change.abs),
                format_pct(exec.change.pct),
                exec.previous.period
            ));
            if let Some(top) = &exec.top_contributor {
                narrative_parts.push(format!(
                    "Top {}: {} ({} of latest period).",
                    top.dimension,
                    top.group,
                    format_pct(Some(top.share))
                ));
            }
        }
        let block_narrative = if narrative_parts.is_empty() {
            "Key metrics computed from the available data.".to_string()
        } else {
            narrative_parts.join(" ")
        };

        let mut assumptions = self.base_assumptions();
        assumptions.push("Top metrics selected by variance + fill rate.".to_string());
        if exec.is_some() {
            assumptions.push("Executive KPIs computed per chosen time grain.".to_string());
        }
        if yoy.is_some() {
            assumptions.push("YoY computed on year-like time column.".to_string());
        }

        InsightBlock {
            id: build_id("kpi", idx, None),
            block_type: "KPIBlock".to_string(),
            title: "Key metrics".to_string(),
            question_answered: "What are the headline stats and key numeric measures?".to_string(),
            status,
            confidence: if status == BlockStatus::Ok { 0.85 } else { 0.1 },
            assumptions,
            sample_size: self.sample_size,
            badges,
            block_narrative: Some(block_narrative),
            payload: BlockPayload::Kpi(KpiPayload {
                row_count,
                primary_measure: primary_measure.clone(),
                metric_summaries: top_measures
                    .into_iter()
                    .map(|m| MetricSummary {
                        summary: compute_numeric_summary(self.rows, &m),
                        name: m,
                    })
                    .collect(),
                executive_kpis: exec,
                time_kpis: yoy,
            }),
        }
    }

    fn trend(
        &self,
        idx: usize,
        time_column: &str,
        grain: TimeGrain,
        measure: Option<&str>,
        agg: Aggregation,
    ) -> InsightBlock {
        if time_column.is_empty() {
            return self.not_applicable(
                build_id("trend", idx, None),
                "TrendBlock",
                "Trend over time",
                "How does activity change over time?",
                "No time column detected.",
                Some("No time column was detected, so a trend cannot be computed.".to_string()),
            );
        }
        let fallback;
        let measure = match measure {
            Some(m) => Some(m),
            None => {
                fallback = self.fallback_measure();
                fallback.as_deref()
            }
        };
        let agg = if measure.is_none() { Aggregation::Count } else { agg };

        let mut buckets: BTreeMap<String, (usize, Option<f64>)> = BTreeMap::new();
        let mut parsed = 0usize;
        for row in self.rows {
            let Some(dt) = row.get(time_column).and_then(|v| parse_date_value(v)) else {
                continue;
            };
            parsed += 1;
            let key = grain_bucket_key(dt, grain);
            // Summed buckets start at 0 so sparse buckets serialize 0, not null.
            let init = if agg == Aggregation::Sum && measure.is_some() {
                Some(0.0)
            } else {
                None
            };
            let entry = buckets.entry(key).or_insert((0, init));
            entry.0 += 1;
            if agg == Aggregation::Sum {
                if let Some(m) = measure {
                    if let Some(n) = row.get(m).and_then(parse_number) {
                        *entry.1.get_or_insert(0.0) += n;
                    }
                }
            }
        }
        let series: Vec<TrendBucket> = buckets
            .into_iter()
            .map(|(t, (count, sum))| TrendBucket { t, count, sum })
            .collect();

        let status = if series.is_empty() {
            BlockStatus::InsufficientData
        } else {
            BlockStatus::Ok
        };
        let confidence = if status == BlockStatus::Ok {
            clamp01(0.7 + (parsed as f64 / self.sample_size.max(1) as f64 * 0.3).min(0.25))
        } else {
            0.1
        };
        let coverage = compute_time_coverage(self.rows, time_column);
        let badges = compute_badges(self.sample_size, coverage.as_ref(), self.penalty());

        let bucket_value = |b: &TrendBucket| -> f64 {
            if agg == Aggregation::Count {
                b.count as f64
            } else {
                b.sum.unwrap_or(0.0)
            }
        };
        let block_narrative = match (series.first(), series.last()) {
            (Some(first), Some(last)) => {
                let d_abs = bucket_value(last) - bucket_value(first);
                let first_v = bucket_value(first);
                let d_pct = if first_v != 0.0 { Some(d_abs / first_v) } else { None };
                Some(format!(
                    "{}trend is {} {} ({}) from first to last {} bucket.",
                    measure.map(|m| format!("{m} ")).unwrap_or_default(),
                    if d_abs >= 0.0 { "up" } else { "down" },
                    format_number_short(d_abs.abs()),
                    format_pct(d_pct),
                    grain.as_str()
                ))
            }
            _ => Some("Trend computed over the observed time range.".to_string()),
        };

        let mut assumptions = self.base_assumptions();
        assumptions.push(format!("Time column: {time_column}"));
        assumptions.push(format!("Grain: {}", grain.as_str()));
        assumptions.push(match measure {
            Some(m) => format!("Measure: {m} ({})", agg.as_str()),
            None => "Measure: none (count)".to_string(),
        });

        let anomalies = simple_anomaly_detection(&series);
        InsightBlock {
            id: build_id("trend", idx, Some(grain.as_str())),
            block_type: "TrendBlock".to_string(),
            title: format!("Trend by {}", grain.as_str()),
            question_answered: format!("What is the {}-level time trend?", grain.as_str()),
            status,
            confidence,
            assumptions,
            sample_size: self.sample_size,
            badges,
            block_narrative,
            payload: BlockPayload::Trend(TrendPayload {
                time_column: time_column.to_string(),
                grain,
                measure: measure.map(str::to_string),
                agg,
                series,
                anomalies,
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn top_n(
        &self,
        idx: usize,
        is_breakdown: bool,
        dimension: &str,
        measure: Option<&str>,
        agg: Option<Aggregation>,
        limit: Option<usize>,
        include_other: bool,
        max_categories: Option<usize>,
    ) -> InsightBlock {
        let prefix = if is_breakdown { "breakdown" } else { "topn" };
        if dimension.is_empty() {
            return self.not_applicable(
                build_id(prefix, idx, None),
                if is_breakdown { "BreakdownBlock" } else { "TopNBlock" },
                if is_breakdown { "Breakdown" } else { "Top categories" },
                "Which categories contribute the most?",
                "No dimension specified.",
                Some("No dimension column was specified for this breakdown.".to_string()),
            );
        }
        // An explicit aggregation always wins; only an omitted one falls back
        // on sum-with-measure / count-without.
        let agg = agg.unwrap_or(if measure.is_some() {
            Aggregation::Sum
        } else {
            Aggregation::Count
        });
        let limit = limit.unwrap_or(10);
        let max_categories = max_categories.unwrap_or(8);

        let groups = group_rows(self.rows, dimension, measure);
        let category_count = groups.len();

        if is_breakdown && category_count > max_categories {
            // Deterministic re-entry as a top-N request, not a mutation of
            // this block.
            let fallback_plan = [PlanBlock::TopN {
                dimension: dimension.to_string(),
                measure: measure.map(str::to_string),
                agg: Some(agg),
                limit: Some(10),
                include_other: true,
            }];
            let mut fallback = execute_blocks(
                self.dataset,
                self.graph,
                &fallback_plan,
                None,
                self.config,
            )
            .remove(0);
            fallback.id = build_id("topn", idx, Some("breakdown-fallback"));
            fallback.title = "Top categories (fallback)".to_string();
            fallback.assumptions.push(format!(
                "Breakdown fallback: categoryCount={category_count} > {max_categories}"
            ));
            return fallback;
        }

        let scored: Vec<KeyValue> = groups
            .iter()
            .map(|(key, g)| KeyValue {
                key: key.clone(),
                value: group_value(g, agg),
            })
            .collect();
        let top = stable_top_n(scored.clone(), limit.clamp(1, 50));
        let top_set: FxHashSet<&str> = top.iter().map(|t| t.key.as_str()).collect();
        let other_value: f64 = if include_other {
            scored
                .iter()
                .filter(|s| !top_set.contains(s.key.as_str()))
                .map(|s| s.value)
                .sum()
        } else {
            0.0
        };
        let mut rows_out = top;
        if include_other && other_value > 0.0 {
            rows_out.push(KeyValue {
                key: "Other".to_string(),
                value: other_value,
            });
        }

        let status = if self.rows_all.is_empty() {
            BlockStatus::InsufficientData
        } else {
            BlockStatus::Ok
        };
        let shown = limit.min(10);
        let mut assumptions = self.base_assumptions();
        assumptions.push(format!("Dimension: {dimension}"));
        assumptions.push(match measure {
            Some(m) => format!("Measure: {m} ({})", agg.as_str()),
            None => format!("Measure: none ({})", agg.as_str()),
        });
        assumptions.push(format!(
            "Rows: top={shown}{}",
            if include_other { " + Other" } else { "" }
        ));

        InsightBlock {
            id: build_id(prefix, idx, None),
            block_type: if is_breakdown { "BreakdownBlock" } else { "TopNBlock" }.to_string(),
            title: if is_breakdown {
                "Breakdown".to_string()
            } else {
                format!("Top {shown} by {dimension}")
            },
            question_answered: if is_breakdown {
                "How is the total distributed across categories?".to_string()
            } else {
                "Which categories are largest?".to_string()
            },
            status,
            confidence: if status == BlockStatus::Ok { 0.75 } else { 0.1 },
            assumptions,
            sample_size: self.sample_size,
            badges: self.default_badges.clone(),
            block_narrative: None,
            payload: BlockPayload::Grouped(GroupedPayload {
                dimension: dimension.to_string(),
                measure: measure.map(str::to_string),
                agg,
                rows: rows_out,
                category_count: Some(category_count),
            }),
        }
    }

    fn distribution(&self, idx: usize, measure: &str, bins: Option<usize>) -> InsightBlock {
        if measure.is_empty() {
            return self.not_applicable(
                build_id("dist", idx, None),
                "DistributionBlock",
                "Distribution",
                "How are values distributed?",
                "No measure specified.",
                None,
            );
        }
        let mut nums: Vec<f64> = self
            .rows
            .iter()
            .filter_map(|r| r.get(measure).and_then(parse_number))
            .collect();
        nums.sort_by(f64::total_cmp);
        if nums.len() < 3 {
            let mut assumptions = self.base_assumptions();
            assumptions.push(format!("Not enough numeric values for {measure}."));
            return InsightBlock {
                id: build_id("dist", idx, None),
                block_type: "DistributionBlock".to_string(),
                title: format!("Distribution of {measure}"),
                question_answered: format!("How is {measure} distributed?"),
                status: BlockStatus::InsufficientData,
                confidence: 0.1,
                assumptions,
                sample_size: self.sample_size,
                badges: self.default_badges.clone(),
                block_narrative: None,
                payload: BlockPayload::Distribution(DistributionPayload {
                    measure: measure.to_string(),
                    values_count: nums.len(),
                    quantiles: None,
                    histogram: Vec::new(),
                }),
            };
        }

        let bins = bins.unwrap_or(10).clamp(3, 30);
        let min = nums[0];
        let max = nums[nums.len() - 1];
        let width = if max == min { 1.0 } else { (max - min) / bins as f64 };
        let mut histogram: Vec<HistogramBin> = (0..bins)
            .map(|j| HistogramBin {
                bin: j,
                from: min + j as f64 * width,
                to: if j == bins - 1 {
                    max
                } else {
                    min + (j + 1) as f64 * width
                },
                count: 0,
            })
            .collect();
        for n in &nums {
            let idx = if max == min {
                0
            } else {
                (((n - min) / width).floor() as usize).min(bins - 1)
            };
            histogram[idx].count += 1;
        }

        let mut assumptions = self.base_assumptions();
        assumptions.push(format!("Bins={bins}"));
        InsightBlock {
            id: build_id("dist", idx, Some(measure)),
            block_type: "DistributionBlock".to_string(),
            title: format!("Distribution of {measure}"),
            question_answered: format!("What is the distribution of {measure}?"),
            status: BlockStatus::Ok,
            confidence: 0.75,
            assumptions,
            sample_size: self.sample_size,
            badges: self.default_badges.clone(),
            block_narrative: None,
            payload: BlockPayload::Distribution(DistributionPayload {
                measure: measure.to_string(),
                values_count: nums.len(),
                quantiles: Some(Quantiles {
                    p10: quantile(&nums, 0.10),
                    p25: quantile(&nums, 0.25),
                    p50: quantile(&nums, 0.50),
                    p75: quantile(&nums, 0.75),
                    p90: quantile(&nums, 0.90),
                }),
                histogram,
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn geo(
        &self,
        idx: usize,
        geo_mode: Option<GeoMode>,
        lat_column: Option<&str>,
        lon_column: Option<&str>,
        region_column: Option<&str>,
        measure: Option<&str>,
        agg: Aggregation,
    ) -> InsightBlock {
        let lat = lat_column
            .map(str::to_string)
            .or_else(|| self.cols.geo.iter().find(|c| lat_re().is_match(c)).cloned());
        let lon = lon_column
            .map(str::to_string)
            .or_else(|| self.cols.geo.iter().find(|c| lon_re().is_match(c)).cloned());
        let region = region_column
            .map(str::to_string)
            .or_else(|| self.cols.geo.iter().find(|c| region_re().is_match(c)).cloned());
        let fallback;
        let measure = match measure {
            Some(m) => Some(m),
            None => {
                fallback = self.fallback_measure();
                fallback.as_deref()
            }
        };
        let agg = if measure.is_none() { Aggregation::Count } else { agg };

        // An explicit mode wins; otherwise points when a lat/lon pair
        // resolved. Point mode still needs both columns to exist.
        let geo_mode = geo_mode.unwrap_or(if lat.is_some() && lon.is_some() {
            GeoMode::Points
        } else {
            GeoMode::Region
        });
        let point_cols = match (geo_mode, &lat, &lon) {
            (GeoMode::Points, Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        };
        if let Some((lat, lon)) = point_cols {
            let mut points = Vec::new();
            for row in self.rows {
                let Some(la) = row.get(lat).and_then(parse_number) else { continue };
                let Some(lo) = row.get(lon).and_then(parse_number) else { continue };
                if !(-90.0..=90.0).contains(&la) || !(-180.0..=180.0).contains(&lo) {
                    continue;
                }
                let weight = measure.and_then(|m| row.get(m).and_then(parse_number));
                points.push(GeoPoint {
                    lat: la,
                    lon: lo,
                    weight,
                });
                if points.len() >= GEO_POINT_CAP {
                    break;
                }
            }
            let status = if points.is_empty() {
                BlockStatus::NotApplicable
            } else {
                BlockStatus::Ok
            };
            let mut assumptions = self.base_assumptions();
            assumptions.push(format!("lat={lat}"));
            assumptions.push(format!("lon={lon}"));
            assumptions.push(match measure {
                Some(m) => format!("weight={m}"),
                None => "weight=none".to_string(),
            });
            return InsightBlock {
                id: build_id("geo", idx, Some("points")),
                block_type: "GeoBlock".to_string(),
                title: "Geo points".to_string(),
                question_answered: "Where are records located (points)?".to_string(),
                status,
                confidence: if status == BlockStatus::Ok { 0.8 } else { 0.0 },
                assumptions,
                sample_size: self.sample_size,
                badges: self.default_badges.clone(),
                block_narrative: None,
                payload: BlockPayload::GeoPoints(GeoPointsPayload {
                    mode: "points",
                    lat_column: lat.clone(),
                    lon_column: lon.clone(),
                    measure: measure.map(str::to_string),
                    agg,
                    points,
                }),
            };
        }

        let Some(region) = region else {
            return self.not_applicable(
                build_id("geo", idx, None),
                "GeoBlock",
                "Geo",
                "What is the geographic distribution?",
                "No geo columns detected.",
                None,
            );
        };

        let groups = group_rows(self.rows, &region, measure);
        let scored: Vec<KeyValue> = groups
            .iter()
            .map(|(key, g)| KeyValue {
                key: key.clone(),
                value: if agg == Aggregation::Count {
                    g.count as f64
                } else {
                    g.sum
                },
            })
            .collect();
        let top = stable_top_n(scored, GEO_REGION_LIMIT);
        let status = if self.rows_all.is_empty() {
            BlockStatus::InsufficientData
        } else {
            BlockStatus::Ok
        };
        let mut assumptions = self.base_assumptions();
        assumptions.push(format!("region={region}"));
        assumptions.push(match measure {
            Some(m) => format!("measure={m} ({})", agg.as_str()),
            None => format!("measure=none ({})", agg.as_str()),
        });
        let geo_subtype = if looks_like_us_state_keys(&top) {
            Some("us_state")
        } else {
            None
        };
        InsightBlock {
            id: build_id("geo", idx, Some("region")),
            block_type: "GeoBlock".to_string(),
            title: format!("Geo by {region}"),
            question_answered: format!("How does activity vary by {region}?"),
            status,
            confidence: if status == BlockStatus::Ok { 0.7 } else { 0.1 },
            assumptions,
            sample_size: self.sample_size,
            badges: self.default_badges.clone(),
            block_narrative: None,
            payload: BlockPayload::GeoRegion(GeoRegionPayload {
                mode: "region",
                region_column: region,
                measure: measure.map(str::to_string),
                agg,
                rows: top,
                geo_subtype,
            }),
        }
    }

    fn geo_like(
        &self,
        idx: usize,
        dimension: &str,
        measure: Option<&str>,
        agg: Aggregation,
        limit: Option<usize>,
    ) -> InsightBlock {
        if dimension.is_empty() {
            return self.not_applicable(
                build_id("geolike", idx, None),
                "GeoLikeBlock",
                "Geo-like breakdown",
                "How does the metric vary by region-like categories?",
                "No dimension specified.",
                Some("No region-like dimension was selected for this dataset.".to_string()),
            );
        }
        let fallback;
        let measure = match measure {
            Some(m) => Some(m),
            None => {
                fallback = self.fallback_measure();
                fallback.as_deref()
            }
        };
        let agg = if measure.is_none() { Aggregation::Count } else { agg };
        let limit = limit.unwrap_or(10).clamp(1, 25);

        let groups = group_rows(self.rows, dimension, measure);
        let scored: Vec<KeyValue> = groups
            .iter()
            .map(|(key, g)| KeyValue {
                key: key.clone(),
                value: if agg == Aggregation::Count {
                    g.count as f64
                } else {
                    g.sum
                },
            })
            .collect();
        let top = stable_top_n(scored, limit);
        let badges = compute_badges(self.sample_size, None, self.penalty());
        let block_narrative = match top.first() {
            Some(best) => format!(
                "Top {dimension}: {} ({}{}).",
                best.key,
                format_number_short(best.value),
                measure.map(|m| format!(" {m}")).unwrap_or_default()
            ),
            None => format!("Not enough data to rank {dimension}."),
        };
        let status = if top.is_empty() {
            BlockStatus::InsufficientData
        } else {
            BlockStatus::Ok
        };
        let mut assumptions = self.base_assumptions();
        assumptions.push(format!("Dimension: {dimension}"));
        assumptions.push(match measure {
            Some(m) => format!("Measure: {m} ({})", agg.as_str()),
            None => format!("Measure: none ({})", agg.as_str()),
        });
        InsightBlock {
            id: build_id("geolike", idx, Some(dimension)),
            block_type: "GeoLikeBlock".to_string(),
            title: format!("By {dimension}"),
            question_answered: format!("Which {dimension} groups are highest?"),
            status,
            confidence: if status == BlockStatus::Ok { 0.7 } else { 0.1 },
            assumptions,
            sample_size: self.sample_size,
            badges,
            block_narrative: Some(block_narrative),
            payload: BlockPayload::Grouped(GroupedPayload {
                dimension: dimension.to_string(),
                measure: measure.map(str::to_string),
                agg,
                rows: top,
                category_count: None,
            }),
        }
    }

    fn driver(
        &self,
        idx: usize,
        measure: &str,
        dimensions: &[String],
        limit: Option<usize>,
    ) -> InsightBlock {
        let fallback;
        let measure = if measure.is_empty() {
            fallback = self.fallback_measure();
            fallback.as_deref()
        } else {
            Some(measure)
        };
        let Some(measure) = measure else {
            return self.not_applicable(
                build_id("drivers", idx, None),
                "DriverBlock",
                "Drivers",
                "What are the top drivers?",
                "No numeric measure available.",
                Some("No numeric measure was available to compute drivers.".to_string()),
            );
        };
        let dims: Vec<String> = if dimensions.is_empty() {
            self.cols
                .string_cols
                .iter()
                .filter(|n| contributor_re().is_match(n))
                .take(3)
                .cloned()
                .collect()
        } else {
            dimensions.to_vec()
        };
        let limit = limit.unwrap_or(12).clamp(5, 30);

        let mut overall_total = 0.0;
        let mut overall_count = 0usize;
        for row in self.rows {
            if let Some(n) = row.get(measure).and_then(parse_number) {
                overall_total += n;
                overall_count += 1;
            }
        }
        let overall_avg = if overall_count > 0 {
            overall_total / overall_count as f64
        } else {
            0.0
        };

        let mut drivers: Vec<DriverRow> = Vec::new();
        for dim in &dims {
            let groups = group_rows(self.rows, dim, Some(measure));
            let total_all: f64 = groups.values().map(|g| g.sum).sum();
            for (key, g) in &groups {
                if g.non_null == 0 {
                    continue;
                }
                let share = if total_all != 0.0 { g.sum / total_all } else { 0.0 };
                let avg = g.sum / g.non_null as f64;
                let lift = if overall_avg != 0.0 {
                    avg / overall_avg - 1.0
                } else {
                    0.0
                };
                let score = share * lift.abs().min(5.0) * (1.0 + g.non_null as f64).ln();
                drivers.push(DriverRow {
                    dimension: dim.clone(),
                    group: key.clone(),
                    total: g.sum,
                    share,
                    avg,
                    lift,
                    count: g.non_null,
                    score,
                });
            }
        }
        drivers.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.dimension.cmp(&b.dimension))
                .then_with(|| a.group.cmp(&b.group))
        });
        drivers.truncate(limit);

        let confidence = clamp01(
            0.55 + (overall_count as f64 / self.sample_size.max(1) as f64 * 0.4).min(0.35),
        );
        let badges = compute_badges(self.sample_size, None, self.penalty());
        let block_narrative = match drivers.first() {
            Some(best) => format!(
                "Top driver: {} ({}) with {} share and lift {} vs overall average.",
                best.group,
                best.dimension,
                format_pct(Some(best.share)),
                format_pct(Some(best.lift))
            ),
            None => "No drivers could be computed from the available data.".to_string(),
        };
        let status = if drivers.is_empty() {
            BlockStatus::InsufficientData
        } else {
            BlockStatus::Ok
        };
        let mut assumptions = self.base_assumptions();
        assumptions.push(format!("Measure={measure}"));
        assumptions
            .push("Score=share * |lift| * log(count+1). Lift vs overall average.".to_string());

        InsightBlock {
            id: build_id("drivers", idx, Some(measure)),
            block_type: "DriverBlock".to_string(),
            title: "Top drivers".to_string(),
            question_answered: format!("Which groups drive {measure} (share + lift)?"),
            status,
            confidence: if status == BlockStatus::Ok { confidence } else { 0.1 },
            assumptions,
            sample_size: self.sample_size,
            badges,
            block_narrative: Some(block_narrative),
            payload: BlockPayload::Driver(DriverPayload {
                measure: measure.to_string(),
                overall: DriverOverall {
                    total: overall_total,
                    avg: overall_avg,
                    count: overall_count,
                },
                top_drivers: drivers,
            }),
        }
    }

    fn compare_periods(
        &self,
        idx: usize,
        time_column: &str,
        measure: &str,
        dimensions: &[String],
        limit: Option<usize>,
    ) -> InsightBlock {
        let time_col = if time_column.is_empty() {
            self.cols.date.first().cloned()
        } else {
            Some(time_column.to_string())
        };
        let measure = if measure.is_empty() {
            self.fallback_measure()
        } else {
            Some(measure.to_string())
        };
        let (Some(time_col), Some(measure)) = (time_col, measure) else {
            let missing_time = time_column.is_empty() && self.cols.date.is_empty();
            let reason = if missing_time {
                "No time column."
            } else {
                "No measure column."
            };
            return self.not_applicable(
                build_id("compare", idx, None),
                "ComparePeriodsBlock",
                "Compare periods",
                "How did the metric change between periods?",
                reason,
                Some(if missing_time {
                    "No time column was available to compare periods.".to_string()
                } else {
                    "No measure column was available to compare periods.".to_string()
                }),
            );
        };
        let dims: Vec<String> = if dimensions.is_empty() {
            self.cols
                .string_cols
                .iter()
                .filter(|n| compare_dim_re().is_match(n))
                .take(2)
                .cloned()
                .collect()
        } else {
            dimensions.to_vec()
        };
        let limit = limit.unwrap_or(15).clamp(5, 30);

        let mut stamped: Vec<(i64, &Row)> = Vec::new();
        for row in self.rows {
            let Some(dt) = row.get(&time_col).and_then(|v| parse_date_value(v)) else {
                continue;
            };
            if row.get(&measure).and_then(parse_number).is_none() {
                continue;
            }
            stamped.push((millis(dt), row));
        }
        stamped.sort_by_key(|x| x.0);

        let insufficient = |reason: &str, assumption: &str, narrative: &str| {
            let mut assumptions = self.base_assumptions();
            assumptions.push(assumption.to_string());
            InsightBlock {
                id: build_id("compare", idx, None),
                block_type: "ComparePeriodsBlock".to_string(),
                title: "Compare periods".to_string(),
                question_answered: "How did the metric change between periods?".to_string(),
                status: BlockStatus::InsufficientData,
                confidence: 0.1,
                assumptions,
                sample_size: self.sample_size,
                badges: self.default_badges.clone(),
                block_narrative: Some(narrative.to_string()),
                payload: BlockPayload::CompareUnavailable(CompareUnavailablePayload {
                    time_column: time_col.clone(),
                    measure: measure.clone(),
                    reason: reason.to_string(),
                }),
            }
        };
        if stamped.len() < 6 {
            return insufficient(
                "Not enough rows",
                "Not enough time+measure rows.",
                "Not enough time-stamped rows to compare periods.",
            );
        }
        let min_t = stamped[0].0;
        let max_t = stamped[stamped.len() - 1].0;
        let mid = min_t + (max_t - min_t) / 2;
        let first: Vec<&(i64, &Row)> = stamped.iter().filter(|x| x.0 <= mid).collect();
        let second: Vec<&(i64, &Row)> = stamped.iter().filter(|x| x.0 > mid).collect();
        if first.len() < 2 || second.len() < 2 {
            return insufficient(
                "Cannot split periods",
                "Could not split into two non-empty halves.",
                "Could not split the observed time range into two comparable periods.",
            );
        }

        let sum_of = |half: &[&(i64, &Row)]| -> f64 {
            half.iter()
                .map(|(_, r)| r.get(&measure).and_then(parse_number).unwrap_or(0.0))
                .sum()
        };
        let total_first = sum_of(&first);
        let total_second = sum_of(&second);
        let delta = total_second - total_first;

        let mut contributions: BTreeMap<String, Vec<ContributionRow>> = BTreeMap::new();
        for dim in &dims {
            let mut map: BTreeMap<String, (f64, f64)> = BTreeMap::new();
            for (_, row) in first.iter().map(|x| **x) {
                let n = row.get(&measure).and_then(parse_number).unwrap_or(0.0);
                map.entry(key_of(row, dim)).or_insert((0.0, 0.0)).0 += n;
            }
            for (_, row) in second.iter().map(|x| **x) {
                let n = row.get(&measure).and_then(parse_number).unwrap_or(0.0);
                map.entry(key_of(row, dim)).or_insert((0.0, 0.0)).1 += n;
            }
            let mut rows_out: Vec<ContributionRow> = map
                .into_iter()
                .map(|(key, (first, second))| ContributionRow {
                    key,
                    first,
                    second,
                    delta: second - first,
                })
                .collect();
            rows_out.sort_by(|a, b| {
                b.delta
                    .abs()
                    .total_cmp(&a.delta.abs())
                    .then_with(|| a.key.cmp(&b.key))
            });
            rows_out.truncate(limit);
            contributions.insert(dim.clone(), rows_out);
        }

        let coverage = compute_time_coverage(self.rows, &time_col);
        let badges = compute_badges(self.sample_size, coverage.as_ref(), self.penalty());

        let mut biggest: Option<(&str, &ContributionRow)> = None;
        for (dim, rows) in &contributions {
            let Some(cand) = rows.first() else { continue };
            let replace = match &biggest {
                None => true,
                Some((_, cur)) => {
                    cand.delta.abs() > cur.delta.abs()
                        || (cand.delta.abs() == cur.delta.abs() && cand.key < cur.key)
                }
            };
            if replace {
                biggest = Some((dim.as_str(), cand));
            }
        }
        let mut block_narrative = format!(
            "Second period {} by {} {measure} vs first period.",
            if delta >= 0.0 { "increased" } else { "decreased" },
            format_number_short(delta)
        );
        if let Some((dim, cand)) = biggest {
            block_narrative.push_str(&format!(
                " Biggest contributor: {} ({dim}) at {}.",
                cand.key,
                format_number_short(cand.delta)
            ));
        }

        let mut assumptions = self.base_assumptions();
        assumptions
            .push("Periods split by midpoint of observed time range (after filters).".to_string());
        InsightBlock {
            id: build_id("compare", idx, Some(&measure)),
            block_type: "ComparePeriodsBlock".to_string(),
            title: "Compare periods".to_string(),
            question_answered: format!(
                "What changed between the first half vs second half for {measure}?"
            ),
            status: BlockStatus::Ok,
            confidence: 0.75,
            assumptions,
            sample_size: self.sample_size,
            badges,
            block_narrative: Some(block_narrative),
            payload: BlockPayload::Compare(ComparePayload {
                time_column: time_col,
                measure,
                period_a: ComparePeriod {
                    from: millis_to_iso(min_t),
                    to: millis_to_iso(mid),
                    total: total_first,
                },
                period_b: ComparePeriod {
                    from: millis_to_iso(mid + 1),
                    to: millis_to_iso(max_t),
                    total: total_second,
                },
                delta,
                pct: if total_first != 0.0 {
                    Some(delta / total_first)
                } else {
                    None
                },
                contributions,
            }),
        }
    }

    fn anomaly(&self, idx: usize, enabled: bool) -> InsightBlock {
        // Intentional stub: detection is out of contract for now.
        let mut assumptions = self.base_assumptions();
        assumptions.push(
            if enabled {
                "Anomaly detection not implemented in MVP."
            } else {
                "Disabled."
            }
            .to_string(),
        );
        InsightBlock {
            id: build_id("anomaly", idx, None),
            block_type: "AnomalyBlock".to_string(),
            title: "Anomalies".to_string(),
            question_answered: "Are there anomalies?".to_string(),
            status: if enabled {
                BlockStatus::InsufficientData
            } else {
                BlockStatus::NotApplicable
            },
            confidence: 0.0,
            assumptions,
            sample_size: self.sample_size,
            badges: self.default_badges.clone(),
            block_narrative: Some(
                if enabled {
                    "Anomaly detection is not implemented in this deterministic MVP."
                } else {
                    "Anomaly block is disabled for this run."
                }
                .to_string(),
            ),
            payload: BlockPayload::Empty(EmptyPayload {
                reason: if enabled { "Not implemented" } else { "Disabled" }.to_string(),
            }),
        }
    }

    fn data_quality(&self, idx: usize) -> InsightBlock {
        if self.rows_all.is_empty() {
            return InsightBlock {
                id: build_id("quality", idx, None),
                block_type: "DataQualityBlock".to_string(),
                title: "Data quality".to_string(),
                question_answered: "Are there data quality issues?".to_string(),
                status: BlockStatus::InsufficientData,
                confidence: 0.1,
                assumptions: self.base_assumptions(),
                sample_size: self.sample_size,
                badges: self.default_badges.clone(),
                block_narrative: None,
                payload: BlockPayload::Empty(EmptyPayload {
                    reason: "No rows".to_string(),
                }),
            };
        }

        let mut missingness: Vec<ColumnMissingness> = self
            .cols
            .schema_names
            .iter()
            .map(|name| {
                let nulls = self
                    .rows
                    .iter()
                    .filter(|r| r.get(name).map_or(true, is_null_like))
                    .count();
                ColumnMissingness {
                    column: name.clone(),
                    null_pct: nulls as f64 / self.rows.len().max(1) as f64,
                }
            })
            .collect();
        missingness.sort_by(|a, b| {
            b.null_pct
                .total_cmp(&a.null_pct)
                .then_with(|| a.column.cmp(&b.column))
        });

        let mut seen: FxHashSet<u64> = FxHashSet::default();
        let dup = self
            .rows
            .iter()
            .filter(|r| !seen.insert(row_digest(r)))
            .count();
        let duplicates_pct = dup as f64 / self.rows.len().max(1) as f64;

        let mut parse_issues: Vec<ParseIssue> = Vec::new();
        for t in &self.cols.date {
            let mut failed = 0usize;
            let mut checked = 0usize;
            for row in self.rows {
                let Some(v) = row.get(t).filter(|v| !is_null_like(v)) else { continue };
                checked += 1;
                if parse_date_value(v).is_none() {
                    failed += 1;
                }
                if checked >= QUALITY_PROBE_CAP {
                    break;
                }
            }
            if failed > 0 {
                parse_issues.push(ParseIssue {
                    column: t.clone(),
                    kind: ParseIssueKind::DateParseFailed,
                    count: failed,
                    hint: None,
                });
            }
        }
        for m in &self.cols.numeric {
            let mut failed = 0usize;
            let mut checked = 0usize;
            for row in self.rows {
                let Some(v) = row.get(m).filter(|v| !is_null_like(v)) else { continue };
                checked += 1;
                if parse_number(v).is_none() {
                    failed += 1;
                }
                if checked >= QUALITY_PROBE_CAP {
                    break;
                }
            }
            if failed > 0 {
                parse_issues.push(ParseIssue {
                    column: m.clone(),
                    kind: ParseIssueKind::NumberParseFailed,
                    count: failed,
                    hint: None,
                });
            }
        }
        for g in &self.cols.geo {
            let is_lat = lat_re().is_match(g);
            let is_lon = !is_lat && lon_re().is_match(g);
            if !is_lat && !is_lon {
                continue;
            }
            let mut bad = 0usize;
            let mut checked = 0usize;
            for row in self.rows {
                let Some(v) = row.get(g).and_then(parse_number) else { continue };
                checked += 1;
                if is_lat && !(-90.0..=90.0).contains(&v) {
                    bad += 1;
                }
                if is_lon && !(-180.0..=180.0).contains(&v) {
                    bad += 1;
                }
                if checked >= QUALITY_PROBE_CAP {
                    break;
                }
            }
            if bad > 0 {
                parse_issues.push(ParseIssue {
                    column: g.clone(),
                    kind: ParseIssueKind::GeoOutOfRange,
                    count: bad,
                    hint: None,
                });
            }
        }
        parse_issues.sort_by(|a, b| {
            format!("{}{:?}", a.column, a.kind).cmp(&format!("{}{:?}", b.column, b.kind))
        });

        let mut assumptions = self.base_assumptions();
        assumptions.push("Duplicates computed by full-row equality (stringified).".to_string());
        InsightBlock {
            id: build_id("quality", idx, None),
            block_type: "DataQualityBlock".to_string(),
            title: "Data quality".to_string(),
            question_answered: "Are there missing values, duplicates, or parse errors?".to_string(),
            status: BlockStatus::Ok,
            confidence: 0.8,
            assumptions,
            sample_size: self.sample_size,
            badges: self.default_badges.clone(),
            block_narrative: None,
            payload: BlockPayload::Quality(QualityPayload {
                duplicates_pct: clamp01(duplicates_pct),
                missingness,
                parse_issues,
            }),
        }
    }

    fn details_table(&self, idx: usize, preview_rows: Option<usize>) -> InsightBlock {
        let preview = preview_rows.unwrap_or(50).clamp(1, 200);
        let column_order = self.cols.schema_names.clone();
        let search_keys: Vec<String> = column_order
            .iter()
            .filter(|c| search_key_re().is_match(c))
            .take(SEARCH_KEY_LIMIT)
            .cloned()
            .collect();
        // Preview comes from the untruncated dataset, not the compute slice.
        let rows = self.rows_all[..self.rows_all.len().min(preview)].to_vec();
        let status = if self.rows_all.is_empty() {
            BlockStatus::InsufficientData
        } else {
            BlockStatus::Ok
        };
        let mut assumptions = self.base_assumptions();
        assumptions.push(format!("Preview rows={preview}"));
        InsightBlock {
            id: build_id("table", idx, None),
            block_type: "DetailsTableBlock".to_string(),
            title: "Row details".to_string(),
            question_answered: "What do the raw rows look like (preview)?".to_string(),
            status,
            confidence: if status == BlockStatus::Ok { 0.9 } else { 0.1 },
            assumptions,
            sample_size: self.sample_size,
            badges: self.default_badges.clone(),
            block_narrative: None,
            payload: BlockPayload::Details(DetailsPayload {
                column_order,
                search_keys,
                rows,
            }),
        }
    }

    fn unknown(&self, idx: usize) -> InsightBlock {
        let mut assumptions = self.base_assumptions();
        assumptions.push("Unsupported block type.".to_string());
        InsightBlock {
            id: build_id("unknown", idx, None),
            block_type: "UnknownBlock".to_string(),
            title: "Unsupported block".to_string(),
            question_answered: String::new(),
            status: BlockStatus::NotApplicable,
            confidence: 0.0,
            assumptions,
            sample_size: self.sample_size,
            badges: Vec::new(),
            block_narrative: None,
            payload: BlockPayload::Empty(EmptyPayload {
                reason: "Unsupported block type".to_string(),
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn not_applicable(
        &self,
        id: String,
        block_type: &str,
        title: &str,
        question: &str,
        assumption: &str,
        narrative: Option<String>,
    ) -> InsightBlock {
        let mut assumptions = self.base_assumptions();
        assumptions.push(assumption.to_string());
        InsightBlock {
            id,
            block_type: block_type.to_string(),
            title: title.to_string(),
            question_answered: question.to_string(),
            status: BlockStatus::NotApplicable,
            confidence: 0.0,
            assumptions,
            sample_size: self.sample_size,
            badges: self.default_badges.clone(),
            block_narrative: narrative,
            payload: BlockPayload::Empty(EmptyPayload {
                reason: assumption.to_string(),
            }),
        }
    }
}

fn execute_blocks(
    dataset: &CanonicalDataset,
    graph: &SemanticGraph,
    blocks: &[PlanBlock],
    selections: Option<&PlanSelections>,
    config: &EngineConfig,
) -> Vec<InsightBlock> {
    let rows_all = dataset.rows.as_slice();
    let rows = &rows_all[..rows_all.len().min(config.max_compute_rows.max(1))];
    let cols = detect_columns(dataset, graph);

    let default_time = selections
        .and_then(|s| s.time_column.clone())
        .or_else(|| cols.date.first().cloned());
    let default_coverage = default_time
        .as_deref()
        .and_then(|t| compute_time_coverage(rows, t));
    let default_badges = compute_badges(
        rows.len(),
        default_coverage.as_ref(),
        selections.map(|s| s.data_quality_penalty),
    );

    let exec = Executor {
        dataset,
        graph,
        config,
        rows,
        rows_all,
        sample_size: rows.len(),
        cols,
        selections,
        default_badges,
    };

    let mut out = Vec::with_capacity(blocks.len());
    for (i, block) in blocks.iter().enumerate() {
        let built = match block {
            PlanBlock::Kpi => exec.kpi(i),
            PlanBlock::Trend {
                time_column,
                grain,
                measure,
                agg,
            } => exec.trend(i, time_column, *grain, measure.as_deref(), *agg),
            PlanBlock::TopN {
                dimension,
                measure,
                agg,
                limit,
                include_other,
            } => exec.top_n(
                i,
                false,
                dimension,
                measure.as_deref(),
                *agg,
                *limit,
                *include_other,
                None,
            ),
            PlanBlock::Breakdown {
                dimension,
                measure,
                agg,
                max_categories,
            } => exec.top_n(
                i,
                true,
                dimension,
                measure.as_deref(),
                *agg,
                None,
                true,
                *max_categories,
            ),
            PlanBlock::Distribution { measure, bins } => exec.distribution(i, measure, *bins),
            PlanBlock::Geo {
                geo_mode,
                lat_column,
                lon_column,
                region_column,
                measure,
                agg,
            } => exec.geo(
                i,
                *geo_mode,
                lat_column.as_deref(),
                lon_column.as_deref(),
                region_column.as_deref(),
                measure.as_deref(),
                *agg,
            ),
            PlanBlock::GeoLike {
                dimension,
                measure,
                agg,
                limit,
            } => exec.geo_like(i, dimension, measure.as_deref(), *agg, *limit),
            PlanBlock::Driver {
                measure,
                dimensions,
                limit,
            } => exec.driver(i, measure, dimensions, *limit),
            PlanBlock::ComparePeriods {
                time_column,
                measure,
                dimensions,
                limit,
            } => exec.compare_periods(i, time_column, measure, dimensions, *limit),
            PlanBlock::Anomaly { enabled } => exec.anomaly(i, *enabled),
            PlanBlock::DataQuality => exec.data_quality(i),
            PlanBlock::DetailsTable { preview_rows } => exec.details_table(i, *preview_rows),
            PlanBlock::Unknown => exec.unknown(i),
        };
        debug_assert!(built.validate().is_ok(), "executor emitted invalid block");
        out.push(built);
    }
    out
}

/// Execute a plan: exactly one block out per plan entry, in plan order. An
/// empty plan falls back to a broad default over detected columns.
///
/// Each emitted block is checked against [`InsightBlock::validate`] via
/// `debug_assert!`; the structural check is a debug-build invariant and is
/// skipped in release builds.
pub fn execute_plan(
    dataset: &CanonicalDataset,
    graph: &SemanticGraph,
    plan: &AnalysisPlan,
    config: &EngineConfig,
) -> Vec<InsightBlock> {
    if plan.blocks.is_empty() {
        let cols = detect_columns(dataset, graph);
        let blocks = default_plan(&cols);
        return execute_blocks(dataset, graph, &blocks, None, config);
    }
    execute_blocks(dataset, graph, &plan.blocks, Some(&plan.selections), config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_are_two_digit_indexed() {
        assert_eq!(build_id("kpi", 0, None), "kpi-01");
        assert_eq!(build_id("topn", 4, Some("breakdown-fallback")), "topn-05-breakdown-fallback");
        assert_eq!(build_id("trend", 11, Some("week")), "trend-12-week");
    }

    #[test]
    fn short_number_formatting() {
        assert_eq!(format_number_short(1_234_567.0), "1.23M");
        assert_eq!(format_number_short(1_500.0), "1.50K");
        assert_eq!(format_number_short(12.345), "12.35");
        assert_eq!(format_number_short(-2_000_000_000.0), "-2.00B");
        assert_eq!(format_number_short(f64::NAN), "—");
        assert_eq!(format_pct(Some(-0.5)), "-50%");
        assert_eq!(format_pct(Some(0.123)), "12.3%");
        assert_eq!(format_pct(None), "—");
    }

    #[test]
    fn anomaly_marks_spike_buckets() {
        let mut series: Vec<TrendBucket> = (0..10)
            .map(|i| TrendBucket {
                t: format!("2024-01-{:02}", i + 1),
                count: 1,
                sum: Some(10.0),
            })
            .collect();
        series[6].sum = Some(500.0);
        let marks = simple_anomaly_detection(&series);
        assert!(marks.contains(&"2024-01-07".to_string()), "{marks:?}");
    }

    #[test]
    fn state_key_heuristic() {
        let rows: Vec<KeyValue> = ["CA", "TX", "NY"]
            .iter()
            .map(|k| KeyValue {
                key: k.to_string(),
                value: 1.0,
            })
            .collect();
        assert!(looks_like_us_state_keys(&rows));
        let rows: Vec<KeyValue> = ["East", "West", "North"]
            .iter()
            .map(|k| KeyValue {
                key: k.to_string(),
                value: 1.0,
            })
            .collect();
        assert!(!looks_like_us_state_keys(&rows));
    }

    #[test]
    fn top_n_tie_breaks_by_key() {
        let items = vec![
            KeyValue { key: "b".into(), value: 5.0 },
            KeyValue { key: "a".into(), value: 5.0 },
            KeyValue { key: "c".into(), value: 9.0 },
        ];
        let top = stable_top_n(items, 2);
        assert_eq!(top[0].key, "c");
        assert_eq!(top[1].key, "a");
    }

    #[test]
    fn year_probe_requires_name_and_values() {
        let rows: Vec<Row> = [2020, 2021, 2022]
            .iter()
            .map(|y| std::collections::BTreeMap::from([("fiscal_year".to_string(), json!(y))]))
            .collect();
        assert!(is_year_time_column("fiscal_year", &rows));
        assert!(!is_year_time_column("amount", &rows));
        let rows: Vec<Row> = [1, 2, 3]
            .iter()
            .map(|y| std::collections::BTreeMap::from([("year".to_string(), json!(y))]))
            .collect();
        assert!(!is_year_time_column("year", &rows));
    }
}
