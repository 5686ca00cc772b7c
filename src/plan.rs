//! Analysis planning: which blocks to compute and with what parameters.
//!
//! The plan is a closed tagged union. The executor dispatches exhaustively
//! over it, and an unrecognized `type` tag deserializes to [`PlanBlock::Unknown`]
//! rather than failing, so a stale or hand-written plan still yields one
//! well-formed output block per entry.

use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::dataset::{CanonicalDataset, ColumnType};
use crate::profile::{ColumnProfile, ColumnRole, DatasetProfile};
use crate::semantic::SemanticGraph;
use crate::timeutil::{parse_date_value, TimeGrain};
use crate::value::clamp01;

pub const ANALYSIS_PLAN_VERSION: &str = "1.0";

/// Timestamps parsed when choosing a grain.
const GRAIN_PARSE_CAP: usize = 5_000;
/// Measures carried in the plan selections.
const MEASURE_LIMIT: usize = 5;
/// Dimensions considered for top-N/driver analysis.
const TOP_DIMENSION_LIMIT: usize = 3;
/// Result caps handed to the executor.
const DRIVER_LIMIT: usize = 12;
const COMPARE_LIMIT: usize = 12;
const GEO_LIKE_LIMIT: usize = 10;
const DETAILS_PREVIEW_ROWS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[default]
    Sum,
    Count,
    Avg,
}

impl Aggregation {
    pub fn as_str(self) -> &'static str {
        match self {
            Aggregation::Sum => "sum",
            Aggregation::Count => "count",
            Aggregation::Avg => "avg",
        }
    }
}

fn default_true() -> bool {
    true
}

/// One planned analysis. Serialized with the `type` tag and camelCase fields
/// so plans round-trip through their JSON wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum PlanBlock {
    #[serde(rename = "KPIBlock")]
    Kpi,
    #[serde(rename = "TrendBlock")]
    Trend {
        time_column: String,
        grain: TimeGrain,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        measure: Option<String>,
        #[serde(default)]
        agg: Aggregation,
    },
    #[serde(rename = "TopNBlock")]
    TopN {
        dimension: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        measure: Option<String>,
        /// `None` means the executor picks sum-with-measure / count-without.
        /// An explicit aggregation always wins, even without a measure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agg: Option<Aggregation>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
        /// The "Other" rollup is on unless the plan turns it off.
        #[serde(default = "default_true")]
        include_other: bool,
    },
    #[serde(rename = "BreakdownBlock")]
    Breakdown {
        dimension: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        measure: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agg: Option<Aggregation>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_categories: Option<usize>,
    },
    #[serde(rename = "DistributionBlock")]
    Distribution {
        measure: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bins: Option<usize>,
    },
    #[serde(rename = "GeoBlock")]
    Geo {
        /// Explicit mode wins; `None` lets the executor pick points when a
        /// lat/lon pair resolves, region otherwise.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        geo_mode: Option<GeoMode>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lat_column: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lon_column: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region_column: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        measure: Option<String>,
        #[serde(default)]
        agg: Aggregation,
    },
    #[serde(rename = "GeoLikeBlock")]
    GeoLike {
        dimension: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        measure: Option<String>,
        #[serde(default)]
        agg: Aggregation,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
    #[serde(rename = "DriverBlock")]
    Driver {
        measure: String,
        dimensions: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
    #[serde(rename = "ComparePeriodsBlock")]
    ComparePeriods {
        time_column: String,
        measure: String,
        #[serde(default)]
        dimensions: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
    #[serde(rename = "AnomalyBlock")]
    Anomaly {
        #[serde(default)]
        enabled: bool,
    },
    #[serde(rename = "DataQualityBlock")]
    DataQuality,
    #[serde(rename = "DetailsTableBlock")]
    DetailsTable {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preview_rows: Option<usize>,
    },
    /// Any unrecognized `type` tag. Executed as an explanatory
    /// not-applicable block, never an error.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoMode {
    Points,
    Region,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoConfig {
    pub geo_mode: GeoMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_column: Option<String>,
}

/// What the orchestrator chose and why; exposed for downstream weighting and
/// for the UI's filter construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSelections {
    pub time_column: Option<String>,
    pub grain: TimeGrain,
    pub measures: Vec<String>,
    pub primary_measure: Option<String>,
    pub dimension: Option<String>,
    pub top_dims: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<GeoConfig>,
    pub data_quality_penalty: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisPlan {
    pub version: String,
    pub built_at: String,
    pub blocks: Vec<PlanBlock>,
    pub selections: PlanSelections,
}

fn category_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(category|region|product)").expect("category pattern compiles")
    })
}

fn region_like_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(region|zone|area|district|territory)").expect("region pattern compiles")
    })
}

fn compare_dim_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(category|region)").expect("compare pattern compiles"))
}

fn lat_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(^|__)(lat|latitude)$").expect("lat pattern compiles"))
}

fn lon_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(^|__)(lon|lng|longitude)$").expect("lon pattern compiles"))
}

fn region_column_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(state|country)$").expect("region column pattern compiles"))
}

pub fn choose_time_column(profile: &DatasetProfile) -> Option<String> {
    profile
        .columns
        .iter()
        .find(|c| c.role == ColumnRole::Time)
        .map(|c| c.name.clone())
}

/// Numeric candidates ordered: explicit measure role first, then lowest
/// null percentage, then name.
pub fn choose_measures(profile: &DatasetProfile, limit: usize) -> Vec<String> {
    let mut measures: Vec<&ColumnProfile> = profile
        .columns
        .iter()
        .filter(|c| c.role == ColumnRole::Measure || c.inferred_type == ColumnType::Number)
        .filter(|c| !matches!(c.role, ColumnRole::Time | ColumnRole::Id | ColumnRole::Geo))
        .collect();
    measures.sort_by(|a, b| {
        let am = usize::from(a.role != ColumnRole::Measure);
        let bm = usize::from(b.role != ColumnRole::Measure);
        am.cmp(&bm)
            .then_with(|| a.null_pct.total_cmp(&b.null_pct))
            .then_with(|| a.name.cmp(&b.name))
    });
    measures.into_iter().take(limit).map(|c| c.name.clone()).collect()
}

fn dimension_candidates<'a>(
    profile: &'a DatasetProfile,
    distinct_cap: usize,
    string_only: bool,
) -> Vec<&'a ColumnProfile> {
    let row_count = if profile.dataset_stats.profiled_row_count > 0 {
        profile.dataset_stats.profiled_row_count
    } else {
        profile.dataset_stats.row_count
    };
    profile
        .columns
        .iter()
        .filter(|c| matches!(c.role, ColumnRole::Dimension | ColumnRole::Geo))
        .filter(|c| {
            if string_only {
                c.inferred_type == ColumnType::String
            } else {
                c.inferred_type != ColumnType::Object
            }
        })
        .filter(|c| {
            if c.distinct_count < 2 {
                return false;
            }
            if row_count > 0 {
                let cap = (distinct_cap as f64).min(row_count as f64 * 0.95);
                if c.distinct_count as f64 > cap {
                    return false;
                }
            }
            true
        })
        .collect()
}

/// Single best grouping dimension: geo roles first, then low cardinality
/// (≤20 preferred), then ascending distinct count, then name.
pub fn choose_dimension(profile: &DatasetProfile) -> Option<String> {
    let mut candidates = dimension_candidates(profile, 200, false);
    candidates.sort_by(|a, b| {
        let ag = usize::from(a.role != ColumnRole::Geo);
        let bg = usize::from(b.role != ColumnRole::Geo);
        ag.cmp(&bg)
            .then_with(|| {
                usize::from(a.distinct_count > 20).cmp(&usize::from(b.distinct_count > 20))
            })
            .then_with(|| a.distinct_count.cmp(&b.distinct_count))
            .then_with(|| a.name.cmp(&b.name))
    });
    candidates.first().map(|c| c.name.clone())
}

/// Dimensions worth ranking: string-typed dimension/geo columns with distinct
/// count in `[2, min(300, 0.95·rows)]`, preferring category/region/product
/// names, then ≤30 distinct values, then ascending distinct count, then name.
pub fn choose_top_dimensions(profile: &DatasetProfile, limit: usize) -> Vec<String> {
    let mut dims = dimension_candidates(profile, 300, true);
    dims.sort_by(|a, b| {
        let ap = usize::from(!category_name_re().is_match(&a.name));
        let bp = usize::from(!category_name_re().is_match(&b.name));
        ap.cmp(&bp)
            .then_with(|| {
                usize::from(a.distinct_count > 30).cmp(&usize::from(b.distinct_count > 30))
            })
            .then_with(|| a.distinct_count.cmp(&b.distinct_count))
            .then_with(|| a.name.cmp(&b.name))
    });
    dims.into_iter().take(limit).map(|c| c.name.clone()).collect()
}

/// Point mode when a latitude/longitude pair exists by name; otherwise region
/// mode on a state/country column, preferring one the profiler marked geo.
pub fn choose_geo_config(profile: &DatasetProfile) -> Option<GeoConfig> {
    let lat = profile
        .columns
        .iter()
        .find(|c| lat_name_re().is_match(&c.name))
        .map(|c| c.name.clone());
    let lon = profile
        .columns
        .iter()
        .find(|c| lon_name_re().is_match(&c.name))
        .map(|c| c.name.clone());
    if let (Some(lat), Some(lon)) = (lat, lon) {
        return Some(GeoConfig {
            geo_mode: GeoMode::Points,
            lat_column: Some(lat),
            lon_column: Some(lon),
            region_column: None,
        });
    }
    let region = profile
        .columns
        .iter()
        .find(|c| region_column_re().is_match(&c.name) && c.role == ColumnRole::Geo)
        .or_else(|| {
            profile
                .columns
                .iter()
                .find(|c| region_column_re().is_match(&c.name))
        })
        .map(|c| c.name.clone());
    region.map(|r| GeoConfig {
        geo_mode: GeoMode::Region,
        lat_column: None,
        lon_column: None,
        region_column: Some(r),
    })
}

/// Pick the trend grain from observed time coverage. Parses up to 5000
/// timestamps; density is distinct observed days over the day span.
pub fn choose_time_grain(dataset: &CanonicalDataset, time_column: Option<&str>) -> TimeGrain {
    let Some(time_column) = time_column else {
        return TimeGrain::Day;
    };
    let mut min_t: Option<i64> = None;
    let mut max_t: Option<i64> = None;
    let mut days: FxHashSet<String> = FxHashSet::default();
    let mut parsed = 0usize;
    for row in &dataset.rows {
        let Some(dt) = row.get(time_column).and_then(|v| parse_date_value(v)) else {
            continue;
        };
        parsed += 1;
        let t = crate::timeutil::millis(dt);
        min_t = Some(min_t.map_or(t, |m| m.min(t)));
        max_t = Some(max_t.map_or(t, |m| m.max(t)));
        days.insert(dt.date().format("%Y-%m-%d").to_string());
        if parsed >= GRAIN_PARSE_CAP {
            break;
        }
    }
    let (Some(min_t), Some(max_t)) = (min_t, max_t) else {
        return TimeGrain::Day;
    };
    let span_days = (((max_t - min_t) as f64 / 86_400_000.0).round()).max(0.0) as i64;
    let density = days.len() as f64 / (span_days + 1) as f64;
    if span_days <= 45 && density >= 0.75 {
        TimeGrain::Day
    } else if span_days <= 180 && density >= 0.3 {
        TimeGrain::Week
    } else {
        TimeGrain::Month
    }
}

/// Conservative trust score in [0, 1]; never gates a block, only weights
/// badges downstream.
pub fn compute_data_quality_penalty(profile: &DatasetProfile) -> f64 {
    let dup = profile.quality.duplicates_pct;
    let max_missing = profile
        .columns
        .iter()
        .map(|c| c.null_pct)
        .fold(0.0f64, f64::max);
    let issues = profile.quality.parse_issues.len() as f64;
    clamp01(dup * 0.6 + max_missing * 0.9 + (issues / 20.0).min(0.5) * 0.5)
}

/// Build the ordered analysis plan. A KPI block is unconditional, so no
/// dataset with rows ever yields an empty plan.
pub fn orchestrate_analysis(
    profile: &DatasetProfile,
    graph: &SemanticGraph,
    dataset: &CanonicalDataset,
) -> AnalysisPlan {
    let time_column = choose_time_column(profile);
    let measures = choose_measures(profile, MEASURE_LIMIT);
    let primary_measure = graph
        .primary_measure
        .clone()
        .or_else(|| measures.first().cloned());
    let grain = choose_time_grain(dataset, time_column.as_deref());
    let data_quality_penalty = compute_data_quality_penalty(profile);
    let dimension = choose_dimension(profile);
    let top_dims = choose_top_dimensions(profile, TOP_DIMENSION_LIMIT);
    let geo = choose_geo_config(profile);

    let default_agg = if primary_measure.is_some() {
        Aggregation::Sum
    } else {
        Aggregation::Count
    };

    let mut blocks = Vec::new();
    blocks.push(PlanBlock::Kpi);
    if let Some(tc) = &time_column {
        blocks.push(PlanBlock::Trend {
            time_column: tc.clone(),
            grain,
            measure: primary_measure.clone(),
            agg: default_agg,
        });
    }
    if let Some(measure) = &primary_measure {
        if !top_dims.is_empty() {
            blocks.push(PlanBlock::Driver {
                measure: measure.clone(),
                dimensions: top_dims.clone(),
                limit: Some(DRIVER_LIMIT),
            });
        }
    }

    let geo_like_dim = top_dims
        .iter()
        .find(|d| region_like_name_re().is_match(d))
        .cloned();
    match (&geo, geo_like_dim) {
        (Some(cfg), _) => blocks.push(PlanBlock::Geo {
            geo_mode: Some(cfg.geo_mode),
            lat_column: cfg.lat_column.clone(),
            lon_column: cfg.lon_column.clone(),
            region_column: cfg.region_column.clone(),
            measure: primary_measure.clone(),
            agg: default_agg,
        }),
        (None, Some(dim)) => blocks.push(PlanBlock::GeoLike {
            dimension: dim,
            measure: primary_measure.clone(),
            agg: default_agg,
            limit: Some(GEO_LIKE_LIMIT),
        }),
        (None, None) => blocks.push(PlanBlock::Geo {
            geo_mode: None,
            lat_column: None,
            lon_column: None,
            region_column: None,
            measure: None,
            agg: Aggregation::Sum,
        }),
    }

    blocks.push(PlanBlock::DetailsTable {
        preview_rows: Some(DETAILS_PREVIEW_ROWS),
    });

    if let (Some(tc), Some(measure)) = (&time_column, &primary_measure) {
        if !top_dims.is_empty() {
            let compare_dims: Vec<String> = top_dims
                .iter()
                .filter(|d| compare_dim_re().is_match(d))
                .take(2)
                .cloned()
                .collect();
            blocks.push(PlanBlock::ComparePeriods {
                time_column: tc.clone(),
                measure: measure.clone(),
                dimensions: compare_dims,
                limit: Some(COMPARE_LIMIT),
            });
        }
    }

    blocks.push(PlanBlock::DataQuality);

    AnalysisPlan {
        version: ANALYSIS_PLAN_VERSION.to_string(),
        built_at: Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        blocks,
        selections: PlanSelections {
            time_column,
            grain,
            measures,
            primary_measure,
            dimension,
            top_dims,
            geo,
            data_quality_penalty,
        },
    }
}
