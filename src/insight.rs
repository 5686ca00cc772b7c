//! Insight blocks: the executor's output unit.
//!
//! Applicability problems are encoded in [`BlockStatus`], never as errors: a
//! dataset with no time column still yields a well-formed trend block, just a
//! `NOT_APPLICABLE` one. A block that fails [`InsightBlock::validate`] is a
//! programming error in the executor, not a data condition.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::Row;
use crate::numeric::NumericSummary;
use crate::plan::Aggregation;
use crate::profile::ParseIssue;
use crate::timeutil::TimeGrain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "NOT_APPLICABLE")]
    NotApplicable,
    #[serde(rename = "INSUFFICIENT_DATA")]
    InsufficientData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BadgeStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "WARN")]
    Warn,
}

/// Small trust indicator attached to most blocks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Badge {
    pub id: &'static str,
    pub label: String,
    pub status: BadgeStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyValue {
    pub key: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSummary {
    pub name: String,
    pub summary: NumericSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodValue {
    pub period: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub abs: f64,
    pub pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeTotal {
    pub from: String,
    pub to: String,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeCompare {
    pub current: RangeTotal,
    pub previous: RangeTotal,
    pub change: Change,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopContributor {
    pub dimension: String,
    pub group: String,
    pub value: f64,
    pub share: f64,
}

/// Latest-vs-previous period KPIs at the chosen grain, plus a whole-range
/// comparison against the immediately preceding range of equal length.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutiveKpis {
    pub time_column: String,
    pub grain: TimeGrain,
    pub measure: String,
    pub latest: PeriodValue,
    pub previous: PeriodValue,
    pub change: Change,
    pub range_compare: RangeCompare,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_contributor: Option<TopContributor>,
}

/// Year-over-year KPIs for year-literal time columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeKpis {
    pub measure: Option<String>,
    pub time_column: String,
    pub latest_period: i64,
    pub prev_period: i64,
    pub latest_value: f64,
    pub prev_value: f64,
    pub delta: f64,
    pub pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiPayload {
    pub row_count: usize,
    pub primary_measure: Option<String>,
    pub metric_summaries: Vec<MetricSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executive_kpis: Option<ExecutiveKpis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_kpis: Option<TimeKpis>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendBucket {
    pub t: String,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPayload {
    pub time_column: String,
    pub grain: TimeGrain,
    pub measure: Option<String>,
    pub agg: Aggregation,
    pub series: Vec<TrendBucket>,
    /// Bucket keys whose first-difference z-score exceeds the mark threshold.
    pub anomalies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupedPayload {
    pub dimension: String,
    pub measure: Option<String>,
    pub agg: Aggregation,
    pub rows: Vec<KeyValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quantiles {
    pub p10: Option<f64>,
    pub p25: Option<f64>,
    pub p50: Option<f64>,
    pub p75: Option<f64>,
    pub p90: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramBin {
    pub bin: usize,
    pub from: f64,
    pub to: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionPayload {
    pub measure: String,
    pub values_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantiles: Option<Quantiles>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub histogram: Vec<HistogramBin>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoPointsPayload {
    pub mode: &'static str,
    pub lat_column: String,
    pub lon_column: String,
    pub measure: Option<String>,
    pub agg: Aggregation,
    pub points: Vec<GeoPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoRegionPayload {
    pub mode: &'static str,
    pub region_column: String,
    pub measure: Option<String>,
    pub agg: Aggregation,
    pub rows: Vec<KeyValue>,
    /// Present when the region keys look like two-letter US state codes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_subtype: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverOverall {
    pub total: f64,
    pub avg: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverRow {
    pub dimension: String,
    pub group: String,
    pub total: f64,
    pub share: f64,
    pub avg: f64,
    pub lift: f64,
    pub count: usize,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverPayload {
    pub measure: String,
    pub overall: DriverOverall,
    pub top_drivers: Vec<DriverRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparePeriod {
    pub from: String,
    pub to: String,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionRow {
    pub key: String,
    pub first: f64,
    pub second: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparePayload {
    pub time_column: String,
    pub measure: String,
    pub period_a: ComparePeriod,
    pub period_b: ComparePeriod,
    pub delta: f64,
    pub pct: Option<f64>,
    pub contributions: BTreeMap<String, Vec<ContributionRow>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareUnavailablePayload {
    pub time_column: String,
    pub measure: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMissingness {
    pub column: String,
    pub null_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityPayload {
    pub duplicates_pct: f64,
    pub missingness: Vec<ColumnMissingness>,
    pub parse_issues: Vec<ParseIssue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailsPayload {
    pub column_order: Vec<String>,
    pub search_keys: Vec<String>,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmptyPayload {
    pub reason: String,
}

/// Variant-specific block payload. Untagged: each shape carries enough of
/// its own field vocabulary to be unambiguous to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BlockPayload {
    Kpi(KpiPayload),
    Trend(TrendPayload),
    Grouped(GroupedPayload),
    Distribution(DistributionPayload),
    GeoPoints(GeoPointsPayload),
    GeoRegion(GeoRegionPayload),
    Driver(DriverPayload),
    Compare(ComparePayload),
    CompareUnavailable(CompareUnavailablePayload),
    Quality(QualityPayload),
    Details(DetailsPayload),
    Empty(EmptyPayload),
}

/// One executed analysis finding. Finalized in a single executor pass and
/// never mutated afterward.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightBlock {
    pub id: String,
    #[serde(rename = "type")]
    pub block_type: String,
    pub title: String,
    pub question_answered: String,
    pub status: BlockStatus,
    pub confidence: f64,
    pub assumptions: Vec<String>,
    pub sample_size: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub badges: Vec<Badge>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_narrative: Option<String>,
    pub payload: BlockPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    #[error("block has an empty id")]
    EmptyId,
    #[error("block '{id}' has an empty type")]
    EmptyType { id: String },
    #[error("block '{id}' has non-finite or out-of-range confidence")]
    InvalidConfidence { id: String },
}

impl InsightBlock {
    /// Structural contract every emitted block must satisfy.
    pub fn validate(&self) -> Result<(), BlockError> {
        if self.id.is_empty() {
            return Err(BlockError::EmptyId);
        }
        if self.block_type.is_empty() {
            return Err(BlockError::EmptyType {
                id: self.id.clone(),
            });
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(BlockError::InvalidConfidence {
                id: self.id.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(confidence: f64) -> InsightBlock {
        InsightBlock {
            id: "kpi-01".to_string(),
            block_type: "KPIBlock".to_string(),
            title: "Key metrics".to_string(),
            question_answered: "What are the headline stats?".to_string(),
            status: BlockStatus::Ok,
            confidence,
            assumptions: Vec::new(),
            sample_size: 10,
            badges: Vec::new(),
            block_narrative: None,
            payload: BlockPayload::Empty(EmptyPayload {
                reason: "test".to_string(),
            }),
        }
    }

    #[test]
    fn statuses_serialize_to_screaming_case() {
        assert_eq!(
            serde_json::to_string(&BlockStatus::NotApplicable).unwrap(),
            "\"NOT_APPLICABLE\""
        );
        assert_eq!(
            serde_json::to_string(&BlockStatus::InsufficientData).unwrap(),
            "\"INSUFFICIENT_DATA\""
        );
        assert_eq!(serde_json::to_string(&BlockStatus::Ok).unwrap(), "\"OK\"");
    }

    #[test]
    fn validator_rejects_bad_confidence() {
        assert!(block(0.8).validate().is_ok());
        assert!(matches!(
            block(f64::NAN).validate(),
            Err(BlockError::InvalidConfidence { .. })
        ));
        assert!(block(1.5).validate().is_err());
        let mut b = block(0.5);
        b.id.clear();
        assert!(matches!(b.validate(), Err(BlockError::EmptyId)));
    }

    #[test]
    fn block_serializes_with_wire_field_names() {
        let b = block(0.8);
        let json = serde_json::to_value(&b).unwrap();
        assert_eq!(json["type"], "KPIBlock");
        assert_eq!(json["questionAnswered"], "What are the headline stats?");
        assert_eq!(json["sampleSize"], 10);
        assert!(json.get("badges").is_none());
    }
}
