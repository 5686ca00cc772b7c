//! The semantic graph: the profile condensed into the column metadata the
//! planner consumes, plus the primary-measure election.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::dataset::{CanonicalDataset, ColumnType, Row};
use crate::numeric::Welford;
use crate::profile::{ColumnRole, DatasetProfile};
use crate::value::parse_number;

pub const SEMANTIC_GRAPH_VERSION: &str = "1.0";

/// Name substrings that elect a primary measure outright, in priority order.
const MEASURE_NAME_PREFS: [&str; 6] = ["sales", "revenue", "amount", "cost", "spend", "income"];

/// Values scanned per candidate when variance breaks the tie.
const VARIANCE_SAMPLE_CAP: usize = 8_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticColumn {
    pub name: String,
    pub role: ColumnRole,
    pub inferred_type: ColumnType,
    pub null_pct: f64,
    pub distinct_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticGraph {
    pub version: String,
    pub built_at: String,
    pub columns: BTreeMap<String, SemanticColumn>,
    pub primary_measure: Option<String>,
}

impl SemanticGraph {
    pub fn column(&self, name: &str) -> Option<&SemanticColumn> {
        self.columns.get(name)
    }
}

fn variance_stats(rows: &[Row], column: &str) -> Welford {
    let mut w = Welford::default();
    for row in rows {
        let Some(x) = row.get(column).and_then(parse_number) else {
            continue;
        };
        w.push(x);
        if w.n >= VARIANCE_SAMPLE_CAP {
            break;
        }
    }
    w
}

/// Elect the primary measure.
///
/// Candidates are measure-role or number-typed columns that are not time, id,
/// or geo. A name containing one of the preferred business keywords wins
/// immediately; otherwise the highest-variance candidate does, preferring
/// columns with a non-trivial mean over at least three values, with name
/// order breaking exact variance ties.
pub fn select_primary_measure(profile: &DatasetProfile, rows: &[Row]) -> Option<String> {
    let candidates: Vec<&str> = profile
        .columns
        .iter()
        .filter(|c| c.role == ColumnRole::Measure || c.inferred_type == ColumnType::Number)
        .filter(|c| {
            !matches!(c.role, ColumnRole::Time | ColumnRole::Id | ColumnRole::Geo)
        })
        .map(|c| c.name.as_str())
        .collect();
    if candidates.is_empty() {
        return None;
    }

    for pref in MEASURE_NAME_PREFS {
        if let Some(hit) = candidates
            .iter()
            .find(|c| c.to_lowercase().contains(pref))
        {
            return Some((*hit).to_string());
        }
    }

    let stats: Vec<(&str, Welford)> = candidates
        .iter()
        .map(|c| (*c, variance_stats(rows, c)))
        .collect();
    let mut pool: Vec<&(&str, Welford)> = stats
        .iter()
        .filter(|(_, w)| w.mean.abs() > 1e-9 && w.n >= 3)
        .collect();
    if pool.is_empty() {
        pool = stats.iter().collect();
    }
    pool.sort_by(|a, b| {
        b.1.variance()
            .total_cmp(&a.1.variance())
            .then_with(|| a.0.cmp(b.0))
    });
    pool.first()
        .map(|(name, _)| (*name).to_string())
        .or_else(|| Some(candidates[0].to_string()))
}

/// Condense the profile into the graph the planner reads.
pub fn build_semantic_graph(
    profile: &DatasetProfile,
    dataset: &CanonicalDataset,
) -> SemanticGraph {
    let columns: BTreeMap<String, SemanticColumn> = profile
        .columns
        .iter()
        .map(|c| {
            (
                c.name.clone(),
                SemanticColumn {
                    name: c.name.clone(),
                    role: c.role,
                    inferred_type: c.inferred_type,
                    null_pct: c.null_pct,
                    distinct_count: c.distinct_count,
                },
            )
        })
        .collect();
    SemanticGraph {
        version: SEMANTIC_GRAPH_VERSION.to_string(),
        built_at: Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        columns,
        primary_measure: select_primary_measure(profile, &dataset.rows),
    }
}
