//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;

use autoinsight::{
    build_semantic_graph, profile_dataset, Aggregation, AnalysisPlan, CanonicalDataset,
    ColumnDef, ColumnType, DatasetMetadata, EngineConfig, PlanBlock, PlanSelections, Row,
    SemanticGraph, TimeGrain, ANALYSIS_PLAN_VERSION,
};
use serde_json::{json, Value};

pub fn col(name: &str, ty: ColumnType) -> ColumnDef {
    ColumnDef {
        name: name.to_string(),
        inferred_type: ty,
        nullable: false,
        sample_values: Vec::new(),
    }
}

pub fn row(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect::<BTreeMap<_, _>>()
}

pub fn dataset(schema: Vec<ColumnDef>, rows: Vec<Row>) -> CanonicalDataset {
    let metadata = DatasetMetadata {
        row_count: rows.len(),
        ..Default::default()
    };
    CanonicalDataset::new(schema, rows, metadata)
}

pub fn graph_for(ds: &CanonicalDataset) -> SemanticGraph {
    let profile = profile_dataset(ds, &EngineConfig::default());
    build_semantic_graph(&profile, ds)
}

/// Plan with no orchestrator selections; the executor falls back to its own
/// column detection for everything the blocks leave unspecified.
pub fn bare_plan(blocks: Vec<PlanBlock>) -> AnalysisPlan {
    AnalysisPlan {
        version: ANALYSIS_PLAN_VERSION.to_string(),
        built_at: "2024-01-01T00:00:00.000Z".to_string(),
        blocks,
        selections: PlanSelections {
            time_column: None,
            grain: TimeGrain::Day,
            measures: Vec::new(),
            primary_measure: None,
            dimension: None,
            top_dims: Vec::new(),
            geo: None,
            data_quality_penalty: 0.0,
        },
    }
}

/// Region/amount rows: East 100 + 50, West 30.
pub fn region_amount_dataset() -> CanonicalDataset {
    let rows = vec![
        row(&[("region", json!("East")), ("amount", json!(100))]),
        row(&[("region", json!("East")), ("amount", json!(50))]),
        row(&[("region", json!("West")), ("amount", json!(30))]),
    ];
    dataset(
        vec![
            col("amount", ColumnType::Number),
            col("region", ColumnType::String),
        ],
        rows,
    )
}

pub fn sum_topn(dimension: &str, measure: &str, limit: usize, include_other: bool) -> PlanBlock {
    PlanBlock::TopN {
        dimension: dimension.to_string(),
        measure: Some(measure.to_string()),
        agg: Some(Aggregation::Sum),
        limit: Some(limit),
        include_other,
    }
}
