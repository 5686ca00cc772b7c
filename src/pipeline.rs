//! The end-to-end pipeline: raw records in, scene graph out.
//!
//! Each stage is usable on its own; this module just chains them in order
//! and carries every intermediate artifact in the result so callers can
//! inspect (or persist) the profile, plan, and blocks alongside the scene.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::{ConfigError, EngineConfig};
use crate::dataset::{CanonicalDataset, DatasetError, DatasetMetadata};
use crate::execute::execute_plan;
use crate::insight::InsightBlock;
use crate::normalize::{infer_schema, normalize_records};
use crate::plan::{orchestrate_analysis, AnalysisPlan};
use crate::profile::{profile_dataset, DatasetProfile};
use crate::scene::{build_scene_graph, SceneGraph};
use crate::semantic::{build_semantic_graph, SemanticGraph};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid dataset: {0}")]
    Dataset(#[from] DatasetError),
}

/// Every artifact one analysis run produces, in stage order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRun {
    pub profile: DatasetProfile,
    pub semantic_graph: SemanticGraph,
    pub plan: AnalysisPlan,
    pub blocks: Vec<InsightBlock>,
    pub scene_graph: SceneGraph,
}

/// Normalize loose JSON records into a canonical dataset: flatten, sanitize
/// names, coerce date shapes, and infer the schema from a stable sample.
pub fn build_canonical_dataset(
    records: &[Value],
    metadata: DatasetMetadata,
    config: &EngineConfig,
) -> Result<CanonicalDataset, PipelineError> {
    config.validate()?;
    let rows = normalize_records(records, None);
    let schema = infer_schema(&rows, config.sample_row_limit, config.sample_values_limit);
    let mut metadata = metadata;
    metadata.row_count = rows.len();
    let dataset = CanonicalDataset::new(schema, rows, metadata);
    dataset.validate()?;
    Ok(dataset)
}

/// Run every stage over an already-canonical dataset.
pub fn run_pipeline(
    dataset: &CanonicalDataset,
    config: &EngineConfig,
) -> Result<AnalysisRun, PipelineError> {
    config.validate()?;
    dataset.validate()?;

    let profile = profile_dataset(dataset, config);
    let semantic_graph = build_semantic_graph(&profile, dataset);
    let plan = orchestrate_analysis(&profile, &semantic_graph, dataset);
    let blocks = execute_plan(dataset, &semantic_graph, &plan, config);
    let scene_graph = build_scene_graph(&blocks, &profile);

    Ok(AnalysisRun {
        profile,
        semantic_graph,
        plan,
        blocks,
        scene_graph,
    })
}

/// Convenience entry point: raw records straight through to an analysis run.
pub fn analyze_records(
    records: &[Value],
    metadata: DatasetMetadata,
    config: &EngineConfig,
) -> Result<AnalysisRun, PipelineError> {
    let dataset = build_canonical_dataset(records, metadata, config)?;
    run_pipeline(&dataset, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sales_records() -> Vec<Value> {
        (0..40)
            .map(|i| {
                json!({
                    "Order Date": format!("2024-{:02}-{:02}", 1 + i % 6, 1 + i % 28),
                    "Region": (["East", "West", "North", "South"][i % 4]),
                    "Sales Amount": (i as f64) * 12.5 + 100.0,
                })
            })
            .collect()
    }

    #[test]
    fn records_flow_through_every_stage() {
        let run = analyze_records(
            &sales_records(),
            DatasetMetadata::default(),
            &EngineConfig::default(),
        )
        .expect("pipeline runs");

        assert!(!run.profile.columns.is_empty());
        assert!(run.semantic_graph.primary_measure.is_some());
        assert!(!run.plan.blocks.is_empty());
        assert_eq!(run.blocks.len(), run.plan.blocks.len());
        assert_eq!(run.scene_graph.nodes.len(), run.blocks.len());
    }

    #[test]
    fn dataset_row_count_is_recorded() {
        let ds = build_canonical_dataset(
            &sales_records(),
            DatasetMetadata::default(),
            &EngineConfig::default(),
        )
        .expect("dataset builds");
        assert_eq!(ds.metadata.row_count, 40);
        assert!(ds.column("Sales_Amount").is_some());
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let bad = EngineConfig {
            max_compute_rows: 0,
            ..Default::default()
        };
        let err = analyze_records(&sales_records(), DatasetMetadata::default(), &bad);
        assert!(matches!(err, Err(PipelineError::Config(_))));
    }
}
