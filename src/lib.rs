//! Auto Insight: deterministic analysis of tabular datasets.
//!
//! This crate provides functionality for:
//! - Normalizing loose JSON records into a canonical schema'd dataset
//! - Profiling columns (types, roles, missingness, parse issues)
//! - Building a semantic graph and an ordered analysis plan
//! - Executing the plan into typed insight blocks
//! - Grouping executed blocks into a displayable scene graph
//!
//! # Quick Start
//!
//! ```ignore
//! use autoinsight::{analyze_records, DatasetMetadata, EngineConfig};
//!
//! let records: Vec<serde_json::Value> = load_records()?;
//! let run = analyze_records(&records, DatasetMetadata::default(), &EngineConfig::default())?;
//!
//! for block in &run.blocks {
//!     println!("{} [{:?}] {}", block.id, block.status, block.title);
//! }
//! ```
//!
//! Every stage is a pure function of its inputs: given the same dataset and
//! configuration, the emitted blocks are byte-identical across runs.

mod config;
mod dataset;
mod execute;
mod insight;
mod normalize;
pub(crate) mod numeric;
mod pipeline;
mod plan;
mod profile;
pub(crate) mod rowkey;
mod scene;
mod semantic;
pub(crate) mod timeutil;
pub(crate) mod value;

pub use config::{ConfigError, EngineConfig};
pub use dataset::{
    CanonicalDataset, ColumnDef, ColumnType, DatasetError, DatasetMetadata, Row,
};
pub use execute::execute_plan;
pub use insight::{
    Badge, BadgeStatus, BlockError, BlockPayload, BlockStatus, InsightBlock, KeyValue,
};
pub use normalize::{
    flatten_record, infer_schema, normalize_records, sanitize_column_name,
};
pub use numeric::NumericSummary;
pub use pipeline::{
    analyze_records, build_canonical_dataset, run_pipeline, AnalysisRun, PipelineError,
};
pub use plan::{
    orchestrate_analysis, Aggregation, AnalysisPlan, GeoConfig, GeoMode, PlanBlock,
    PlanSelections, ANALYSIS_PLAN_VERSION,
};
pub use profile::{
    profile_dataset, ColumnProfile, ColumnRole, DatasetProfile, DatasetStats, MissingnessSummary,
    ParseIssue, ParseIssueKind, ProfileFlags, QualityReport,
};
pub use scene::{build_scene_graph, SceneFilter, SceneGraph, SceneNode, ScenePage};
pub use semantic::{
    build_semantic_graph, select_primary_measure, SemanticColumn, SemanticGraph,
    SEMANTIC_GRAPH_VERSION,
};
pub use timeutil::{TimeCoverage, TimeGrain};
