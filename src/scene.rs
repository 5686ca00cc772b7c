//! Scene graph assembly: group executed insight blocks into display pages.
//!
//! The grouping is fixed. Overview carries the headline blocks plus any
//! block type no page claims, Insights carries period comparisons and
//! anomalies, and data quality and row details each get their own page.

use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::insight::InsightBlock;
use crate::profile::{ColumnRole, DatasetProfile};

fn region_filter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(state|country)").expect("region pattern compiles"))
}

pub const SCENE_GRAPH_VERSION: &str = "1.0";

/// Display order applied within each page.
const BLOCK_ORDER: [&str; 9] = [
    "KPIBlock",
    "TrendBlock",
    "DriverBlock",
    "GeoBlock",
    "GeoLikeBlock",
    "ComparePeriodsBlock",
    "DetailsTableBlock",
    "AnomalyBlock",
    "DataQualityBlock",
];

const OVERVIEW_TYPES: [&str; 5] = [
    "KPIBlock",
    "TrendBlock",
    "DriverBlock",
    "GeoBlock",
    "GeoLikeBlock",
];
const INSIGHT_TYPES: [&str; 2] = ["ComparePeriodsBlock", "AnomalyBlock"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeLayout {
    pub order: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub block_id: String,
    pub block_type: String,
    pub title: String,
    pub layout: NodeLayout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneFilter {
    pub id: String,
    #[serde(rename = "type")]
    pub filter_type: String,
    pub column: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenePage {
    pub id: String,
    pub label: String,
    pub node_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneGraph {
    pub version: String,
    pub built_at: String,
    pub nodes: Vec<SceneNode>,
    pub filters: Vec<SceneFilter>,
    pub pages: Vec<ScenePage>,
}

fn order_rank(block_type: &str) -> usize {
    BLOCK_ORDER
        .iter()
        .position(|t| *t == block_type)
        .unwrap_or(usize::MAX)
}

fn sorted_ids(nodes: &[&SceneNode]) -> Vec<String> {
    let mut sorted: Vec<&&SceneNode> = nodes.iter().collect();
    // Stable sort keeps the executor's within-type ordering.
    sorted.sort_by_key(|n| order_rank(&n.block_type));
    sorted.iter().map(|n| n.id.clone()).collect()
}

fn build_filters(profile: &DatasetProfile) -> Vec<SceneFilter> {
    let mut filters = Vec::new();
    if let Some(time) = profile
        .columns
        .iter()
        .find(|c| c.role == ColumnRole::Time)
    {
        filters.push(SceneFilter {
            id: "time_range".to_string(),
            filter_type: "time_range".to_string(),
            column: time.name.clone(),
            label: "Date range".to_string(),
        });
    }
    if let Some(geo) = profile
        .columns
        .iter()
        .find(|c| c.role == ColumnRole::Geo && region_filter_re().is_match(&c.name))
    {
        filters.push(SceneFilter {
            id: "geo".to_string(),
            filter_type: "dropdown".to_string(),
            column: geo.name.clone(),
            label: "State".to_string(),
        });
    }
    filters
}

/// Assemble pages from executed blocks. Every node lands on exactly one page;
/// block types no page claims overflow onto Overview.
pub fn build_scene_graph(blocks: &[InsightBlock], profile: &DatasetProfile) -> SceneGraph {
    let nodes: Vec<SceneNode> = blocks
        .iter()
        .enumerate()
        .map(|(idx, b)| SceneNode {
            id: format!("node-{:02}", idx + 1),
            node_type: "InsightBlockNode".to_string(),
            block_id: b.id.clone(),
            block_type: b.block_type.clone(),
            title: b.title.clone(),
            layout: NodeLayout { order: idx },
        })
        .collect();

    let of_types = |types: &[&str]| -> Vec<&SceneNode> {
        nodes
            .iter()
            .filter(|n| types.contains(&n.block_type.as_str()))
            .collect()
    };
    let overview = of_types(&OVERVIEW_TYPES);
    let insights = of_types(&INSIGHT_TYPES);
    let quality = of_types(&["DataQualityBlock"]);
    let details = of_types(&["DetailsTableBlock"]);

    let claimed: Vec<&str> = overview
        .iter()
        .chain(insights.iter())
        .chain(quality.iter())
        .chain(details.iter())
        .map(|n| n.id.as_str())
        .collect();
    let leftover: Vec<&SceneNode> = nodes
        .iter()
        .filter(|n| !claimed.contains(&n.id.as_str()))
        .collect();
    let mut overview_all = overview;
    overview_all.extend(leftover);

    SceneGraph {
        version: SCENE_GRAPH_VERSION.to_string(),
        built_at: Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        nodes: nodes.clone(),
        filters: build_filters(profile),
        pages: vec![
            ScenePage {
                id: "overview".to_string(),
                label: "Overview".to_string(),
                node_ids: sorted_ids(&overview_all),
            },
            ScenePage {
                id: "insights".to_string(),
                label: "Insights".to_string(),
                node_ids: sorted_ids(&insights),
            },
            ScenePage {
                id: "quality".to_string(),
                label: "Data Quality".to_string(),
                node_ids: sorted_ids(&quality),
            },
            ScenePage {
                id: "details".to_string(),
                label: "Details".to_string(),
                node_ids: sorted_ids(&details),
            },
        ],
    }
}
