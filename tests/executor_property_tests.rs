mod common;

use autoinsight::{
    execute_plan, Aggregation, BlockPayload, BlockStatus, ColumnType, EngineConfig, PlanBlock,
    sanitize_column_name,
};
use common::{bare_plan, col, dataset, graph_for, row, sum_topn};
use serde_json::json;

fn group_dataset(pairs: &[(&str, f64)]) -> autoinsight::CanonicalDataset {
    let rows = pairs
        .iter()
        .map(|(region, amount)| row(&[("region", json!(region)), ("amount", json!(amount))]))
        .collect();
    dataset(
        vec![
            col("amount", ColumnType::Number),
            col("region", ColumnType::String),
        ],
        rows,
    )
}

#[test]
fn repeated_execution_is_byte_identical() {
    let ds = group_dataset(&[
        ("East", 100.0),
        ("West", 30.0),
        ("North", 55.0),
        ("South", 55.0),
        ("East", 20.0),
    ]);
    let graph = graph_for(&ds);
    let plan = bare_plan(vec![
        PlanBlock::Kpi,
        sum_topn("region", "amount", 3, true),
        PlanBlock::Distribution {
            measure: "amount".to_string(),
            bins: Some(5),
        },
        PlanBlock::DataQuality,
    ]);

    let config = EngineConfig::default();
    let first = serde_json::to_string(&execute_plan(&ds, &graph, &plan, &config)).unwrap();
    let second = serde_json::to_string(&execute_plan(&ds, &graph, &plan, &config)).unwrap();
    assert_eq!(first, second);
}

#[test]
fn equal_values_order_by_lexicographic_key() {
    let ds = group_dataset(&[("beta", 50.0), ("alpha", 50.0), ("gamma", 10.0)]);
    let graph = graph_for(&ds);
    let plan = bare_plan(vec![sum_topn("region", "amount", 3, false)]);

    let blocks = execute_plan(&ds, &graph, &plan, &EngineConfig::default());
    let BlockPayload::Grouped(payload) = &blocks[0].payload else {
        panic!("expected grouped payload");
    };
    let keys: Vec<&str> = payload.rows.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["alpha", "beta", "gamma"]);
}

#[test]
fn topn_conserves_totals_when_other_is_included() {
    let groups = [
        ("a", 10.0),
        ("b", 25.0),
        ("c", 5.0),
        ("d", 40.0),
        ("e", 20.0),
    ];
    let ds = group_dataset(&groups);
    let graph = graph_for(&ds);
    let plan = bare_plan(vec![sum_topn("region", "amount", 2, true)]);

    let blocks = execute_plan(&ds, &graph, &plan, &EngineConfig::default());
    let BlockPayload::Grouped(payload) = &blocks[0].payload else {
        panic!("expected grouped payload");
    };
    let shown: f64 = payload.rows.iter().map(|r| r.value).sum();
    let total: f64 = groups.iter().map(|(_, v)| v).sum();
    assert_eq!(shown, total);
}

#[test]
fn histogram_counts_sum_to_values_count() {
    let rows = (0..20)
        .map(|i| row(&[("amount", json!((i as f64) * 3.7 + 1.0))]))
        .collect();
    let ds = dataset(vec![col("amount", ColumnType::Number)], rows);
    let graph = graph_for(&ds);
    let plan = bare_plan(vec![PlanBlock::Distribution {
        measure: "amount".to_string(),
        bins: Some(5),
    }]);

    let blocks = execute_plan(&ds, &graph, &plan, &EngineConfig::default());
    assert_eq!(blocks[0].status, BlockStatus::Ok);
    let BlockPayload::Distribution(payload) = &blocks[0].payload else {
        panic!("expected distribution payload");
    };
    assert_eq!(payload.values_count, 20);
    let binned: usize = payload.histogram.iter().map(|b| b.count).sum();
    assert_eq!(binned, payload.values_count);
}

#[test]
fn quantiles_are_monotonic() {
    let rows = (0..50)
        .map(|i| row(&[("amount", json!(((i * 37) % 50) as f64))]))
        .collect();
    let ds = dataset(vec![col("amount", ColumnType::Number)], rows);
    let graph = graph_for(&ds);
    let plan = bare_plan(vec![PlanBlock::Distribution {
        measure: "amount".to_string(),
        bins: None,
    }]);

    let blocks = execute_plan(&ds, &graph, &plan, &EngineConfig::default());
    let BlockPayload::Distribution(payload) = &blocks[0].payload else {
        panic!("expected distribution payload");
    };
    let q = payload.quantiles.as_ref().expect("quantiles present");
    let series = [q.p10, q.p25, q.p50, q.p75, q.p90];
    for pair in series.windows(2) {
        assert!(pair[0].unwrap() <= pair[1].unwrap());
    }
}

#[test]
fn sanitization_is_idempotent_over_awkward_names() {
    for raw in [
        "  Total Sales ($) ",
        "2024 revenue",
        "lat/lon (deg)",
        "___",
        "naïve column",
        "Order  Date",
    ] {
        let once = sanitize_column_name(raw);
        assert_eq!(sanitize_column_name(&once), once, "input {raw:?}");
    }
}

#[test]
fn every_emitted_block_passes_validation() {
    let ds = group_dataset(&[("East", 100.0), ("West", 30.0)]);
    let graph = graph_for(&ds);
    let plan = bare_plan(vec![
        PlanBlock::Kpi,
        sum_topn("region", "amount", 5, true),
        PlanBlock::Anomaly { enabled: true },
        PlanBlock::Anomaly { enabled: false },
        PlanBlock::GeoLike {
            dimension: "region".to_string(),
            measure: Some("amount".to_string()),
            agg: Aggregation::Sum,
            limit: None,
        },
        PlanBlock::DataQuality,
        PlanBlock::DetailsTable { preview_rows: Some(1) },
    ]);

    let blocks = execute_plan(&ds, &graph, &plan, &EngineConfig::default());
    assert_eq!(blocks.len(), plan.blocks.len());
    for block in &blocks {
        block.validate().expect("block validates");
    }
}
