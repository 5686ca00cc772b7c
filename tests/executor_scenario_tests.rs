mod common;

use autoinsight::{
    execute_plan, Aggregation, BlockPayload, BlockStatus, ColumnType, EngineConfig, PlanBlock,
};
use common::{bare_plan, col, dataset, graph_for, region_amount_dataset, row, sum_topn};
use serde_json::json;

#[test]
fn topn_with_other_rolls_up_excluded_groups() {
    let ds = region_amount_dataset();
    let graph = graph_for(&ds);
    let plan = bare_plan(vec![sum_topn("region", "amount", 1, true)]);

    let blocks = execute_plan(&ds, &graph, &plan, &EngineConfig::default());
    assert_eq!(blocks.len(), 1);
    let block = &blocks[0];
    assert_eq!(block.id, "topn-01");
    assert_eq!(block.block_type, "TopNBlock");
    assert_eq!(block.status, BlockStatus::Ok);

    let BlockPayload::Grouped(payload) = &block.payload else {
        panic!("expected grouped payload");
    };
    assert_eq!(payload.rows.len(), 2);
    assert_eq!(payload.rows[0].key, "East");
    assert_eq!(payload.rows[0].value, 150.0);
    assert_eq!(payload.rows[1].key, "Other");
    assert_eq!(payload.rows[1].value, 30.0);
    assert_eq!(payload.category_count, Some(2));
}

#[test]
fn kpi_reports_year_over_year_on_year_columns() {
    let rows = vec![
        row(&[("year", json!(2023)), ("amount", json!(10))]),
        row(&[("year", json!(2023)), ("amount", json!(20))]),
        row(&[("year", json!(2024)), ("amount", json!(15))]),
    ];
    let ds = dataset(
        vec![
            col("amount", ColumnType::Number),
            col("year", ColumnType::Number),
        ],
        rows,
    );
    let graph = graph_for(&ds);
    let plan = bare_plan(vec![PlanBlock::Kpi]);

    let blocks = execute_plan(&ds, &graph, &plan, &EngineConfig::default());
    let BlockPayload::Kpi(payload) = &blocks[0].payload else {
        panic!("expected kpi payload");
    };
    let yoy = payload.time_kpis.as_ref().expect("year column yields YoY");
    assert_eq!(yoy.time_column, "year");
    assert_eq!(yoy.latest_period, 2024);
    assert_eq!(yoy.prev_period, 2023);
    assert_eq!(yoy.latest_value, 15.0);
    assert_eq!(yoy.prev_value, 30.0);
    assert_eq!(yoy.delta, -15.0);
    assert_eq!(yoy.pct, Some(-0.5));
}

#[test]
fn empty_rows_never_produce_an_ok_block() {
    let ds = dataset(
        vec![
            col("amount", ColumnType::Number),
            col("region", ColumnType::String),
        ],
        Vec::new(),
    );
    let graph = graph_for(&ds);
    let plan = bare_plan(vec![
        PlanBlock::Kpi,
        sum_topn("region", "amount", 5, true),
        PlanBlock::Distribution {
            measure: "amount".to_string(),
            bins: Some(10),
        },
        PlanBlock::DataQuality,
        PlanBlock::DetailsTable { preview_rows: None },
    ]);

    let blocks = execute_plan(&ds, &graph, &plan, &EngineConfig::default());
    assert_eq!(blocks.len(), 5);
    for block in &blocks {
        assert_ne!(block.status, BlockStatus::Ok, "block {} is OK", block.id);
    }
}

#[test]
fn geo_auto_detects_point_columns_and_drops_out_of_range() {
    let rows = vec![
        row(&[("lat", json!(40.7)), ("lon", json!(-74.0)), ("value", json!(5))]),
        row(&[("lat", json!(34.0)), ("lon", json!(-118.2)), ("value", json!(7))]),
        row(&[("lat", json!(95.0)), ("lon", json!(-74.0)), ("value", json!(9))]),
    ];
    let ds = dataset(
        vec![
            col("lat", ColumnType::Number),
            col("lon", ColumnType::Number),
            col("value", ColumnType::Number),
        ],
        rows,
    );
    let graph = graph_for(&ds);
    let plan = bare_plan(vec![PlanBlock::Geo {
        geo_mode: None,
        lat_column: None,
        lon_column: None,
        region_column: None,
        measure: None,
        agg: Aggregation::Sum,
    }]);

    let blocks = execute_plan(&ds, &graph, &plan, &EngineConfig::default());
    let block = &blocks[0];
    assert_eq!(block.id, "geo-01-points");
    assert_eq!(block.status, BlockStatus::Ok);
    let BlockPayload::GeoPoints(payload) = &block.payload else {
        panic!("expected geo points payload");
    };
    assert_eq!(payload.mode, "points");
    assert_eq!(payload.points.len(), 2);
    assert!(payload.points.iter().all(|p| (-90.0..=90.0).contains(&p.lat)));
}

#[test]
fn breakdown_falls_back_to_topn_above_category_threshold() {
    let rows = (0..9)
        .map(|i| {
            row(&[
                ("category", json!(format!("cat-{i}"))),
                ("amount", json!(i + 1)),
            ])
        })
        .collect();
    let ds = dataset(
        vec![
            col("amount", ColumnType::Number),
            col("category", ColumnType::String),
        ],
        rows,
    );
    let graph = graph_for(&ds);
    let plan = bare_plan(vec![PlanBlock::Breakdown {
        dimension: "category".to_string(),
        measure: Some("amount".to_string()),
        agg: Some(Aggregation::Sum),
        max_categories: Some(8),
    }]);

    let blocks = execute_plan(&ds, &graph, &plan, &EngineConfig::default());
    let block = &blocks[0];
    assert_eq!(block.block_type, "TopNBlock");
    assert_eq!(block.id, "topn-01-breakdown-fallback");
    assert_eq!(block.title, "Top categories (fallback)");
    assert!(block
        .assumptions
        .iter()
        .any(|a| a == "Breakdown fallback: categoryCount=9 > 8"));
}

#[test]
fn unknown_plan_entries_become_explanatory_blocks() {
    let ds = region_amount_dataset();
    let graph = graph_for(&ds);
    let raw = json!({"type": "ForecastBlock", "horizon": 12});
    let block: PlanBlock = serde_json::from_value(raw).expect("unknown tag deserializes");
    let plan = bare_plan(vec![block]);

    let blocks = execute_plan(&ds, &graph, &plan, &EngineConfig::default());
    let block = &blocks[0];
    assert_eq!(block.id, "unknown-01");
    assert_eq!(block.block_type, "UnknownBlock");
    assert_eq!(block.status, BlockStatus::NotApplicable);
    assert_eq!(block.confidence, 0.0);
}

#[test]
fn wire_topn_without_include_other_still_rolls_up_other() {
    let ds = region_amount_dataset();
    let graph = graph_for(&ds);
    let raw = json!({
        "type": "TopNBlock",
        "dimension": "region",
        "measure": "amount",
        "agg": "sum",
        "limit": 1
    });
    let block: PlanBlock = serde_json::from_value(raw).expect("parses");
    let plan = bare_plan(vec![block]);

    let blocks = execute_plan(&ds, &graph, &plan, &EngineConfig::default());
    let BlockPayload::Grouped(payload) = &blocks[0].payload else {
        panic!("expected grouped payload");
    };
    let keys: Vec<&str> = payload.rows.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["East", "Other"]);
    assert_eq!(payload.rows[1].value, 30.0);
}

#[test]
fn explicit_region_mode_overrides_point_detection() {
    let rows = vec![
        row(&[
            ("lat", json!(40.7)),
            ("lon", json!(-74.0)),
            ("state", json!("NY")),
            ("value", json!(5)),
        ]),
        row(&[
            ("lat", json!(34.0)),
            ("lon", json!(-118.2)),
            ("state", json!("CA")),
            ("value", json!(7)),
        ]),
    ];
    let ds = dataset(
        vec![
            col("lat", ColumnType::Number),
            col("lon", ColumnType::Number),
            col("state", ColumnType::String),
            col("value", ColumnType::Number),
        ],
        rows,
    );
    let graph = graph_for(&ds);
    let raw = json!({
        "type": "GeoBlock",
        "geoMode": "region",
        "regionColumn": "state",
        "measure": "value",
        "agg": "sum"
    });
    let block: PlanBlock = serde_json::from_value(raw).expect("parses");
    let plan = bare_plan(vec![block]);

    let blocks = execute_plan(&ds, &graph, &plan, &EngineConfig::default());
    let block = &blocks[0];
    assert_eq!(block.id, "geo-01-region");
    assert_eq!(block.status, BlockStatus::Ok);
    let BlockPayload::GeoRegion(payload) = &block.payload else {
        panic!("expected geo region payload");
    };
    assert_eq!(payload.mode, "region");
    assert_eq!(payload.region_column, "state");
    assert_eq!(payload.rows[0].key, "CA");
    assert_eq!(payload.rows[0].value, 7.0);
}

#[test]
fn trend_sum_is_zero_when_no_measure_values_parse() {
    let rows = vec![
        row(&[("d", json!("2024-01-01")), ("amount", json!("n/a"))]),
        row(&[("d", json!("2024-01-02")), ("amount", json!("n/a"))]),
        row(&[("d", json!("2024-01-02")), ("amount", json!("n/a"))]),
    ];
    let ds = dataset(
        vec![
            col("amount", ColumnType::Number),
            col("d", ColumnType::Date),
        ],
        rows,
    );
    let graph = graph_for(&ds);
    let plan = bare_plan(vec![PlanBlock::Trend {
        time_column: "d".to_string(),
        grain: autoinsight::TimeGrain::Day,
        measure: Some("amount".to_string()),
        agg: Aggregation::Sum,
    }]);

    let blocks = execute_plan(&ds, &graph, &plan, &EngineConfig::default());
    let BlockPayload::Trend(payload) = &blocks[0].payload else {
        panic!("expected trend payload");
    };
    assert_eq!(payload.series.len(), 2);
    for bucket in &payload.series {
        assert_eq!(bucket.sum, Some(0.0), "bucket {}", bucket.t);
    }
}

#[test]
fn explicit_avg_without_measure_is_preserved() {
    let ds = region_amount_dataset();
    let graph = graph_for(&ds);
    let raw = json!({"type": "TopNBlock", "dimension": "region", "agg": "avg"});
    let block: PlanBlock = serde_json::from_value(raw).expect("parses");
    let plan = bare_plan(vec![block]);

    let blocks = execute_plan(&ds, &graph, &plan, &EngineConfig::default());
    let BlockPayload::Grouped(payload) = &blocks[0].payload else {
        panic!("expected grouped payload");
    };
    assert_eq!(payload.agg, Aggregation::Avg);
    assert!(payload.rows.iter().all(|r| r.value == 0.0));

    // Omitting the aggregation entirely still substitutes count.
    let raw = json!({"type": "TopNBlock", "dimension": "region"});
    let block: PlanBlock = serde_json::from_value(raw).expect("parses");
    let plan = bare_plan(vec![block]);
    let blocks = execute_plan(&ds, &graph, &plan, &EngineConfig::default());
    let BlockPayload::Grouped(payload) = &blocks[0].payload else {
        panic!("expected grouped payload");
    };
    assert_eq!(payload.agg, Aggregation::Count);
    assert_eq!(payload.rows[0].key, "East");
    assert_eq!(payload.rows[0].value, 2.0);
}

#[test]
fn trend_without_time_column_is_not_applicable() {
    let ds = region_amount_dataset();
    let graph = graph_for(&ds);
    let plan = bare_plan(vec![PlanBlock::Trend {
        time_column: String::new(),
        grain: autoinsight::TimeGrain::Day,
        measure: Some("amount".to_string()),
        agg: Aggregation::Sum,
    }]);

    let blocks = execute_plan(&ds, &graph, &plan, &EngineConfig::default());
    assert_eq!(blocks[0].status, BlockStatus::NotApplicable);
    assert!(blocks[0]
        .assumptions
        .iter()
        .any(|a| a == "No time column detected."));
}
