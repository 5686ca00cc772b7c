//! Schema normalization: flattening, column-name sanitization, and type
//! inference.
//!
//! This stage turns arbitrarily nested, loosely-typed records into a strictly
//! flat table plus an inferred schema. It never fails on malformed input: a
//! value that defeats every heuristic is simply a string.

use std::collections::BTreeSet;

use rustc_hash::FxHashSet;
use serde_json::Value;

use crate::dataset::{ColumnDef, ColumnType, Row};
use crate::timeutil::{self, looks_like_date_string};
use crate::value::{distinct_key, is_null_like, parse_number_str};

/// Values examined per column when inferring a type.
const TYPE_SAMPLE_CAP: usize = 250;
/// Match-ratio floor for classifying a column as dates.
const DATE_RATIO: f64 = 0.7;
/// Match-ratio floor for booleans and numbers.
const BOOL_RATIO: f64 = 0.8;
const NUMBER_RATIO: f64 = 0.8;

/// Sanitize a raw column name: control characters become spaces, non-word
/// runs collapse to `_`, runs of three or more underscores collapse to
/// exactly two (preserving the `__` flatten separator), and leading/trailing
/// underscores are stripped. Empty results default to `column`; a leading
/// digit gains a `col_` prefix. Idempotent.
pub fn sanitize_column_name(name: &str) -> String {
    let raw = name.trim();
    let base = if raw.is_empty() { "column" } else { raw };

    let mut collapsed = String::with_capacity(base.len());
    let mut in_sep = false;
    for ch in base.chars() {
        let ch = if ch.is_control() { ' ' } else { ch };
        if ch.is_ascii_alphanumeric() || ch == '_' {
            collapsed.push(ch);
            in_sep = false;
        } else if !in_sep {
            collapsed.push('_');
            in_sep = true;
        } else {
            // still inside a non-word run
        }
    }

    // Collapse underscore runs of 3+ down to the two-character separator.
    let mut out = String::with_capacity(collapsed.len());
    let mut run = 0usize;
    for ch in collapsed.chars() {
        if ch == '_' {
            run += 1;
        } else {
            out.push_str(if run >= 3 { "__" } else { &"__"[..run.min(2)] });
            run = 0;
            out.push(ch);
        }
    }
    out.push_str(if run >= 3 { "__" } else { &"__"[..run.min(2)] });

    let trimmed = out.trim_matches('_');
    let safe = if trimmed.is_empty() { "column" } else { trimmed };
    if safe.starts_with(|c: char| c.is_ascii_digit()) {
        format!("col_{safe}")
    } else {
        safe.to_string()
    }
}

fn safe_json_string(v: &Value) -> String {
    serde_json::to_string(v).unwrap_or_else(|_| v.to_string())
}

/// Flatten one record into a flat row.
///
/// Nested objects recurse with a `__`-joined, per-segment-sanitized prefix;
/// arrays are serialized to their JSON string (never expanded, which also
/// rules out cycles through array containment); an empty object at a
/// non-root prefix serializes to a string; a top-level null yields no
/// entries. Uses an explicit worklist rather than recursion so nesting depth
/// is bounded by memory, not stack.
pub fn flatten_record(input: &Value) -> Row {
    let mut out = Row::new();
    match input {
        Value::Null => {}
        Value::Object(_) => {
            let mut stack: Vec<(String, &Value)> = vec![(String::new(), input)];
            while let Some((prefix, node)) = stack.pop() {
                let Value::Object(map) = node else { continue };
                if map.is_empty() && !prefix.is_empty() {
                    out.insert(prefix, Value::String(safe_json_string(node)));
                    continue;
                }
                for (k, v) in map {
                    let key = sanitize_column_name(k);
                    let next = if prefix.is_empty() {
                        key
                    } else {
                        format!("{prefix}__{key}")
                    };
                    match v {
                        Value::Object(_) => stack.push((next, v)),
                        Value::Array(_) => {
                            out.insert(next, Value::String(safe_json_string(v)));
                        }
                        other => {
                            out.insert(next, other.clone());
                        }
                    }
                }
            }
        }
        Value::Array(_) => {
            out.insert("value".to_string(), Value::String(safe_json_string(input)));
        }
        scalar => {
            out.insert("value".to_string(), scalar.clone());
        }
    }
    out
}

/// Normalize a cell that might be a date: epoch numbers (milliseconds above
/// 1e10, seconds between 1e9 and 1e10) and date-looking strings become
/// ISO-8601 strings; everything else passes through unchanged.
pub fn normalize_date(v: &Value) -> Value {
    if is_null_like(v) {
        return v.clone();
    }
    match v {
        Value::Number(_) => {
            let Some(n) = parse_number_str(&distinct_key(v)) else {
                return v.clone();
            };
            if n > 1_000_000_000.0 {
                if let Some(dt) = timeutil::parse_date_value(v) {
                    return Value::String(timeutil::to_iso_string(dt));
                }
            }
            v.clone()
        }
        Value::String(s) if looks_like_date_string(s) => match timeutil::parse_date_value(v) {
            Some(dt) => Value::String(timeutil::to_iso_string(dt)),
            None => v.clone(),
        },
        _ => v.clone(),
    }
}

/// Flatten and date-normalize raw records. `row_limit` bounds how many
/// records are processed.
pub fn normalize_records(records: &[Value], row_limit: Option<usize>) -> Vec<Row> {
    let take = row_limit.unwrap_or(records.len()).min(records.len());
    records[..take]
        .iter()
        .map(|record| {
            flatten_record(record)
                .into_iter()
                .map(|(k, v)| {
                    let normalized = normalize_date(&v);
                    (k, normalized)
                })
                .collect()
        })
        .collect()
}

/// Classify a column from sampled values. Priority order and thresholds are
/// the type-inference contract: any structured sample forces `object`; then
/// date ratio ≥ 0.7, boolean ≥ 0.8, number ≥ 0.8; else `string`.
pub fn detect_type<'a, I>(values: I) -> ColumnType
where
    I: IntoIterator<Item = &'a Value>,
{
    let non_null: Vec<&Value> = values.into_iter().filter(|v| !is_null_like(v)).collect();
    if non_null.is_empty() {
        return ColumnType::String;
    }

    let mut number_like = 0usize;
    let mut bool_like = 0usize;
    let mut date_like = 0usize;
    let mut object_like = 0usize;

    for v in non_null.iter().take(TYPE_SAMPLE_CAP) {
        match v {
            Value::Bool(_) => bool_like += 1,
            Value::Number(n) => {
                if n.as_f64().is_some_and(f64::is_finite) {
                    number_like += 1;
                }
            }
            Value::Object(_) | Value::Array(_) => object_like += 1,
            Value::String(s) => {
                let s = s.trim();
                if s.is_empty() {
                    continue;
                }
                if s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("false") {
                    bool_like += 1;
                } else if parse_number_str(s).is_some() {
                    number_like += 1;
                } else if looks_like_date_string(s)
                    && timeutil::parse_date_value(&Value::String(s.to_string())).is_some()
                {
                    date_like += 1;
                }
            }
            Value::Null => {}
        }
    }

    let n = non_null.len().min(TYPE_SAMPLE_CAP).max(1) as f64;
    if object_like > 0 {
        ColumnType::Object
    } else if date_like as f64 / n >= DATE_RATIO {
        ColumnType::Date
    } else if bool_like as f64 / n >= BOOL_RATIO {
        ColumnType::Boolean
    } else if number_like as f64 / n >= NUMBER_RATIO {
        ColumnType::Number
    } else {
        ColumnType::String
    }
}

/// First-seen distinct values, deduplicated by their canonical distinct key.
pub fn limit_high_cardinality<'a, I>(values: I, limit: usize) -> Vec<Value>
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut out = Vec::new();
    let mut seen: FxHashSet<String> = FxHashSet::default();
    for v in values {
        if !seen.insert(distinct_key(v)) {
            continue;
        }
        out.push(v.clone());
        if out.len() >= limit {
            break;
        }
    }
    out
}

/// Stride-based (never random) row sample indices: evenly spaced, in input
/// order, at most `max_rows` of them.
pub fn stable_sample_indices(len: usize, max_rows: usize) -> Vec<usize> {
    if len <= max_rows {
        return (0..len).collect();
    }
    let stride = (len / max_rows).max(1);
    (0..len).step_by(stride).take(max_rows).collect()
}

/// Infer the schema of already-normalized rows: union of column names (in
/// sorted order), per-column nullability, inferred type, and up to
/// `sample_values_limit` distinct sample values in first-seen order.
pub fn infer_schema(
    rows: &[Row],
    sample_row_limit: usize,
    sample_values_limit: usize,
) -> Vec<ColumnDef> {
    let indices = stable_sample_indices(rows.len(), sample_row_limit.max(1));
    let mut names: BTreeSet<&str> = BTreeSet::new();
    for &i in &indices {
        for key in rows[i].keys() {
            names.insert(key);
        }
    }

    let mut schema = Vec::with_capacity(names.len());
    for name in names {
        let values: Vec<&Value> = indices
            .iter()
            .filter_map(|&i| rows[i].get(name))
            .collect();
        let nullable = values.iter().any(|v| is_null_like(v));
        let inferred_type = detect_type(values.iter().copied());
        let sample_values = limit_high_cardinality(
            values.iter().copied().filter(|v| !is_null_like(v)),
            sample_values_limit,
        );
        schema.push(ColumnDef {
            name: name.to_string(),
            inferred_type,
            nullable,
            sample_values,
        });
    }
    schema
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_basics() {
        assert_eq!(sanitize_column_name("  Total Sales ($) "), "Total_Sales");
        assert_eq!(sanitize_column_name("2024 revenue"), "col_2024_revenue");
        assert_eq!(sanitize_column_name(""), "column");
        assert_eq!(sanitize_column_name("!!!"), "column");
        assert_eq!(sanitize_column_name("a____b"), "a__b");
        assert_eq!(sanitize_column_name("order__item"), "order__item");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for raw in [
            "  Total Sales ($) ",
            "2024 revenue",
            "a____b",
            "__x__",
            "naïve column",
            "\u{0001}ctl",
            "",
        ] {
            let once = sanitize_column_name(raw);
            assert_eq!(sanitize_column_name(&once), once, "input {raw:?}");
        }
    }

    #[test]
    fn flatten_nests_with_double_underscore() {
        let rec = json!({
            "order": {"id": 7, "customer": {"name": "Ada"}},
            "tags": ["a", "b"],
            "empty": {},
            "note": null
        });
        let row = flatten_record(&rec);
        assert_eq!(row.get("order__id"), Some(&json!(7)));
        assert_eq!(row.get("order__customer__name"), Some(&json!("Ada")));
        assert_eq!(row.get("tags"), Some(&json!("[\"a\",\"b\"]")));
        assert_eq!(row.get("empty"), Some(&json!("{}")));
        assert_eq!(row.get("note"), Some(&Value::Null));
    }

    #[test]
    fn flatten_scalar_and_null_roots() {
        assert_eq!(flatten_record(&json!(5)).get("value"), Some(&json!(5)));
        assert!(flatten_record(&Value::Null).is_empty());
    }

    #[test]
    fn normalize_date_converts_epochs_not_ids() {
        let ms = normalize_date(&json!(1_609_459_200_000i64));
        assert_eq!(ms, json!("2021-01-01T00:00:00.000Z"));
        let secs = normalize_date(&json!(1_609_459_200));
        assert_eq!(secs, json!("2021-01-01T00:00:00.000Z"));
        // Small numbers (IDs, years) pass through untouched.
        assert_eq!(normalize_date(&json!(2024)), json!(2024));
        assert_eq!(normalize_date(&json!("123456")), json!("123456"));
    }

    #[test]
    fn detect_type_threshold_ordering() {
        let dates: Vec<Value> = (1..=10).map(|d| json!(format!("2024-01-{d:02}"))).collect();
        assert_eq!(detect_type(dates.iter()), ColumnType::Date);

        let mixed = [json!("1"), json!("2"), json!("3"), json!("4"), json!("x")];
        assert_eq!(detect_type(mixed.iter()), ColumnType::Number);

        let weak = [json!("1"), json!("2"), json!("x"), json!("y")];
        assert_eq!(detect_type(weak.iter()), ColumnType::String);

        let bools = [json!("true"), json!("FALSE"), json!(true), json!("true"), json!(false)];
        assert_eq!(detect_type(bools.iter()), ColumnType::Boolean);

        // Any structured sample wins regardless of other ratios.
        let objs = [json!({"a": 1}), json!("2024-01-01"), json!("2024-01-02")];
        assert_eq!(detect_type(objs.iter()), ColumnType::Object);
    }

    #[test]
    fn infer_schema_unions_and_sorts_columns() {
        let rows = normalize_records(
            &[
                json!({"b": 1, "a": "x"}),
                json!({"a": "", "c": {"d": true}}),
            ],
            None,
        );
        let schema = infer_schema(&rows, 2_000, 25);
        let names: Vec<&str> = schema.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c__d"]);
        let a = &schema[0];
        assert!(a.nullable);
        assert_eq!(a.inferred_type, ColumnType::String);
        assert_eq!(schema[1].inferred_type, ColumnType::Number);
        assert_eq!(schema[2].inferred_type, ColumnType::Boolean);
    }

    #[test]
    fn stable_sample_is_strided_and_deterministic() {
        let idx = stable_sample_indices(10, 3);
        assert_eq!(idx, vec![0, 3, 6]);
        assert_eq!(stable_sample_indices(2, 5), vec![0, 1]);
        assert_eq!(stable_sample_indices(0, 5), Vec::<usize>::new());
    }
}
