//! Loose-value helpers shared across the pipeline.
//!
//! Canonical rows carry [`serde_json::Value`] cells; every stage that reads
//! them goes through these functions so that null-likeness, numeric parsing,
//! and distinct-key normalization stay consistent end to end.

use serde_json::Value;

/// True for the values every stage treats as "no data": JSON null and the
/// empty string.
pub fn is_null_like(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Canonical key used for distinct counting and row fingerprints.
///
/// Strings pass through, scalars render via `to_string`, and anything
/// structured falls back to its JSON form. Null-like values map to the empty
/// key.
pub fn distinct_key(v: &Value) -> String {
    if is_null_like(v) {
        return String::new();
    }
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_json::to_string(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// Parse a cell as a finite number, tolerating currency symbols, thousands
/// separators, and stray whitespace in string cells. Returns `None` for
/// null-like values and anything that does not parse cleanly.
pub fn parse_number(v: &Value) -> Option<f64> {
    if is_null_like(v) {
        return None;
    }
    match v {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::Bool(_) => None,
        Value::String(s) => parse_number_str(s),
        _ => None,
    }
}

/// String form of [`parse_number`], applied after `$`/`,`/whitespace
/// stripping.
pub fn parse_number_str(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    let cleaned: String = trimmed
        .chars()
        .filter(|c| *c != '$' && *c != ',' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|f| f.is_finite())
}

/// Group key for a dimension cell: null-like becomes `(missing)`, a
/// whitespace-only string becomes `(blank)`, everything else is its trimmed
/// string form.
pub fn group_key(v: &Value) -> String {
    if is_null_like(v) {
        return "(missing)".to_string();
    }
    let s = match v {
        Value::String(s) => s.trim().to_string(),
        other => distinct_key(other),
    };
    if s.is_empty() {
        "(blank)".to_string()
    } else {
        s
    }
}

/// Clamp to [0, 1], mapping NaN/infinite input to 0.
pub fn clamp01(v: f64) -> f64 {
    if !v.is_finite() {
        return 0.0;
    }
    v.clamp(0.0, 1.0)
}
