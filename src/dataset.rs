//! The canonical dataset: the flat tabular form all analysis operates on.
//!
//! Connectors (out of scope here) produce a [`CanonicalDataset`]; every
//! downstream stage treats it as read-only. A dataset whose rows reference
//! columns missing from the schema is a programming error in the producing
//! connector, surfaced as [`DatasetError`] rather than a data-quality
//! condition.

use std::collections::BTreeMap;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One normalized record: sanitized column name to loose cell value.
/// `BTreeMap` keeps iteration deterministic everywhere rows are walked.
pub type Row = BTreeMap<String, Value>;

/// Inferred storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Number,
    String,
    Date,
    Boolean,
    Object,
}

/// One schema entry produced by the normalizer. Immutable after inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    pub name: String,
    pub inferred_type: ColumnType,
    pub nullable: bool,
    #[serde(default)]
    pub sample_values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DatasetMetadata {
    #[serde(default)]
    pub source_type: String,
    #[serde(default)]
    pub source_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<String>,
    /// Row count at creation time. May diverge from `rows.len()` if a caller
    /// later truncates rows for display; nothing here assumes equality.
    pub row_count: usize,
}

/// Schema + rows + provenance. The input boundary of the whole pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalDataset {
    pub schema: Vec<ColumnDef>,
    pub rows: Vec<Row>,
    #[serde(default)]
    pub metadata: DatasetMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatasetError {
    #[error("row {row_idx} references column '{column}' that is not in the schema")]
    UnknownColumn { row_idx: usize, column: String },

    #[error("schema contains duplicate column name '{column}'")]
    DuplicateColumn { column: String },
}

impl CanonicalDataset {
    pub fn new(schema: Vec<ColumnDef>, rows: Vec<Row>, metadata: DatasetMetadata) -> Self {
        CanonicalDataset {
            schema,
            rows,
            metadata,
        }
    }

    /// Column lookup helper.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.schema.iter().find(|c| c.name == name)
    }

    /// Structural contract check: unique schema names, and every key present
    /// in any row appears in the schema.
    pub fn validate(&self) -> Result<(), DatasetError> {
        let mut names: FxHashSet<&str> = FxHashSet::default();
        for col in &self.schema {
            if !names.insert(col.name.as_str()) {
                return Err(DatasetError::DuplicateColumn {
                    column: col.name.clone(),
                });
            }
        }
        for (row_idx, row) in self.rows.iter().enumerate() {
            for key in row.keys() {
                if !names.contains(key.as_str()) {
                    return Err(DatasetError::UnknownColumn {
                        row_idx,
                        column: key.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn col(name: &str, ty: ColumnType) -> ColumnDef {
        ColumnDef {
            name: name.to_string(),
            inferred_type: ty,
            nullable: false,
            sample_values: Vec::new(),
        }
    }

    #[test]
    fn validate_accepts_well_formed_dataset() {
        let rows = vec![BTreeMap::from([
            ("amount".to_string(), json!(10)),
            ("region".to_string(), json!("East")),
        ])];
        let ds = CanonicalDataset::new(
            vec![col("amount", ColumnType::Number), col("region", ColumnType::String)],
            rows,
            DatasetMetadata::default(),
        );
        assert!(ds.validate().is_ok());
    }

    #[test]
    fn validate_rejects_row_key_outside_schema() {
        let rows = vec![BTreeMap::from([("ghost".to_string(), json!(1))])];
        let ds = CanonicalDataset::new(
            vec![col("amount", ColumnType::Number)],
            rows,
            DatasetMetadata::default(),
        );
        assert!(matches!(
            ds.validate(),
            Err(DatasetError::UnknownColumn { row_idx: 0, ref column }) if column == "ghost"
        ));
    }

    #[test]
    fn validate_rejects_duplicate_schema_names() {
        let ds = CanonicalDataset::new(
            vec![col("a", ColumnType::Number), col("a", ColumnType::String)],
            Vec::new(),
            DatasetMetadata::default(),
        );
        assert!(matches!(
            ds.validate(),
            Err(DatasetError::DuplicateColumn { ref column }) if column == "a"
        ));
    }
}
