//! Table schema: column names, declared types and domains.

use serde::{Deserialize, Serialize};

use crate::data::{DataType, Row, Value};
use crate::error::{Result, TableError};

/// Bounds and possible values of a column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnDomain {
    pub lower: Option<Value>,
    pub upper: Option<Value>,
    /// `None` when not tracked or when more values were seen than allowed.
    pub possible_values: Option<Vec<Value>>,
}

impl ColumnDomain {
    pub fn is_empty(&self) -> bool {
        self.lower.is_none() && self.upper.is_none() && self.possible_values.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub domain: ColumnDomain,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            domain: ColumnDomain::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<ColumnSpec>,
}

impl Schema {
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, index: usize) -> Option<&ColumnSpec> {
        self.columns.get(index)
    }

    /// Whether any column may hold blob cells.
    pub fn has_blob_columns(&self) -> bool {
        self.columns
            .iter()
            .any(|c| matches!(c.data_type, DataType::Blob(_) | DataType::Any))
    }

    /// Check cell count and the runtime type of every non-missing cell.
    pub fn validate_row(&self, row: &Row) -> Result<()> {
        if row.cells.len() != self.columns.len() {
            return Err(TableError::SchemaMismatch(format!(
                "row \"{}\" has {} cells, spec has {} columns",
                row.key,
                row.cells.len(),
                self.columns.len()
            )));
        }
        for (i, (cell, col)) in row.cells.iter().zip(&self.columns).enumerate() {
            if let Some(actual) = cell.data_type() {
                if !col.data_type.is_super_type_of(&actual) {
                    return Err(TableError::SchemaMismatch(format!(
                        "row \"{}\", column {} (\"{}\"): expected {:?}, got {:?}",
                        row.key, i, col.name, col.data_type, actual
                    )));
                }
            }
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────
