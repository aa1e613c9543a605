//! Declarative schema expectations
//!
//! An expectation lists the tables a tenant database must have, the columns
//! and indexes each must carry, the columns each must not carry, and tables
//! that must be gone. It is written ahead of time as JSON or built in code:
//!
//! ```json
//! {
//!   "tables": [
//!     { "name": "members", "required_columns": ["tenant_user_id"], "forbidden_columns": ["password"] }
//!   ],
//!   "absent_tables": ["legacy_users"]
//! }
//! ```

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaExpectation {
    #[serde(default)]
    pub tables: Vec<TableExpectation>,
    #[serde(default)]
    pub absent_tables: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableExpectation {
    pub name: String,
    #[serde(default)]
    pub required_columns: Vec<String>,
    #[serde(default)]
    pub forbidden_columns: Vec<String>,
    #[serde(default)]
    pub required_indexes: Vec<String>,
}

impl SchemaExpectation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: TableExpectation) -> Self {
        self.tables.push(table);
        self
    }

    pub fn absent(mut self, table: &str) -> Self {
        self.absent_tables.push(table.to_string());
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let expectation: Self = serde_json::from_str(json).map_err(|e| GatewayError::ExpectationInvalid {
            cause: e.to_string(),
        })?;
        expectation.validate()?;
        Ok(expectation)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|e| GatewayError::ExpectationInvalid {
            cause: format!("Failed to read {:?}: {}", path, e),
        })?;
        Self::from_json(&json)
    }

    /// Reject expectations that could never pass
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();

        for table in &self.tables {
            if table.name.trim().is_empty() {
                return Err(invalid("table name must not be empty".to_string()));
            }
            if !seen.insert(table.name.as_str()) {
                return Err(invalid(format!("table {} is listed twice", table.name)));
            }
            if let Some(col) = table
                .required_columns
                .iter()
                .find(|c| table.forbidden_columns.contains(*c))
            {
                return Err(invalid(format!(
                    "column {}.{} is both required and forbidden",
                    table.name, col
                )));
            }
        }

        if let Some(name) = self.absent_tables.iter().find(|t| seen.contains(t.as_str())) {
            return Err(invalid(format!("table {} is both expected and absent", name)));
        }

        Ok(())
    }
}

impl TableExpectation {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn requires(mut self, columns: &[&str]) -> Self {
        self.required_columns.extend(columns.iter().map(|c| c.to_string()));
        self
    }

    pub fn forbids(mut self, columns: &[&str]) -> Self {
        self.forbidden_columns.extend(columns.iter().map(|c| c.to_string()));
        self
    }

    pub fn indexed_by(mut self, indexes: &[&str]) -> Self {
        self.required_indexes.extend(indexes.iter().map(|i| i.to_string()));
        self
    }
}

fn invalid(cause: String) -> GatewayError {
    GatewayError::ExpectationInvalid { cause }
}
