//! Schema Verifier
//!
//! Compares a live tenant database with a [`SchemaExpectation`] and collects
//! every violation instead of stopping at the first one. Violations are data,
//! not errors: the caller decides whether a non-empty report is fatal.

use crate::engine::{LiveSchema, TenantConnection};
use crate::error::Result;
use crate::schema::expectation::SchemaExpectation;
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaViolation {
    MissingTable { table: String },
    MissingColumn { table: String, column: String },
    ForbiddenColumn { table: String, column: String },
    MissingIndex { table: String, index: String },
    UnexpectedTable { table: String },
}

const HEADINGS: [&str; 5] = [
    "MISSING TABLES",
    "MISSING COLUMNS",
    "FORBIDDEN COLUMNS PRESENT",
    "MISSING INDEXES",
    "TABLES THAT SHOULD BE GONE",
];

impl SchemaViolation {
    pub fn table(&self) -> &str {
        match self {
            SchemaViolation::MissingTable { table }
            | SchemaViolation::MissingColumn { table, .. }
            | SchemaViolation::ForbiddenColumn { table, .. }
            | SchemaViolation::MissingIndex { table, .. }
            | SchemaViolation::UnexpectedTable { table } => table,
        }
    }

    fn heading(&self) -> &'static str {
        match self {
            SchemaViolation::MissingTable { .. } => HEADINGS[0],
            SchemaViolation::MissingColumn { .. } => HEADINGS[1],
            SchemaViolation::ForbiddenColumn { .. } => HEADINGS[2],
            SchemaViolation::MissingIndex { .. } => HEADINGS[3],
            SchemaViolation::UnexpectedTable { .. } => HEADINGS[4],
        }
    }
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaViolation::MissingTable { table } => write!(f, "table {} is missing", table),
            SchemaViolation::MissingColumn { table, column } => {
                write!(f, "{}: required column '{}' is missing", table, column)
            }
            SchemaViolation::ForbiddenColumn { table, column } => {
                write!(f, "{}: forbidden column '{}' is present", table, column)
            }
            SchemaViolation::MissingIndex { table, index } => {
                write!(f, "{}: required index '{}' is missing", table, index)
            }
            SchemaViolation::UnexpectedTable { table } => {
                write!(f, "table {} should have been removed", table)
            }
        }
    }
}

/// Result of schema verification
#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub database: String,
    pub passed: bool,
    pub violations: Vec<SchemaViolation>,
}

impl VerificationReport {
    pub fn new(database: &str, violations: Vec<SchemaViolation>) -> Self {
        Self {
            database: database.to_string(),
            passed: violations.is_empty(),
            violations,
        }
    }

    /// Generate a human-readable error log
    pub fn error_log(&self) -> String {
        let mut log = String::new();

        log.push_str("═══════════════════════════════════════════════════════════════\n");
        log.push_str(&format!("     SCHEMA VERIFICATION FAILED: {}\n", self.database));
        log.push_str("═══════════════════════════════════════════════════════════════\n\n");

        for heading in HEADINGS {
            let matching: Vec<&SchemaViolation> = self
                .violations
                .iter()
                .filter(|v| v.heading() == heading)
                .collect();
            if matching.is_empty() {
                continue;
            }
            log.push_str(&format!("{}:\n", heading));
            for v in matching {
                log.push_str(&format!("  - {}\n", v));
            }
            log.push('\n');
        }

        log.push_str("═══════════════════════════════════════════════════════════════\n");
        log.push_str("ACTION REQUIRED: Add migration(s) to fix schema drift\n");
        log.push_str("═══════════════════════════════════════════════════════════════\n");

        log
    }
}

pub struct SchemaVerifier;

impl SchemaVerifier {
    pub fn new() -> Self {
        Self
    }

    pub async fn verify<C: TenantConnection>(
        &self,
        conn: &mut C,
        expectation: &SchemaExpectation,
    ) -> Result<Vec<SchemaViolation>> {
        let schema = conn.introspect().await?;
        debug!(
            "Introspected {} tables in {}",
            schema.tables.len(),
            conn.database()
        );
        Ok(self.check(&schema, expectation))
    }

    pub async fn report<C: TenantConnection>(
        &self,
        conn: &mut C,
        expectation: &SchemaExpectation,
    ) -> Result<VerificationReport> {
        let violations = self.verify(conn, expectation).await?;
        let report = VerificationReport::new(conn.database(), violations);

        if report.passed {
            info!("Schema verification passed for {}", report.database);
        } else {
            warn!(
                "Schema verification found {} violations in {}",
                report.violations.len(),
                report.database
            );
        }

        Ok(report)
    }

    /// Pure comparison of an introspected schema with an expectation
    pub fn check(&self, schema: &LiveSchema, expectation: &SchemaExpectation) -> Vec<SchemaViolation> {
        let mut violations = Vec::new();

        for expected in &expectation.tables {
            let name = expected.name.to_lowercase();

            // A missing table is reported once; its columns are not listed again
            let Some(table) = schema.table(&name) else {
                violations.push(SchemaViolation::MissingTable { table: name });
                continue;
            };

            for column in &expected.required_columns {
                let column = column.to_lowercase();
                if !table.columns.contains(&column) {
                    violations.push(SchemaViolation::MissingColumn {
                        table: name.clone(),
                        column,
                    });
                }
            }

            for column in &expected.forbidden_columns {
                let column = column.to_lowercase();
                if table.columns.contains(&column) {
                    violations.push(SchemaViolation::ForbiddenColumn {
                        table: name.clone(),
                        column,
                    });
                }
            }

            for index in &expected.required_indexes {
                let index = index.to_lowercase();
                if !table.indexes.contains(&index) {
                    violations.push(SchemaViolation::MissingIndex {
                        table: name.clone(),
                        index,
                    });
                }
            }
        }

        for absent in &expectation.absent_tables {
            let name = absent.to_lowercase();
            if schema.has_table(&name) {
                violations.push(SchemaViolation::UnexpectedTable { table: name });
            }
        }

        violations
    }
}

impl Default for SchemaVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LiveTable;
    use crate::schema::expectation::TableExpectation;

    fn live(tables: Vec<(&str, Vec<&str>, Vec<&str>)>) -> LiveSchema {
        let mut schema = LiveSchema::default();
        for (name, columns, indexes) in tables {
            schema.tables.insert(
                name.to_string(),
                LiveTable {
                    columns: columns.iter().map(|c| c.to_string()).collect(),
                    indexes: indexes.iter().map(|i| i.to_string()).collect(),
                },
            );
        }
        schema
    }

    fn members_expectation() -> SchemaExpectation {
        SchemaExpectation::new().table(
            TableExpectation::new("members")
                .requires(&["tenant_user_id"])
                .forbids(&["password"]),
        )
    }

    #[test]
    fn test_matching_schema_has_no_violations() {
        let schema = live(vec![("members", vec!["id", "tenant_user_id"], vec!["members_pkey"])]);
        assert!(SchemaVerifier::new().check(&schema, &members_expectation()).is_empty());
    }

    #[test]
    fn test_missing_required_column() {
        let schema = live(vec![("members", vec!["id"], vec![])]);
        let violations = SchemaVerifier::new().check(&schema, &members_expectation());

        assert_eq!(
            violations,
            vec![SchemaViolation::MissingColumn {
                table: "members".to_string(),
                column: "tenant_user_id".to_string(),
            }]
        );
    }

    #[test]
    fn test_missing_table_reported_once() {
        let schema = live(vec![]);
        let violations = SchemaVerifier::new().check(&schema, &members_expectation());

        assert_eq!(
            violations,
            vec![SchemaViolation::MissingTable {
                table: "members".to_string()
            }]
        );
    }

    #[test]
    fn test_collects_every_violation() {
        let schema = live(vec![
            ("members", vec!["id", "password"], vec![]),
            ("legacy_users", vec!["id"], vec![]),
        ]);
        let expectation = SchemaExpectation::new()
            .table(
                TableExpectation::new("members")
                    .requires(&["tenant_user_id"])
                    .forbids(&["password"])
                    .indexed_by(&["idx_members_tenant_user"]),
            )
            .table(TableExpectation::new("invitations"))
            .absent("legacy_users");

        let violations = SchemaVerifier::new().check(&schema, &expectation);

        assert_eq!(violations.len(), 5);
        assert!(violations.contains(&SchemaViolation::ForbiddenColumn {
            table: "members".to_string(),
            column: "password".to_string(),
        }));
        assert!(violations.contains(&SchemaViolation::UnexpectedTable {
            table: "legacy_users".to_string(),
        }));
    }

    #[test]
    fn test_error_log() {
        let report = VerificationReport::new(
            "tenant_acme",
            vec![SchemaViolation::MissingColumn {
                table: "members".to_string(),
                column: "tenant_user_id".to_string(),
            }],
        );

        let log = report.error_log();

        assert!(!report.passed);
        assert!(log.contains("tenant_acme"));
        assert!(log.contains("MISSING COLUMNS"));
        assert!(log.contains("tenant_user_id"));
        assert!(!log.contains("MISSING TABLES"));
        assert!(log.contains("ACTION REQUIRED"));
    }
}
