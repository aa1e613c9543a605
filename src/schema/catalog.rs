use crate::engine::LedgerEntry;
use crate::error::{GatewayError, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

const MIGRATION_EXTENSIONS: &[&str] = &["sql", "pssql", "pgsql"];

/// One versioned migration script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: u32,
    pub name: String,
    pub sql: String,
    pub checksum: String,
}

impl Migration {
    pub fn new(version: u32, name: &str, sql: &str) -> Self {
        Self {
            version,
            name: name.to_string(),
            sql: sql.to_string(),
            checksum: compute_checksum(sql),
        }
    }
}

/// Hex SHA-256 of a script
pub fn compute_checksum(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

fn file_name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)_[A-Za-z0-9_\-]+\.[a-z]+$").expect("static regex"))
}

/// Ordered set of all known migrations, sorted by (version, name)
#[derive(Debug, Clone, Default)]
pub struct MigrationCatalog {
    migrations: Vec<Migration>,
}

impl MigrationCatalog {
    /// Load every `NNN_description.{sql,pssql,pgsql}` file from a directory.
    ///
    /// A missing directory yields an empty catalog. Other files are ignored.
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            debug!("Migrations directory {:?} does not exist, using empty catalog", dir);
            return Ok(Self::default());
        }

        let entries = fs::read_dir(dir).map_err(|e| GatewayError::CatalogInvalid {
            cause: format!("Failed to read migrations directory {:?}: {}", dir, e),
        })?;

        let mut migrations = Vec::new();

        for entry in entries {
            let entry = entry.map_err(|e| GatewayError::CatalogInvalid {
                cause: format!("Failed to read directory entry: {}", e),
            })?;

            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let is_migration = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| MIGRATION_EXTENSIONS.contains(&ext))
                .unwrap_or(false);
            if !is_migration {
                continue;
            }

            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => {
                    return Err(GatewayError::CatalogInvalid {
                        cause: format!("Non UTF-8 migration file name: {:?}", path),
                    })
                }
            };

            let version = parse_version(&name)?;

            let sql = fs::read_to_string(&path).map_err(|e| GatewayError::CatalogInvalid {
                cause: format!("Failed to read migration file {:?}: {}", path, e),
            })?;

            migrations.push(Migration::new(version, &name, &sql));
        }

        let catalog = Self::from_migrations(migrations)?;
        debug!("Loaded {} migrations from {:?}", catalog.len(), dir);
        Ok(catalog)
    }

    /// Build a catalog from in-code migrations, rejecting duplicate versions or names
    pub fn from_migrations(mut migrations: Vec<Migration>) -> Result<Self> {
        migrations.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.name.cmp(&b.name)));

        let mut versions = HashSet::new();
        let mut names = HashSet::new();
        for m in &migrations {
            if !versions.insert(m.version) {
                return Err(GatewayError::CatalogInvalid {
                    cause: format!("Duplicate migration version {} ({})", m.version, m.name),
                });
            }
            if !names.insert(m.name.as_str()) {
                return Err(GatewayError::CatalogInvalid {
                    cause: format!("Duplicate migration name {}", m.name),
                });
            }
        }

        Ok(Self { migrations })
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    pub fn get(&self, name: &str) -> Option<&Migration> {
        self.migrations.iter().find(|m| m.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.migrations.iter().map(|m| m.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Catalog minus ledger, in application order
    pub fn pending(&self, ledger: &[LedgerEntry]) -> Vec<&Migration> {
        let applied: HashSet<&str> = ledger.iter().map(|e| e.migration_name.as_str()).collect();
        self.migrations
            .iter()
            .filter(|m| !applied.contains(m.name.as_str()))
            .collect()
    }

    /// Ledger names the catalog does not know about
    pub fn unknown_in(&self, ledger: &[LedgerEntry]) -> Vec<String> {
        ledger
            .iter()
            .filter(|e| !self.contains(&e.migration_name))
            .map(|e| e.migration_name.clone())
            .collect()
    }
}

fn parse_version(name: &str) -> Result<u32> {
    let caps = file_name_pattern()
        .captures(name)
        .ok_or_else(|| GatewayError::CatalogInvalid {
            cause: format!(
                "Migration file {} must be named NNN_description.sql",
                name
            ),
        })?;

    caps[1].parse::<u32>().map_err(|e| GatewayError::CatalogInvalid {
        cause: format!("Invalid version in {}: {}", name, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;
    use tempfile::TempDir;

    fn entry(name: &str) -> LedgerEntry {
        LedgerEntry {
            migration_name: name.to_string(),
            checksum: String::new(),
            applied_at: Utc::now(),
        }
    }

    #[test]
    fn test_compute_checksum() {
        let checksum = compute_checksum("CREATE TABLE members (id SERIAL);");
        assert_eq!(checksum.len(), 64);
        assert_eq!(checksum, compute_checksum("CREATE TABLE members (id SERIAL);"));
        assert_ne!(checksum, compute_checksum("CREATE TABLE members (id INT);"));
    }

    #[test]
    fn test_load_orders_by_version() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("010_add_index.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("002_members.pssql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("001_init.pgsql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("README.md"), "docs").unwrap();

        let catalog = MigrationCatalog::load(dir.path()).unwrap();

        assert_eq!(
            catalog.names(),
            vec!["001_init.pgsql", "002_members.pssql", "010_add_index.sql"]
        );
        assert_eq!(catalog.migrations()[2].version, 10);
    }

    #[test]
    fn test_load_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let catalog = MigrationCatalog::load(&dir.path().join("nope")).unwrap();
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_unversioned_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("init.sql"), "SELECT 1;").unwrap();

        assert!(matches!(
            MigrationCatalog::load(dir.path()),
            Err(GatewayError::CatalogInvalid { .. })
        ));
    }

    #[test]
    fn test_duplicate_version_is_rejected() {
        let result = MigrationCatalog::from_migrations(vec![
            Migration::new(1, "001_a.sql", "SELECT 1;"),
            Migration::new(1, "001_b.sql", "SELECT 1;"),
        ]);
        assert!(matches!(result, Err(GatewayError::CatalogInvalid { .. })));
    }

    #[test]
    fn test_pending_and_unknown() {
        let catalog = MigrationCatalog::from_migrations(vec![
            Migration::new(2, "002_b.sql", "SELECT 1;"),
            Migration::new(1, "001_a.sql", "SELECT 1;"),
            Migration::new(3, "003_c.sql", "SELECT 1;"),
        ])
        .unwrap();

        let ledger = vec![entry("001_a.sql"), entry("999_gone.sql")];

        let pending: Vec<&str> = catalog
            .pending(&ledger)
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(pending, vec!["002_b.sql", "003_c.sql"]);
        assert_eq!(catalog.unknown_in(&ledger), vec!["999_gone.sql".to_string()]);
    }
}
