mod catalog;
mod expectation;
mod migration;
mod verifier;

pub use catalog::{compute_checksum, Migration, MigrationCatalog};
pub use expectation::{SchemaExpectation, TableExpectation};
pub use migration::{ChecksumMismatch, MigrationPlan, MigrationReport, MigrationRunner};
pub use verifier::{SchemaVerifier, SchemaViolation, VerificationReport};
