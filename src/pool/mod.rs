mod manager;
mod router;

pub use manager::PoolManager;
pub use router::{is_valid_identifier, sanitize_identifier, DatabaseRouter};
