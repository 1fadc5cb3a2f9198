pub mod pool;
pub mod queries;
pub mod store;

pub use pool::create_pool;
pub use queries::{export_audit_csv, PgDecisionStore};
pub use store::{DecisionStore, MemoryStore};
