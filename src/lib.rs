pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod money;
pub mod rules;
pub mod service;

pub use config::AppConfig;
pub use db::{create_pool, DecisionStore, MemoryStore, PgDecisionStore};
pub use error::PipelineError;
pub use rules::{RuleStore, RuleTables};
pub use service::{Collaborators, Correlation, Orchestrator};
