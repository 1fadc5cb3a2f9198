pub mod handlers;

pub use handlers::*;

use crate::service::Orchestrator;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// 路由: 每个接口一对一委托给编排器
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/jobs", post(submit_job))
        .route("/api/jobs/:id", get(get_decision))
        .route("/api/jobs/:id/audit", get(audit_log))
        .route("/api/jobs/:id/cancel", post(cancel_job))
        .route("/api/jobs/:id/reprocess", post(reprocess_job))
        .route("/api/payments", post(notify_payment))
        .route("/api/rules/reload", post(reload_rules))
        .with_state(orchestrator)
}
