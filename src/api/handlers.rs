use crate::error::PipelineError;
use crate::models::{DecisionLookup, JobRequest, JobState, Payment};
use crate::service::{Correlation, Orchestrator};
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// 统一响应体
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
}

fn ok<T: Serialize>(status: StatusCode, message: impl Into<String>, data: T) -> Response {
    let response = ApiResponse {
        success: true,
        message: message.into(),
        data: Some(data),
    };
    (status, Json(response)).into_response()
}

fn fail(status: StatusCode, message: impl Into<String>) -> Response {
    let response: ApiResponse<()> = ApiResponse {
        success: false,
        message: message.into(),
        data: None,
    };
    (status, Json(response)).into_response()
}

fn error_response(e: PipelineError) -> Response {
    let status = match &e {
        PipelineError::Validation(_) | PipelineError::Rules(_) => StatusCode::BAD_REQUEST,
        PipelineError::JobNotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::JobInFlight(_) => StatusCode::CONFLICT,
        PipelineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("请求处理失败: {}", e);
    }
    fail(status, format!("Error: {}", e))
}

#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: String,
}

#[derive(Debug, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Reprocessed {
    pub job_id: String,
    pub version: u32,
}

#[derive(Debug, Serialize)]
pub struct PaymentAck {
    pub payment_id: String,
    pub delivered_to: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReloadRequest {
    pub path: Option<PathBuf>,
}

/// 健康检查
pub async fn health_check() -> &'static str {
    "OK"
}

/// 提交任务
pub async fn submit_job(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(request): Json<JobRequest>,
) -> Response {
    match orchestrator.submit_job(request).await {
        Ok(job_id) => ok(StatusCode::ACCEPTED, "Job accepted", JobAccepted { job_id }),
        Err(e) => error_response(e),
    }
}

/// 查询决策
pub async fn get_decision(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(job_id): Path<String>,
) -> Response {
    match orchestrator.get_decision(&job_id).await {
        Ok(DecisionLookup::Ready(decision)) => ok(StatusCode::OK, "Decision ready", decision),
        Ok(DecisionLookup::Pending(state)) => ok(
            StatusCode::ACCEPTED,
            format!("Job is {}", state),
            JobStatus {
                job_id,
                state,
                reason: None,
            },
        ),
        Ok(DecisionLookup::Cancelled) => ok(
            StatusCode::OK,
            "Job was cancelled",
            JobStatus {
                job_id,
                state: JobState::Cancelled,
                reason: None,
            },
        ),
        Ok(DecisionLookup::Failed { reason }) => ok(
            StatusCode::OK,
            "Job failed without a decision",
            JobStatus {
                job_id,
                state: JobState::Failed,
                reason: Some(reason),
            },
        ),
        Ok(DecisionLookup::NotFound) => fail(StatusCode::NOT_FOUND, format!("Job {} not found", job_id)),
        Err(e) => error_response(e),
    }
}

/// 审计日志
pub async fn audit_log(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(job_id): Path<String>,
) -> Response {
    match orchestrator.audit_log(&job_id).await {
        Ok(entries) if entries.is_empty() => {
            fail(StatusCode::NOT_FOUND, format!("No audit entries for job {}", job_id))
        }
        Ok(entries) => ok(StatusCode::OK, format!("{} audit entries", entries.len()), entries),
        Err(e) => error_response(e),
    }
}

/// 取消任务
pub async fn cancel_job(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(job_id): Path<String>,
) -> Response {
    if orchestrator.cancel_job(&job_id) {
        ok(StatusCode::ACCEPTED, "Cancellation requested", JobAccepted { job_id })
    } else {
        fail(StatusCode::NOT_FOUND, format!("Job {} is not in flight", job_id))
    }
}

/// 重新处理
pub async fn reprocess_job(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(job_id): Path<String>,
) -> Response {
    match orchestrator.reprocess_job(&job_id).await {
        Ok(version) => ok(
            StatusCode::ACCEPTED,
            format!("Reprocessing as version {}", version),
            Reprocessed { job_id, version },
        ),
        Err(e) => error_response(e),
    }
}

/// 付款通知
pub async fn notify_payment(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(payment): Json<Payment>,
) -> Response {
    let payment_id = payment.payment_id.clone();
    match orchestrator.notify_payment(payment) {
        Correlation::Delivered(job_id) => ok(
            StatusCode::OK,
            format!("Payment delivered to job {}", job_id),
            PaymentAck {
                payment_id,
                delivered_to: Some(job_id),
            },
        ),
        Correlation::Buffered => ok(
            StatusCode::ACCEPTED,
            "Payment buffered until its job waits for it",
            PaymentAck {
                payment_id,
                delivered_to: None,
            },
        ),
    }
}

/// 规则表热更新
pub async fn reload_rules(
    State(orchestrator): State<Arc<Orchestrator>>,
    body: Option<Json<ReloadRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    match orchestrator.reload_rules(request.path.as_deref()) {
        Ok(version) => ok(StatusCode::OK, format!("Rules reloaded: {}", version), version),
        Err(e) => error_response(e),
    }
}
