use std::time::Duration;
use thiserror::Error;

/// 提交阶段校验失败: 任务不会进入 QUEUED
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("job payload is empty")]
    EmptyPayload,
    #[error("job kind {kind} does not match payload type")]
    KindMismatch { kind: String },
    #[error("webhook payload must be a JSON object")]
    NotAnObject,
    #[error("webhook payload missing required fields: {}", .0.join(", "))]
    MissingWebhookFields(Vec<String>),
    #[error("unsupported mime type for document job: {0}")]
    UnsupportedMimeType(String),
}

/// 外部协作方 (OCR / 叙述 / 模型) 调用错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("collaborator timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed collaborator response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            CollaboratorError::Malformed(e.to_string())
        } else {
            CollaboratorError::Unavailable(e.to_string())
        }
    }
}

/// 抽取失败: 对任务是致命的
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExtractionFailure {
    #[error("ocr collaborator failed: {0}")]
    Collaborator(#[from] CollaboratorError),
    #[error("required fields missing: {}", .0.join(", "))]
    MissingFields(Vec<String>),
    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// 持久化协作方错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("csv export error: {0}")]
    Csv(#[from] csv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 规则表加载错误
#[derive(Debug, Error)]
pub enum RulesError {
    #[error("cannot load rule tables: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid rule tables: {0}")]
    Invalid(String),
}

/// 编排器对外错误
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Rules(#[from] RulesError),
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("job {0} is still in flight")]
    JobInFlight(String),
}
