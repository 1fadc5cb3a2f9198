use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    Document,
    Webhook,
}

/// 任务原始输入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Document { bytes: Vec<u8>, mime_type: String },
    Webhook { body: serde_json::Value },
}

/// 任务请求 (接受后不可变)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub job_id: String,
    pub kind: JobKind,
    pub payload: JobPayload,
    /// 是否需要等待付款对账
    #[serde(default)]
    pub expect_payment: bool,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl JobRequest {
    pub fn document(job_id: impl Into<String>, bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            kind: JobKind::Document,
            payload: JobPayload::Document {
                bytes,
                mime_type: mime_type.into(),
            },
            expect_payment: false,
            received_at: Utc::now(),
        }
    }

    pub fn webhook(job_id: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            job_id: job_id.into(),
            kind: JobKind::Webhook,
            payload: JobPayload::Webhook { body },
            expect_payment: false,
            received_at: Utc::now(),
        }
    }

    pub fn expecting_payment(mut self) -> Self {
        self.expect_payment = true;
        self
    }
}

/// 独立到达的付款记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub payment_id: String,
    pub amount: BigDecimal,
    pub currency: String,
    /// 通常等于发票号
    pub reference: String,
    /// 显式关联的任务
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

/// 任务状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Extracting,
    Analyzing,
    WaitingPayment,
    Aggregating,
    Done,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Cancelled)
    }

    /// 合法状态迁移
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        if next == Cancelled {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Queued, Extracting)
                | (Extracting, Failed)
                | (Extracting, Analyzing)
                | (Analyzing, WaitingPayment)
                | (Analyzing, Aggregating)
                | (WaitingPayment, Aggregating)
                | (Aggregating, Done)
                | (Aggregating, Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "QUEUED",
            JobState::Extracting => "EXTRACTING",
            JobState::Analyzing => "ANALYZING",
            JobState::WaitingPayment => "WAITING_PAYMENT",
            JobState::Aggregating => "AGGREGATING",
            JobState::Done => "DONE",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}
