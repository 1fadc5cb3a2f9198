use crate::models::{
    ComplianceVerdict, FraudSignal, InvoiceDraft, JobState, MarketVerdict, Payment,
    ReconciliationMatch,
};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Extraction,
    Compliance,
    Fraud,
    Market,
    Reconciliation,
}

impl StageKind {
    /// 聚合权重 (合计 1.0)
    pub fn weight(self) -> f64 {
        match self {
            StageKind::Extraction => 0.30,
            StageKind::Compliance => 0.30,
            StageKind::Fraud => 0.20,
            StageKind::Market => 0.10,
            StageKind::Reconciliation => 0.10,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Extraction => "extraction",
            StageKind::Compliance => "compliance",
            StageKind::Fraud => "fraud",
            StageKind::Market => "market",
            StageKind::Reconciliation => "reconciliation",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 阶段结果: 成功 / 降级 (确定性兜底) / 跳过
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageOutcome<T> {
    Success { value: T, confidence: f64 },
    Degraded { value: T, confidence: f64, reason: String },
    Skipped { reason: String },
}

impl<T> StageOutcome<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            StageOutcome::Success { value, .. } | StageOutcome::Degraded { value, .. } => Some(value),
            StageOutcome::Skipped { .. } => None,
        }
    }

    /// 未执行的阶段没有置信度
    pub fn confidence(&self) -> Option<f64> {
        match self {
            StageOutcome::Success { confidence, .. } | StageOutcome::Degraded { confidence, .. } => {
                Some(*confidence)
            }
            StageOutcome::Skipped { .. } => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, StageOutcome::Degraded { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, StageOutcome::Skipped { .. })
    }
}

/// 各阶段结果, None 表示该阶段不适用或未到达
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageResults {
    pub extraction: Option<StageOutcome<InvoiceDraft>>,
    pub compliance: Option<StageOutcome<ComplianceVerdict>>,
    pub fraud: Option<StageOutcome<FraudSignal>>,
    pub market: Option<StageOutcome<MarketVerdict>>,
    pub reconciliation: Option<StageOutcome<ReconciliationMatch>>,
}

/// 阶段概况: (置信度, 是否降级, 是否跳过)
type Glance = (Option<f64>, bool, bool);

fn glance<T>(outcome: &Option<StageOutcome<T>>) -> Option<Glance> {
    outcome
        .as_ref()
        .map(|o| (o.confidence(), o.is_degraded(), o.is_skipped()))
}

/// 阶段受损方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Impairment {
    Degraded,
    Skipped,
}

impl StageResults {
    fn glances(&self) -> [(StageKind, Option<Glance>); 5] {
        [
            (StageKind::Extraction, glance(&self.extraction)),
            (StageKind::Compliance, glance(&self.compliance)),
            (StageKind::Fraud, glance(&self.fraud)),
            (StageKind::Market, glance(&self.market)),
            (StageKind::Reconciliation, glance(&self.reconciliation)),
        ]
    }

    /// (阶段, 置信度): 仅包含实际执行的阶段
    pub fn executed_confidences(&self) -> Vec<(StageKind, f64)> {
        self.glances()
            .into_iter()
            .filter_map(|(kind, p)| p.and_then(|(c, _, _)| c).map(|c| (kind, c)))
            .collect()
    }

    /// 降级或跳过的阶段
    pub fn impaired_stages(&self) -> Vec<(StageKind, Impairment)> {
        self.glances()
            .into_iter()
            .filter_map(|(kind, p)| match p {
                Some((_, _, true)) => Some((kind, Impairment::Skipped)),
                Some((_, true, _)) => Some((kind, Impairment::Degraded)),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionStatus {
    Approved,
    NeedsReview,
    Rejected,
}

/// 机器可读的原因码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    ExtractionFailed,
    NonCompliant,
    HighFraudRisk,
    ElevatedFraudRisk,
    StageDegraded,
    StageSkipped,
    ReconciliationSkipped,
    PaymentMismatch,
}

/// 审计日志条目, 每次状态迁移/阶段事件一条
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub job_id: String,
    pub seq: u32,
    pub at: DateTime<Utc>,
    pub state: JobState,
    pub stage: Option<StageKind>,
    pub event: String,
    pub detail: Option<String>,
}

/// 最终决策 (写入后不可变, 重算只会提升 version)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub job_id: String,
    pub version: u32,
    pub status: DecisionStatus,
    pub reasons: Vec<ReasonCode>,
    pub stage_results: StageResults,
    pub overall_confidence: f64,
    pub rules_version: Option<String>,
    /// 叙述文本, 仅供审计展示
    #[serde(default)]
    pub narratives: IndexMap<StageKind, String>,
    /// 对账使用的付款, 重新处理时复用
    #[serde(default)]
    pub payment: Option<Payment>,
    pub created_at: DateTime<Utc>,
    pub audit_log: Vec<AuditEntry>,
}

/// getDecision 查询结果
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionLookup {
    Ready(Decision),
    Pending(JobState),
    Cancelled,
    /// 任务已终结但没有决策 (如决策写入失败)
    Failed { reason: String },
    NotFound,
}
