use crate::models::{DecisionStatus, Impairment, ReasonCode, StageKind, StageResults};
use crate::rules::FraudPolicy;

/// 加权平均: 只计已执行阶段, 跳过阶段的权重按比例分摊给其余阶段
pub fn overall_confidence(results: &StageResults) -> f64 {
    let executed = results.executed_confidences();
    let total_weight: f64 = executed.iter().map(|(kind, _)| kind.weight()).sum();
    if total_weight <= 0.0 {
        return 0.0;
    }
    let weighted: f64 = executed
        .iter()
        .map(|(kind, c)| kind.weight() * c.clamp(0.0, 100.0))
        .sum();
    round2(weighted / total_weight)
}

fn round2(v: f64) -> f64 {
    ((v * 100.0).round() / 100.0).clamp(0.0, 100.0)
}

/// 决策映射
///
/// 不合规或风险分 >= reject_threshold => REJECTED;
/// 风险分落在 [review_threshold, reject_threshold), 任一阶段降级/跳过,
/// 或付款未对上 => NEEDS_REVIEW; 否则 APPROVED
pub fn decide(results: &StageResults, policy: &FraudPolicy) -> (DecisionStatus, Vec<ReasonCode>) {
    let mut reasons = Vec::new();

    if results.extraction.is_none() {
        return (DecisionStatus::Rejected, vec![ReasonCode::ExtractionFailed]);
    }

    if let Some(verdict) = results.compliance.as_ref().and_then(|o| o.value()) {
        if !verdict.is_compliant {
            reasons.push(ReasonCode::NonCompliant);
        }
    }

    if let Some(signal) = results.fraud.as_ref().and_then(|o| o.value()) {
        if signal.risk_score >= policy.reject_threshold {
            reasons.push(ReasonCode::HighFraudRisk);
        } else if signal.risk_score >= policy.review_threshold {
            reasons.push(ReasonCode::ElevatedFraudRisk);
        }
    }

    // 必须执行的阶段缺席按跳过处理
    let mandatory_missing = results.compliance.is_none() || results.fraud.is_none();
    if mandatory_missing {
        reasons.push(ReasonCode::StageSkipped);
    }

    for (kind, impairment) in results.impaired_stages() {
        let code = match (kind, impairment) {
            (StageKind::Reconciliation, Impairment::Skipped) => ReasonCode::ReconciliationSkipped,
            (_, Impairment::Skipped) => ReasonCode::StageSkipped,
            (_, Impairment::Degraded) => ReasonCode::StageDegraded,
        };
        if !reasons.contains(&code) {
            reasons.push(code);
        }
    }

    if let Some(m) = results.reconciliation.as_ref().and_then(|o| o.value()) {
        if !m.matched {
            reasons.push(ReasonCode::PaymentMismatch);
        }
    }

    let rejected = reasons
        .iter()
        .any(|r| matches!(r, ReasonCode::NonCompliant | ReasonCode::HighFraudRisk));
    let status = if rejected {
        DecisionStatus::Rejected
    } else if reasons.is_empty() {
        DecisionStatus::Approved
    } else {
        DecisionStatus::NeedsReview
    };
    (status, reasons)
}
