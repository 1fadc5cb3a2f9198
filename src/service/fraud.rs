use crate::models::{Anomaly, AnomalyType, FraudSignal, InvoiceDraft, MarketVerdict, Severity};
use crate::rules::FraudPolicy;

/// 欺诈评分 (纯函数, 相同输入必得相同结果)
///
/// - 市场价偏离超过 `price_anomaly_pct` => PRICE_ANOMALY / HIGH
/// - 总额超过 `high_value_threshold` => HIGH_VALUE / MEDIUM
/// - 风险分 = 各异常权重之和, 上限 100; 无异常时为 baseline
pub fn score(draft: &InvoiceDraft, market: Option<&MarketVerdict>, policy: &FraudPolicy) -> FraudSignal {
    let mut anomalies = Vec::new();

    if let Some(variance) = market.and_then(|m| m.variance_pct) {
        if variance.abs() > policy.price_anomaly_pct {
            anomalies.push(Anomaly {
                kind: AnomalyType::PriceAnomaly,
                severity: Severity::High,
                message: format!(
                    "paid amount deviates {:+.2}% from the market reference (limit ±{}%)",
                    variance, policy.price_anomaly_pct
                ),
            });
        }
    }

    if draft.total > policy.high_value_threshold {
        anomalies.push(Anomaly {
            kind: AnomalyType::HighValue,
            severity: Severity::Medium,
            message: format!(
                "invoice total {} {} exceeds the high-value threshold {}",
                draft.total, draft.currency, policy.high_value_threshold
            ),
        });
    }

    let risk_score = if anomalies.is_empty() {
        policy.baseline.max(1)
    } else {
        let sum: u32 = anomalies
            .iter()
            .map(|a| match a.severity {
                Severity::High => policy.high_weight,
                Severity::Medium => policy.medium_weight,
                Severity::Low => policy.low_weight,
            })
            .sum();
        sum.min(100) as u8
    };

    FraudSignal {
        risk_score,
        anomalies,
    }
}

/// 规则置信度: 风险越高越低
pub fn rule_confidence(signal: &FraudSignal) -> f64 {
    100.0 - f64::from(signal.risk_score)
}
