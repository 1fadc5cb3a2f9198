use crate::models::{normalize_product_key, InvoiceDraft, MarketVerdict, Recommendation};
use crate::money::{round_to, to_f64};
use crate::rules::{MarketPolicy, RuleTables};
use bigdecimal::{BigDecimal, Zero};

/// 市场价比对 (纯函数)
///
/// variancePct = (paid - referenceAvg) / referenceAvg × 100;
/// 目录无此商品时返回 UNKNOWN, 不算失败
pub fn analyze(
    product_key: Option<&str>,
    paid_amount: &BigDecimal,
    rules: &RuleTables,
) -> MarketVerdict {
    let key = product_key.map(normalize_product_key);
    let reference = key
        .as_deref()
        .and_then(|k| rules.reference_price(k))
        .filter(|r| **r > BigDecimal::zero());

    let Some(reference_avg) = reference else {
        return MarketVerdict {
            product_key: key,
            reference_avg: None,
            paid_amount: paid_amount.clone(),
            variance_pct: None,
            recommendation: Recommendation::Unknown,
        };
    };

    let diff = (paid_amount - reference_avg) * BigDecimal::from(100);
    let variance = &diff / reference_avg;
    let variance_pct = to_f64(&round_to(&variance, 4));

    MarketVerdict {
        product_key: key,
        reference_avg: Some(reference_avg.clone()),
        paid_amount: paid_amount.clone(),
        variance_pct: Some(variance_pct),
        recommendation: recommend(variance_pct, &rules.market),
    }
}

/// 按草稿取商品键与成交单价后比对
pub fn analyze_draft(draft: &InvoiceDraft, rules: &RuleTables) -> MarketVerdict {
    let paid = paid_unit_price(draft);
    analyze(draft.product_key().as_deref(), &paid, rules)
}

/// 比对用单价: 首个明细的单价 (或金额/数量), 否则发票小计
fn paid_unit_price(draft: &InvoiceDraft) -> BigDecimal {
    match draft.line_items.first() {
        Some(item) => match &item.unit_price {
            Some(p) => p.clone(),
            None if item.quantity > BigDecimal::zero() => &item.amount / &item.quantity,
            None => item.amount.clone(),
        },
        None => draft.subtotal.clone(),
    }
}

fn recommend(variance_pct: f64, policy: &MarketPolicy) -> Recommendation {
    if variance_pct > policy.overpriced_pct {
        Recommendation::Overpriced
    } else if variance_pct < policy.great_deal_pct {
        Recommendation::GreatDeal
    } else {
        Recommendation::FairPrice
    }
}

/// 规则置信度: 有参考价 100, 数据不足 50
pub fn rule_confidence(verdict: &MarketVerdict) -> f64 {
    if verdict.reference_avg.is_some() {
        100.0
    } else {
        50.0
    }
}
