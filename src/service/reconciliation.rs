use crate::models::{InvoiceDraft, MatchType, Payment, ReconciliationMatch};
use crate::money::to_f64;
use crate::rules::ReconciliationPolicy;
use bigdecimal::{BigDecimal, Zero};

/// 发票与付款对账 (纯函数)
pub fn reconcile(draft: &InvoiceDraft, payment: &Payment, policy: &ReconciliationPolicy) -> ReconciliationMatch {
    let difference = (&draft.total - &payment.amount).abs();
    let relative = if draft.total > BigDecimal::zero() {
        (to_f64(&difference) / to_f64(&draft.total)).min(1.0)
    } else if difference.is_zero() {
        0.0
    } else {
        1.0
    };

    let currency_mismatch = !draft.currency.is_empty()
        && !payment.currency.trim().is_empty()
        && !draft.currency.eq_ignore_ascii_case(payment.currency.trim());
    let reference_matches = draft
        .invoice_number
        .as_deref()
        .map(|n| n.trim().eq_ignore_ascii_case(payment.reference.trim()))
        .unwrap_or(false);

    let mut suggestions = Vec::new();

    let (matched, match_type, confidence) = if currency_mismatch {
        suggestions.push(format!(
            "Check currency mismatch: payment in {}, invoice in {}",
            payment.currency, draft.currency
        ));
        (false, MatchType::Unclear, 50.0 * (1.0 - relative))
    } else if difference.is_zero() {
        (true, MatchType::Exact, 100.0)
    } else if difference <= policy.tolerance {
        // 按相对差额等比下调, 保持高于 UNCLEAR
        (true, MatchType::Partial, (100.0 * (1.0 - relative)).clamp(51.0, 99.0))
    } else {
        if payment.amount < draft.total {
            suggestions.push(format!(
                "Check for partial payment: {} outstanding",
                difference
            ));
        } else {
            suggestions.push(format!(
                "Check for overpayment or duplicate charge: {} excess",
                difference
            ));
        }
        suggestions.push("Confirm the payment currency matches the invoice currency".to_string());
        (false, MatchType::Unclear, 50.0 * (1.0 - relative))
    };

    if !reference_matches {
        suggestions.insert(
            0,
            format!(
                "Verify payment reference '{}' against invoice number '{}'",
                payment.reference,
                draft.invoice_number.as_deref().unwrap_or("<missing>")
            ),
        );
    }

    ReconciliationMatch {
        matched,
        match_type,
        difference,
        confidence,
        suggestions,
        payment_id: payment.payment_id.clone(),
    }
}
