use crate::models::{ComplianceVerdict, InvoiceDraft, TaxLine};
use crate::money::{round_to, within_minor_unit};
use crate::rules::{CrossBorderRule, Jurisdiction, RuleTables};
use bigdecimal::{BigDecimal, Zero};

/// 规则表中没有的辖区使用的必填字段
const FALLBACK_REQUIRED_FIELDS: &[&str] = &["invoice_number", "issue_date", "customer_name"];

/// 规则计算的合规结论及其置信度
#[derive(Debug, Clone, PartialEq)]
pub struct ComplianceAssessment {
    pub verdict: ComplianceVerdict,
    pub confidence: f64,
    /// 非空表示只能做降级计算
    pub degraded: Option<String>,
}

/// 合规检查 (纯函数): 税额计算 + 必填字段 + 跨境规则
pub fn check(draft: &InvoiceDraft, rules: &RuleTables) -> ComplianceVerdict {
    match rules.jurisdiction(&draft.country) {
        Some(j) => check_with(draft, &draft.country.to_ascii_uppercase(), j),
        None => check_unknown(draft),
    }
}

/// check + 规则置信度: 每缺一个必填字段扣 15 分, 未知辖区 50 分
pub fn assess(draft: &InvoiceDraft, rules: &RuleTables) -> ComplianceAssessment {
    let verdict = check(draft, rules);
    if rules.jurisdiction(&draft.country).is_none() {
        return ComplianceAssessment {
            verdict,
            confidence: 50.0,
            degraded: Some(format!("no rule table entry for jurisdiction '{}'", draft.country)),
        };
    }
    let penalty = 15.0 * verdict.missing_fields.len() as f64;
    ComplianceAssessment {
        confidence: (100.0 - penalty).max(10.0),
        verdict,
        degraded: None,
    }
}

fn check_with(draft: &InvoiceDraft, code: &str, j: &Jurisdiction) -> ComplianceVerdict {
    let mut warnings = Vec::new();

    let missing_fields: Vec<String> = j
        .required_fields
        .iter()
        .filter(|f| !draft.has_field(f))
        .cloned()
        .collect();

    let reverse_charge = j.cross_border_rule == CrossBorderRule::ReverseCharge
        && draft.is_cross_border()
        && draft.customer_tax_id.as_deref().map(is_valid_tax_id).unwrap_or(false);

    // 分项分别舍入到最小货币单位后再求和
    let tax_breakdown: Vec<TaxLine> = j
        .components
        .iter()
        .map(|c| TaxLine {
            label: c.label.clone(),
            rate: c.rate.clone(),
            amount: if reverse_charge {
                BigDecimal::zero()
            } else {
                round_to(&(&draft.subtotal * &c.rate), j.minor_units)
            },
        })
        .collect();
    let computed_tax = tax_breakdown
        .iter()
        .fold(BigDecimal::zero(), |acc, line| acc + &line.amount);
    let computed_total = &draft.subtotal + &computed_tax;

    if reverse_charge {
        warnings.push(format!(
            "ReverseCharge: {} liability shifts to the buyer ({})",
            j.tax_label,
            draft.buyer_country.as_deref().unwrap_or_default()
        ));
    }

    let tax_ok = match &draft.tax_amount {
        Some(declared) if within_minor_unit(declared, &computed_tax, j.minor_units) => true,
        Some(declared) => {
            warnings.push(format!(
                "TaxMismatch: declared {} but {} computes {}",
                declared, j.tax_label, computed_tax
            ));
            false
        }
        None => {
            warnings.push(format!("TaxNotDeclared: computed {} {}", j.tax_label, computed_tax));
            true
        }
    };

    if draft.tax_amount.is_some() && !within_minor_unit(&draft.total, &computed_total, j.minor_units) {
        warnings.push(format!(
            "TotalMismatch: declared {} but subtotal + tax is {}",
            draft.total, computed_total
        ));
    }

    if draft.currency.is_empty() {
        warnings.push(format!("CurrencyMissing: assumed {}", j.currency));
    } else if !draft.currency.eq_ignore_ascii_case(&j.currency) {
        warnings.push(format!(
            "ForeignCurrency: invoice in {}, jurisdiction currency {}",
            draft.currency, j.currency
        ));
    }

    ComplianceVerdict {
        is_compliant: missing_fields.is_empty() && tax_ok,
        jurisdiction: code.to_string(),
        invoice_format: Some(j.invoice_format.clone()),
        tax_breakdown,
        computed_tax,
        computed_total,
        missing_fields,
        warnings,
        reverse_charge,
    }
}

/// 无规则时只做字段检查, 税额沿用票面声明
fn check_unknown(draft: &InvoiceDraft) -> ComplianceVerdict {
    let missing_fields: Vec<String> = FALLBACK_REQUIRED_FIELDS
        .iter()
        .filter(|f| !draft.has_field(f))
        .map(|f| f.to_string())
        .collect();
    let computed_tax = draft.tax_amount.clone().unwrap_or_else(BigDecimal::zero);

    ComplianceVerdict {
        is_compliant: missing_fields.is_empty(),
        jurisdiction: draft.country.to_ascii_uppercase(),
        invoice_format: None,
        tax_breakdown: Vec::new(),
        computed_total: &draft.subtotal + &computed_tax,
        computed_tax,
        missing_fields,
        warnings: vec![format!(
            "UnknownJurisdiction: no tax rules for '{}', declared tax not verified",
            draft.country
        )],
        reverse_charge: false,
    }
}

/// 税号格式检查: 去掉空格/连字符后 8-20 位字母数字
fn is_valid_tax_id(raw: &str) -> bool {
    let cleaned: String = raw.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();
    (8..=20).contains(&cleaned.len()) && cleaned.chars().all(|c| c.is_ascii_alphanumeric())
}
