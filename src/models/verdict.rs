use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

/// 税额分项 (如 CGST / SGST)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxLine {
    pub label: String,
    pub rate: BigDecimal,
    pub amount: BigDecimal,
}

/// 合规检查结论
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceVerdict {
    pub is_compliant: bool,
    pub jurisdiction: String,
    pub invoice_format: Option<String>,
    pub tax_breakdown: Vec<TaxLine>,
    pub computed_tax: BigDecimal,
    pub computed_total: BigDecimal,
    pub missing_fields: Vec<String>,
    pub warnings: Vec<String>,
    pub reverse_charge: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyType {
    PriceAnomaly,
    HighValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    #[serde(rename = "type")]
    pub kind: AnomalyType,
    pub severity: Severity,
    pub message: String,
}

/// 欺诈/异常评分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudSignal {
    pub risk_score: u8,
    pub anomalies: Vec<Anomaly>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    FairPrice,
    Overpriced,
    GreatDeal,
    Unknown,
}

/// 市场价比对结论
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketVerdict {
    pub product_key: Option<String>,
    /// 目录无此商品时为 None
    pub reference_avg: Option<BigDecimal>,
    pub paid_amount: BigDecimal,
    pub variance_pct: Option<f64>,
    pub recommendation: Recommendation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    Exact,
    Partial,
    Unclear,
}

/// 付款对账结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationMatch {
    pub matched: bool,
    pub match_type: MatchType,
    pub difference: BigDecimal,
    pub confidence: f64,
    pub suggestions: Vec<String>,
    pub payment_id: String,
}
