use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// 发票明细行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    /// 商品编码 (参考价目录键)
    pub product_code: Option<String>,
    pub quantity: BigDecimal,
    pub unit_price: Option<BigDecimal>,
    pub amount: BigDecimal,
}

/// 抽取阶段产出的发票草稿, 下游阶段只读
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceDraft {
    pub invoice_number: Option<String>,
    pub issue_date: Option<NaiveDate>,
    /// 卖方所在司法辖区 (ISO 国家码)
    pub country: String,
    pub buyer_country: Option<String>,
    pub customer_name: Option<String>,
    pub customer_tax_id: Option<String>,
    pub line_items: Vec<LineItem>,
    pub subtotal: BigDecimal,
    /// 票面声明税额, 缺省表示未声明
    pub tax_amount: Option<BigDecimal>,
    pub total: BigDecimal,
    pub currency: String,
    /// 字段置信度 0..100
    pub field_confidence: IndexMap<String, f64>,
}

impl InvoiceDraft {
    /// 检查字段是否存在 (规则表 required_fields 使用的字段名)
    pub fn has_field(&self, name: &str) -> bool {
        fn present(v: &Option<String>) -> bool {
            v.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false)
        }
        match name {
            "invoice_number" => present(&self.invoice_number),
            "issue_date" => self.issue_date.is_some(),
            "country" => !self.country.trim().is_empty(),
            "buyer_country" => present(&self.buyer_country),
            "customer_name" => present(&self.customer_name),
            "customer_tax_id" => present(&self.customer_tax_id),
            "line_items" => !self.line_items.is_empty(),
            "tax_amount" => self.tax_amount.is_some(),
            "currency" => !self.currency.trim().is_empty(),
            "subtotal" | "total" => true,
            _ => false,
        }
    }

    /// 市场价比对使用的商品键: 首个明细的商品编码, 否则描述
    pub fn product_key(&self) -> Option<String> {
        let item = self.line_items.first()?;
        let key = item
            .product_code
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or(&item.description);
        let key = normalize_product_key(key);
        (!key.is_empty()).then_some(key)
    }

    /// 是否跨境交易
    pub fn is_cross_border(&self) -> bool {
        self.buyer_country
            .as_deref()
            .map(|b| !b.trim().eq_ignore_ascii_case(self.country.trim()))
            .unwrap_or(false)
    }

    /// 字段置信度均值, 无记录时为 0
    pub fn mean_field_confidence(&self) -> f64 {
        if self.field_confidence.is_empty() {
            return 0.0;
        }
        self.field_confidence.values().sum::<f64>() / self.field_confidence.len() as f64
    }
}

/// 商品键归一化: 小写, 合并空白
pub fn normalize_product_key(raw: &str) -> String {
    raw.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}
