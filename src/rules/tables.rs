use crate::error::RulesError;
use crate::models::normalize_product_key;
use crate::money::round_to;
use bigdecimal::{BigDecimal, Zero};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// 跨境规则
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrossBorderRule {
    #[default]
    None,
    ReverseCharge,
}

/// 税率分项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxComponent {
    pub label: String,
    pub rate: BigDecimal,
}

/// 单个司法辖区的税务/合规规则
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jurisdiction {
    pub tax_label: String,
    pub components: Vec<TaxComponent>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    pub invoice_format: String,
    #[serde(default)]
    pub cross_border_rule: CrossBorderRule,
    pub currency: String,
    #[serde(default = "default_minor_units")]
    pub minor_units: u32,
}

fn default_minor_units() -> u32 {
    2
}

impl Jurisdiction {
    /// 合计税率
    pub fn total_rate(&self) -> BigDecimal {
        self.components
            .iter()
            .fold(BigDecimal::zero(), |acc, c| acc + &c.rate)
    }
}

/// 欺诈评分阈值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FraudPolicy {
    /// |variancePct| 超过该值视为价格异常
    pub price_anomaly_pct: f64,
    pub high_value_threshold: BigDecimal,
    pub high_weight: u32,
    pub medium_weight: u32,
    pub low_weight: u32,
    /// 无异常时的残余风险
    pub baseline: u8,
    pub review_threshold: u8,
    pub reject_threshold: u8,
}

impl Default for FraudPolicy {
    fn default() -> Self {
        Self {
            price_anomaly_pct: 20.0,
            high_value_threshold: BigDecimal::from(100_000),
            high_weight: 40,
            medium_weight: 20,
            low_weight: 10,
            baseline: 5,
            review_threshold: 30,
            reject_threshold: 70,
        }
    }
}

/// 市场价区间
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketPolicy {
    pub overpriced_pct: f64,
    pub great_deal_pct: f64,
}

impl Default for MarketPolicy {
    fn default() -> Self {
        Self {
            overpriced_pct: 10.0,
            great_deal_pct: -5.0,
        }
    }
}

/// 对账容差 (银行手续费量级)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationPolicy {
    pub tolerance: BigDecimal,
}

impl Default for ReconciliationPolicy {
    fn default() -> Self {
        Self {
            tolerance: BigDecimal::from(5),
        }
    }
}

/// 版本化规则表: 纯数据, 运行时可整体替换
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTables {
    pub version: String,
    pub jurisdictions: IndexMap<String, Jurisdiction>,
    #[serde(default)]
    pub fraud: FraudPolicy,
    #[serde(default)]
    pub market: MarketPolicy,
    #[serde(default)]
    pub reconciliation: ReconciliationPolicy,
    /// 商品键 -> 参考均价
    #[serde(default)]
    pub reference_prices: IndexMap<String, BigDecimal>,
}

impl RuleTables {
    /// 按 ISO 国家码查找 (不区分大小写)
    pub fn jurisdiction(&self, country: &str) -> Option<&Jurisdiction> {
        self.jurisdictions.get(&country.trim().to_ascii_uppercase())
    }

    pub fn reference_price(&self, product_key: &str) -> Option<&BigDecimal> {
        self.reference_prices.get(&normalize_product_key(product_key))
    }

    /// 从外部文件加载 (TOML / JSON / YAML, 按扩展名识别)
    pub fn load(path: &Path) -> Result<Self, RulesError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?;
        let tables: RuleTables = settings.try_deserialize()?;
        tables.normalized()
    }

    /// 键归一化 + 校验
    pub fn normalized(self) -> Result<Self, RulesError> {
        if self.version.trim().is_empty() {
            return Err(RulesError::Invalid("version must not be empty".to_string()));
        }

        let mut jurisdictions = IndexMap::with_capacity(self.jurisdictions.len());
        for (code, mut j) in self.jurisdictions {
            let code = code.trim().to_ascii_uppercase();
            if code.len() != 2 {
                return Err(RulesError::Invalid(format!(
                    "jurisdiction key '{}' is not an ISO alpha-2 code",
                    code
                )));
            }
            if j.components.is_empty() {
                return Err(RulesError::Invalid(format!("{}: no tax components", code)));
            }
            for c in j.components.iter_mut() {
                // 浮点来源的税率收敛到 6 位小数
                c.rate = round_to(&c.rate, 6);
                if c.rate < BigDecimal::zero() || c.rate >= BigDecimal::from(1) {
                    return Err(RulesError::Invalid(format!(
                        "{}: rate {} for {} out of range",
                        code, c.rate, c.label
                    )));
                }
            }
            jurisdictions.insert(code, j);
        }

        let reference_prices = self
            .reference_prices
            .into_iter()
            .map(|(k, v)| (normalize_product_key(&k), v))
            .collect();

        Ok(Self {
            jurisdictions,
            reference_prices,
            ..self
        })
    }

    /// 内置示例规则表 (非法律依据, 可被外部文件替换)
    pub fn builtin() -> Self {
        let mut jurisdictions = IndexMap::new();
        jurisdictions.insert(
            "IN".to_string(),
            jurisdiction(
                "GST",
                &[("CGST", "0.09"), ("SGST", "0.09")],
                &["invoice_number", "issue_date", "customer_name", "line_items"],
                "GST Tax Invoice",
                CrossBorderRule::None,
                "INR",
            ),
        );
        jurisdictions.insert(
            "DE".to_string(),
            jurisdiction(
                "USt",
                &[("USt", "0.19")],
                &["invoice_number", "issue_date", "customer_name", "line_items"],
                "Rechnung (§14 UStG)",
                CrossBorderRule::ReverseCharge,
                "EUR",
            ),
        );
        jurisdictions.insert(
            "FR".to_string(),
            jurisdiction(
                "TVA",
                &[("TVA", "0.20")],
                &["invoice_number", "issue_date", "customer_name", "line_items"],
                "Facture",
                CrossBorderRule::ReverseCharge,
                "EUR",
            ),
        );
        jurisdictions.insert(
            "GB".to_string(),
            jurisdiction(
                "VAT",
                &[("VAT", "0.20")],
                &["invoice_number", "issue_date", "customer_name"],
                "VAT Invoice",
                CrossBorderRule::None,
                "GBP",
            ),
        );
        jurisdictions.insert(
            "US".to_string(),
            jurisdiction(
                "Sales Tax",
                &[("Sales Tax", "0.00")],
                &["invoice_number"],
                "Commercial Invoice",
                CrossBorderRule::None,
                "USD",
            ),
        );
        jurisdictions.insert(
            "AE".to_string(),
            jurisdiction(
                "VAT",
                &[("VAT", "0.05")],
                &["invoice_number", "issue_date", "customer_name"],
                "Tax Invoice",
                CrossBorderRule::ReverseCharge,
                "AED",
            ),
        );
        jurisdictions.insert(
            "SG".to_string(),
            jurisdiction(
                "GST",
                &[("GST", "0.09")],
                &["invoice_number", "issue_date"],
                "Tax Invoice",
                CrossBorderRule::None,
                "SGD",
            ),
        );

        let mut reference_prices = IndexMap::new();
        for (key, price) in [
            ("macbook air m2", "81400"),
            ("iphone 15", "79900"),
            ("office chair", "12500"),
            ("cloud hosting monthly", "1000"),
        ] {
            reference_prices.insert(key.to_string(), dec(price));
        }

        Self {
            version: "builtin-2024.1".to_string(),
            jurisdictions,
            fraud: FraudPolicy::default(),
            market: MarketPolicy::default(),
            reconciliation: ReconciliationPolicy::default(),
            reference_prices,
        }
    }
}

impl Default for RuleTables {
    fn default() -> Self {
        Self::builtin()
    }
}

fn dec(s: &str) -> BigDecimal {
    BigDecimal::from_str(s).unwrap_or_else(|_| BigDecimal::zero())
}

fn jurisdiction(
    tax_label: &str,
    components: &[(&str, &str)],
    required_fields: &[&str],
    invoice_format: &str,
    cross_border_rule: CrossBorderRule,
    currency: &str,
) -> Jurisdiction {
    Jurisdiction {
        tax_label: tax_label.to_string(),
        components: components
            .iter()
            .map(|(label, rate)| TaxComponent {
                label: label.to_string(),
                rate: dec(rate),
            })
            .collect(),
        required_fields: required_fields.iter().map(|f| f.to_string()).collect(),
        invoice_format: invoice_format.to_string(),
        cross_border_rule,
        currency: currency.to_string(),
        minor_units: default_minor_units(),
    }
}
