use crate::error::{CollaboratorError, ExtractionFailure, ValidationError};
use crate::models::{InvoiceDraft, JobKind, JobPayload, JobRequest, LineItem};
use crate::money::parse_amount;
use crate::service::collaborators::OcrCollaborator;
use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, NaiveDate};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

// 字段别名 (webhook 与 OCR 共用)
const INVOICE_NUMBER: &[&str] = &["invoice_number", "invoiceNumber", "invoice_no", "order_id", "orderId"];
const AMOUNT: &[&str] = &["amount", "total", "total_amount", "totalAmount", "grand_total"];
const SUBTOTAL: &[&str] = &["subtotal", "sub_total", "net_amount", "netAmount"];
const TAX_AMOUNT: &[&str] = &["tax_amount", "taxAmount", "tax", "vat_amount"];
const COUNTRY: &[&str] = &["country", "country_code", "countryCode", "billing_country"];
const BUYER_COUNTRY: &[&str] = &["buyer_country", "buyerCountry", "shipping_country"];
const PRODUCT: &[&str] = &["product", "product_name", "productName", "description", "item"];
const PRODUCT_CODE: &[&str] = &["product_code", "productCode", "sku"];
const CUSTOMER: &[&str] = &["customer_name", "customerName", "customer", "buyer_name"];
const TAX_ID: &[&str] = &["customer_tax_id", "customerTaxId", "vat_id", "gstin", "tax_id"];
const CURRENCY: &[&str] = &["currency", "currency_code"];
const ISSUE_DATE: &[&str] = &["issue_date", "issueDate", "invoice_date", "date"];
const LINE_ITEMS: &[&str] = &["line_items", "lineItems", "items"];
const QUANTITY: &[&str] = &["quantity", "qty"];
const UNIT_PRICE: &[&str] = &["unit_price", "unitPrice", "price"];

/// webhook 必填字段 (规范名, 别名)
const WEBHOOK_REQUIRED: &[(&str, &[&str])] = &[
    ("amount", AMOUNT),
    ("country", COUNTRY),
    ("product", PRODUCT),
];

const DOCUMENT_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "image/png",
    "image/jpeg",
    "image/tiff",
    "image/webp",
];

/// 提交时校验, 返回带 job_id 的请求 (调用方未提供时生成)
pub fn validate_request(mut request: JobRequest) -> Result<JobRequest, ValidationError> {
    request.job_id = request.job_id.trim().to_string();
    if request.job_id.is_empty() {
        request.job_id = uuid::Uuid::new_v4().to_string();
    }

    match (&request.kind, &request.payload) {
        (JobKind::Document, JobPayload::Document { bytes, mime_type }) => {
            if bytes.is_empty() {
                return Err(ValidationError::EmptyPayload);
            }
            let mime = mime_type.trim().to_ascii_lowercase();
            if !DOCUMENT_MIME_TYPES.contains(&mime.as_str()) {
                return Err(ValidationError::UnsupportedMimeType(mime_type.clone()));
            }
        }
        (JobKind::Webhook, JobPayload::Webhook { body }) => {
            let fields = webhook_fields(body).ok_or(ValidationError::NotAnObject)?;
            let missing = missing_webhook_fields(&FieldReader::new(fields));
            if !missing.is_empty() {
                return Err(ValidationError::MissingWebhookFields(missing));
            }
        }
        (kind, _) => {
            return Err(ValidationError::KindMismatch {
                kind: format!("{:?}", kind),
            })
        }
    }

    Ok(request)
}

/// 抽取阶段: 原始输入 -> InvoiceDraft
pub struct ExtractionStage {
    ocr: Option<Arc<dyn OcrCollaborator>>,
    timeout: Duration,
}

impl ExtractionStage {
    pub fn new(ocr: Option<Arc<dyn OcrCollaborator>>, timeout: Duration) -> Self {
        Self { ocr, timeout }
    }

    /// 返回草稿与阶段置信度; 任何失败对任务都是致命的
    pub async fn extract(&self, request: &JobRequest) -> Result<(InvoiceDraft, f64), ExtractionFailure> {
        match &request.payload {
            JobPayload::Document { bytes, mime_type } => self.extract_document(bytes, mime_type).await,
            JobPayload::Webhook { body } => extract_webhook(body),
        }
    }

    async fn extract_document(
        &self,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<(InvoiceDraft, f64), ExtractionFailure> {
        let Some(ocr) = &self.ocr else {
            return Err(CollaboratorError::Unavailable("no ocr collaborator configured".to_string()).into());
        };

        let response = tokio::time::timeout(self.timeout, ocr.extract(bytes, mime_type))
            .await
            .map_err(|_| CollaboratorError::Timeout(self.timeout))??;

        if !response.confidence.is_finite() {
            return Err(CollaboratorError::Malformed("confidence is not a number".to_string()).into());
        }
        let confidence = response.confidence.clamp(0.0, 100.0);

        let reader = FieldReader::new(&response.fields);
        let mut missing = Vec::new();
        if !reader.has(AMOUNT) && !reader.has(SUBTOTAL) {
            missing.push("total".to_string());
        }
        if !reader.has(COUNTRY) {
            missing.push("country".to_string());
        }
        if !missing.is_empty() {
            return Err(ExtractionFailure::MissingFields(missing));
        }

        let mut draft = build_draft(&reader)?;
        draft.field_confidence = document_field_confidence(&reader, &response.fields, confidence);
        Ok((draft, confidence))
    }
}

fn extract_webhook(body: &Value) -> Result<(InvoiceDraft, f64), ExtractionFailure> {
    let fields = webhook_fields(body)
        .ok_or_else(|| ExtractionFailure::InvalidPayload("webhook payload is not an object".to_string()))?;
    let reader = FieldReader::new(fields);

    let missing = missing_webhook_fields(&reader);
    if !missing.is_empty() {
        return Err(ExtractionFailure::MissingFields(missing));
    }

    let mut draft = build_draft(&reader)?;

    let mut field_confidence = IndexMap::new();
    for (name, aliases) in canonical_fields() {
        if reader.has(aliases) {
            field_confidence.insert(name.to_string(), 100.0);
        }
    }
    draft.field_confidence = field_confidence;

    // 结构化数据; 每缺一个可选字段扣 5 分
    let optional_missing = [INVOICE_NUMBER, CUSTOMER, CURRENCY, ISSUE_DATE]
        .iter()
        .filter(|aliases| !reader.has(aliases))
        .count();
    let confidence = 100.0 - 5.0 * optional_missing as f64;

    Ok((draft, confidence))
}

/// webhook 常见信封: { "data": { "object": {...} } }
fn webhook_fields(body: &Value) -> Option<&Map<String, Value>> {
    let mut fields = body.as_object()?;
    for envelope in ["data", "object"] {
        if FieldReader::new(fields).has(AMOUNT) {
            break;
        }
        match fields.get(envelope).and_then(Value::as_object) {
            Some(inner) => fields = inner,
            None => break,
        }
    }
    Some(fields)
}

fn missing_webhook_fields(reader: &FieldReader<'_>) -> Vec<String> {
    WEBHOOK_REQUIRED
        .iter()
        .filter(|(_, aliases)| !reader.has(aliases))
        .map(|(name, _)| name.to_string())
        .collect()
}

fn canonical_fields() -> [(&'static str, &'static [&'static str]); 11] {
    [
        ("invoice_number", INVOICE_NUMBER),
        ("issue_date", ISSUE_DATE),
        ("country", COUNTRY),
        ("buyer_country", BUYER_COUNTRY),
        ("customer_name", CUSTOMER),
        ("customer_tax_id", TAX_ID),
        ("line_items", LINE_ITEMS),
        ("subtotal", SUBTOTAL),
        ("tax_amount", TAX_AMOUNT),
        ("total", AMOUNT),
        ("currency", CURRENCY),
    ]
}

fn document_field_confidence(
    reader: &FieldReader<'_>,
    fields: &Map<String, Value>,
    overall: f64,
) -> IndexMap<String, f64> {
    let reported = fields.get("field_confidence").and_then(Value::as_object);
    let mut out = IndexMap::new();
    for (name, aliases) in canonical_fields() {
        if !reader.has(aliases) {
            continue;
        }
        let value = reported
            .and_then(|r| aliases.iter().find_map(|a| r.get(*a)))
            .and_then(Value::as_f64)
            .filter(|v| v.is_finite())
            .unwrap_or(overall);
        out.insert(name.to_string(), value.clamp(0.0, 100.0));
    }
    out
}

fn build_draft(reader: &FieldReader<'_>) -> Result<InvoiceDraft, ExtractionFailure> {
    let country = reader
        .string(COUNTRY)
        .map(|c| normalize_country(&c))
        .transpose()?
        .unwrap_or_default();
    let buyer_country = reader
        .string(BUYER_COUNTRY)
        .map(|c| normalize_country(&c))
        .transpose()?;

    let declared_total = reader.amount(AMOUNT, "total")?;
    let declared_subtotal = reader.amount(SUBTOTAL, "subtotal")?;
    let tax_amount = reader.amount(TAX_AMOUNT, "tax_amount")?;

    let (subtotal, total) = match (declared_subtotal, declared_total) {
        (Some(s), Some(t)) => (s, t),
        (Some(s), None) => {
            let t = tax_amount.as_ref().map(|tax| &s + tax).unwrap_or_else(|| s.clone());
            (s, t)
        }
        (None, Some(t)) => {
            let s = tax_amount.as_ref().map(|tax| &t - tax).unwrap_or_else(|| t.clone());
            (s, t)
        }
        (None, None) => return Err(ExtractionFailure::MissingFields(vec!["total".to_string()])),
    };

    if subtotal < BigDecimal::zero() || total < BigDecimal::zero() {
        return Err(ExtractionFailure::InvalidField {
            field: "total".to_string(),
            reason: "amounts must not be negative".to_string(),
        });
    }

    let mut line_items = reader.line_items()?;
    if line_items.is_empty() {
        if let Some(description) = reader.string(PRODUCT) {
            let quantity = reader.amount(QUANTITY, "quantity")?.unwrap_or_else(|| BigDecimal::from(1));
            let unit_price = if quantity > BigDecimal::zero() {
                Some(&subtotal / &quantity)
            } else {
                None
            };
            line_items.push(LineItem {
                description,
                product_code: reader.string(PRODUCT_CODE),
                quantity,
                unit_price,
                amount: subtotal.clone(),
            });
        }
    }

    Ok(InvoiceDraft {
        invoice_number: reader.string(INVOICE_NUMBER),
        issue_date: reader.string(ISSUE_DATE).and_then(|d| parse_date(&d)),
        country,
        buyer_country,
        customer_name: reader.string(CUSTOMER),
        customer_tax_id: reader.string(TAX_ID),
        line_items,
        subtotal,
        tax_amount,
        total,
        currency: reader
            .string(CURRENCY)
            .map(|c| c.to_ascii_uppercase())
            .unwrap_or_default(),
        field_confidence: IndexMap::new(),
    })
}

fn normalize_country(raw: &str) -> Result<String, ExtractionFailure> {
    let trimmed = raw.trim();
    let code = match trimmed.to_ascii_lowercase().as_str() {
        "india" => "IN".to_string(),
        "germany" | "deutschland" => "DE".to_string(),
        "france" => "FR".to_string(),
        "united kingdom" | "uk" | "great britain" => "GB".to_string(),
        "united states" | "usa" => "US".to_string(),
        "united arab emirates" | "uae" => "AE".to_string(),
        "singapore" => "SG".to_string(),
        _ => trimmed.to_ascii_uppercase(),
    };
    if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(code)
    } else {
        Err(ExtractionFailure::InvalidField {
            field: "country".to_string(),
            reason: format!("'{}' is not an ISO country code", raw),
        })
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    ["%Y-%m-%d", "%d/%m/%Y", "%d.%m.%Y", "%Y/%m/%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

/// 按别名读取 JSON 字段
struct FieldReader<'a> {
    fields: &'a Map<String, Value>,
}

impl<'a> FieldReader<'a> {
    fn new(fields: &'a Map<String, Value>) -> Self {
        Self { fields }
    }

    fn get(&self, aliases: &[&str]) -> Option<&'a Value> {
        aliases
            .iter()
            .filter_map(|a| self.fields.get(*a))
            .find(|v| !v.is_null() && v.as_str().map(|s| !s.trim().is_empty()).unwrap_or(true))
    }

    fn has(&self, aliases: &[&str]) -> bool {
        self.get(aliases).is_some()
    }

    fn string(&self, aliases: &[&str]) -> Option<String> {
        match self.get(aliases)? {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn amount(&self, aliases: &[&str], field: &str) -> Result<Option<BigDecimal>, ExtractionFailure> {
        self.get(aliases).map(|v| value_to_amount(v, field)).transpose()
    }

    fn line_items(&self) -> Result<Vec<LineItem>, ExtractionFailure> {
        let Some(items) = self.get(LINE_ITEMS).and_then(Value::as_array) else {
            return Ok(Vec::new());
        };

        let mut out = Vec::with_capacity(items.len());
        for (idx, item) in items.iter().enumerate() {
            let Some(obj) = item.as_object() else {
                return Err(ExtractionFailure::InvalidField {
                    field: format!("line_items[{}]", idx),
                    reason: "not an object".to_string(),
                });
            };
            let r = FieldReader::new(obj);
            let quantity = r.amount(QUANTITY, "quantity")?.unwrap_or_else(|| BigDecimal::from(1));
            let unit_price = r.amount(UNIT_PRICE, "unit_price")?;
            let amount = match r.amount(AMOUNT, "amount")? {
                Some(a) => a,
                None => match &unit_price {
                    Some(p) => p * &quantity,
                    None => {
                        return Err(ExtractionFailure::InvalidField {
                            field: format!("line_items[{}]", idx),
                            reason: "neither amount nor unit price".to_string(),
                        })
                    }
                },
            };
            out.push(LineItem {
                description: r.string(PRODUCT).unwrap_or_default(),
                product_code: r.string(PRODUCT_CODE),
                quantity,
                unit_price,
                amount,
            });
        }
        Ok(out)
    }
}

fn value_to_amount(value: &Value, field: &str) -> Result<BigDecimal, ExtractionFailure> {
    let parsed = match value {
        Value::Number(n) => parse_amount(&n.to_string()),
        Value::String(s) => parse_amount(s),
        _ => None,
    };
    parsed.ok_or_else(|| ExtractionFailure::InvalidField {
        field: field.to_string(),
        reason: format!("'{}' is not a decimal amount", value),
    })
}
