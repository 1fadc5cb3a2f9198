use crate::error::CollaboratorError;
use crate::models::{InvoiceDraft, StageKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// OCR 返回的原始字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResponse {
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub confidence: f64,
}

/// 外部 OCR/文本抽取服务
#[async_trait]
pub trait OcrCollaborator: Send + Sync {
    async fn extract(&self, bytes: &[u8], mime_type: &str) -> Result<OcrResponse, CollaboratorError>;
}

/// 概率模型对某阶段的评估
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelAssessment {
    pub confidence: f64,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// 分析阶段的概率后端 (如远程 LLM), 只提供置信度, 不决定数值结果
#[async_trait]
pub trait AdvisoryModel: Send + Sync {
    async fn assess(
        &self,
        stage: StageKind,
        draft: &InvoiceDraft,
    ) -> Result<ModelAssessment, CollaboratorError>;
}

/// 生成式叙述服务, 仅用于审计展示
#[async_trait]
pub trait NarrativeCollaborator: Send + Sync {
    async fn narrate(
        &self,
        stage: StageKind,
        summary: &serde_json::Value,
    ) -> Result<String, CollaboratorError>;
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, CollaboratorError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| CollaboratorError::Unavailable(e.to_string()))
}

async fn post_json<B, R>(client: &reqwest::Client, url: &str, body: &B) -> Result<R, CollaboratorError>
where
    B: Serialize + ?Sized,
    R: for<'de> Deserialize<'de>,
{
    let response = client.post(url).json(body).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CollaboratorError::Unavailable(format!(
            "{} responded {}",
            url, status
        )));
    }
    Ok(response.json::<R>().await?)
}

/// HTTP OCR 客户端
pub struct HttpOcrClient {
    client: reqwest::Client,
    url: String,
}

impl HttpOcrClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, CollaboratorError> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.into(),
        })
    }
}

#[derive(Serialize)]
struct OcrRequest<'a> {
    mime_type: &'a str,
    bytes: &'a [u8],
}

#[async_trait]
impl OcrCollaborator for HttpOcrClient {
    async fn extract(&self, bytes: &[u8], mime_type: &str) -> Result<OcrResponse, CollaboratorError> {
        post_json(&self.client, &self.url, &OcrRequest { mime_type, bytes }).await
    }
}

/// HTTP 模型客户端
pub struct HttpAdvisoryModel {
    client: reqwest::Client,
    url: String,
}

impl HttpAdvisoryModel {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, CollaboratorError> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.into(),
        })
    }
}

#[derive(Serialize)]
struct AssessRequest<'a> {
    stage: StageKind,
    draft: &'a InvoiceDraft,
}

#[async_trait]
impl AdvisoryModel for HttpAdvisoryModel {
    async fn assess(
        &self,
        stage: StageKind,
        draft: &InvoiceDraft,
    ) -> Result<ModelAssessment, CollaboratorError> {
        post_json(&self.client, &self.url, &AssessRequest { stage, draft }).await
    }
}

/// HTTP 叙述客户端
pub struct HttpNarrator {
    client: reqwest::Client,
    url: String,
}

impl HttpNarrator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, CollaboratorError> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.into(),
        })
    }
}

#[derive(Serialize)]
struct NarrateRequest<'a> {
    stage: StageKind,
    summary: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct NarrateResponse {
    text: String,
}

#[async_trait]
impl NarrativeCollaborator for HttpNarrator {
    async fn narrate(
        &self,
        stage: StageKind,
        summary: &serde_json::Value,
    ) -> Result<String, CollaboratorError> {
        let response: NarrateResponse =
            post_json(&self.client, &self.url, &NarrateRequest { stage, summary }).await?;
        Ok(response.text)
    }
}
