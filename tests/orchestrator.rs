//! 编排器端到端测试: MemoryStore + 模拟协作方

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use invoice_decision::config::PipelineConfig;
use invoice_decision::error::{CollaboratorError, PipelineError, StoreError, ValidationError};
use invoice_decision::models::{
    AuditEntry, Decision, DecisionLookup, DecisionStatus, InvoiceDraft, JobRequest, JobState,
    MatchType, Payment, ReasonCode, StageKind, StageOutcome,
};
use invoice_decision::service::{
    AdvisoryModel, ModelAssessment, NarrativeCollaborator, OcrCollaborator, OcrResponse,
};
use invoice_decision::{
    Collaborators, Correlation, DecisionStore, MemoryStore, Orchestrator, RuleStore, RuleTables,
};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const WAIT: Duration = Duration::from_secs(5);

fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        max_concurrent_jobs: 4,
        extraction_timeout_ms: 200,
        compliance_timeout_ms: 100,
        fraud_timeout_ms: 100,
        market_timeout_ms: 100,
        reconciliation_deadline_ms: 2_000,
        narrative_timeout_ms: 100,
        ..PipelineConfig::default()
    }
}

fn harness(
    config: PipelineConfig,
    collaborators: Collaborators,
) -> (Arc<Orchestrator>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(
        config,
        Arc::new(RuleStore::default()),
        store.clone(),
        collaborators,
    );
    (orchestrator, store)
}

/// 合规的德国发票: 1000 + 19% USt, 商品价格与参考价一致
fn de_invoice(invoice_number: &str) -> Value {
    json!({
        "invoice_number": invoice_number,
        "issue_date": "2024-03-15",
        "customer_name": "Muster GmbH",
        "country": "DE",
        "currency": "EUR",
        "product": "Cloud Hosting Monthly",
        "subtotal": "1000.00",
        "tax_amount": "190.00",
        "amount": "1190.00"
    })
}

fn payment(reference: &str, amount: &str) -> Payment {
    Payment {
        payment_id: format!("pay-{}", reference),
        amount: amount.parse::<BigDecimal>().unwrap(),
        currency: "EUR".to_string(),
        reference: reference.to_string(),
        job_id: None,
        received_at: Utc::now(),
    }
}

async fn decision_of(orchestrator: &Orchestrator, job_id: &str) -> Decision {
    match orchestrator.wait_for_decision(job_id, WAIT).await.unwrap() {
        DecisionLookup::Ready(decision) => decision,
        other => panic!("expected a decision for {}, got {:?}", job_id, other),
    }
}

async fn wait_for_state(orchestrator: &Orchestrator, job_id: &str, state: JobState) {
    let mut rx = orchestrator.subscribe(job_id).expect("job should be in flight");
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
}

// ========== 模拟协作方 ==========

struct FixedOcr {
    fields: Value,
    confidence: f64,
}

#[async_trait]
impl OcrCollaborator for FixedOcr {
    async fn extract(&self, _bytes: &[u8], _mime_type: &str) -> Result<OcrResponse, CollaboratorError> {
        Ok(OcrResponse {
            fields: self.fields.as_object().cloned().unwrap_or_default(),
            confidence: self.confidence,
        })
    }
}

struct SlowOcr(Duration);

#[async_trait]
impl OcrCollaborator for SlowOcr {
    async fn extract(&self, _bytes: &[u8], _mime_type: &str) -> Result<OcrResponse, CollaboratorError> {
        tokio::time::sleep(self.0).await;
        Err(CollaboratorError::Unavailable("unreachable".to_string()))
    }
}

struct Advisory {
    delay: Duration,
    confidence: f64,
    calls: AtomicUsize,
}

impl Advisory {
    fn new(delay: Duration, confidence: f64) -> Arc<Self> {
        Arc::new(Self {
            delay,
            confidence,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl AdvisoryModel for Advisory {
    async fn assess(
        &self,
        stage: StageKind,
        _draft: &InvoiceDraft,
    ) -> Result<ModelAssessment, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(ModelAssessment {
            confidence: self.confidence,
            rationale: Some(format!("{} looks consistent", stage)),
        })
    }
}

struct EchoNarrator;

#[async_trait]
impl NarrativeCollaborator for EchoNarrator {
    async fn narrate(&self, stage: StageKind, _summary: &Value) -> Result<String, CollaboratorError> {
        Ok(format!("{} narrative", stage))
    }
}

struct BrokenNarrator;

#[async_trait]
impl NarrativeCollaborator for BrokenNarrator {
    async fn narrate(&self, _stage: StageKind, _summary: &Value) -> Result<String, CollaboratorError> {
        Err(CollaboratorError::Unavailable("narrator down".to_string()))
    }
}

/// 决策写入可失败或变慢的存储, 其余操作交给 MemoryStore
#[derive(Default)]
struct ScriptedStore {
    inner: MemoryStore,
    fail_saves: bool,
    save_delay: Duration,
    saving: Notify,
}

#[async_trait]
impl DecisionStore for ScriptedStore {
    async fn save_decision(&self, decision: &Decision) -> Result<(), StoreError> {
        self.saving.notify_one();
        tokio::time::sleep(self.save_delay).await;
        if self.fail_saves {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.inner.save_decision(decision).await
    }

    async fn load_decision(&self, job_id: &str) -> Result<Option<Decision>, StoreError> {
        self.inner.load_decision(job_id).await
    }

    async fn append_audit(&self, job_id: &str, entry: &AuditEntry) -> Result<(), StoreError> {
        self.inner.append_audit(job_id, entry).await
    }

    async fn list_audit(&self, job_id: &str) -> Result<Vec<AuditEntry>, StoreError> {
        self.inner.list_audit(job_id).await
    }

    async fn save_request(&self, request: &JobRequest) -> Result<(), StoreError> {
        self.inner.save_request(request).await
    }

    async fn load_request(&self, job_id: &str) -> Result<Option<JobRequest>, StoreError> {
        self.inner.load_request(job_id).await
    }
}

fn orchestrator_on(config: PipelineConfig, store: Arc<dyn DecisionStore>) -> Arc<Orchestrator> {
    Orchestrator::new(
        config,
        Arc::new(RuleStore::default()),
        store,
        Collaborators::default(),
    )
}

// ========== 主流程 ==========

#[tokio::test]
async fn compliant_webhook_is_approved() {
    let (orchestrator, store) = harness(pipeline_config(), Collaborators::default());

    let job_id = orchestrator
        .submit_job(JobRequest::webhook("job-approve", de_invoice("INV-DE-1001")))
        .await
        .unwrap();
    let decision = decision_of(&orchestrator, &job_id).await;

    assert_eq!(decision.status, DecisionStatus::Approved);
    assert!(decision.reasons.is_empty());
    assert_eq!(decision.version, 1);
    assert_eq!(decision.rules_version.as_deref(), Some("builtin-2024.1"));
    // (0.3*100 + 0.3*100 + 0.2*95 + 0.1*100) / 0.9
    assert_eq!(decision.overall_confidence, 98.89);
    assert!(decision.stage_results.reconciliation.is_none());

    let compliance = decision.stage_results.compliance.as_ref().unwrap().value().unwrap();
    assert_eq!(compliance.computed_tax, "190".parse::<BigDecimal>().unwrap());

    // 审计日志连续递增, 与存储一致
    let audit = store.list_audit(&job_id).await.unwrap();
    assert_eq!(audit, decision.audit_log);
    assert!(audit.windows(2).all(|w| w[1].seq == w[0].seq + 1));
    assert_eq!(audit.first().unwrap().event, "JOB_ACCEPTED");
    assert_eq!(audit.last().unwrap().event, "DECISION_WRITTEN");
    assert_eq!(audit.last().unwrap().state, JobState::Done);
}

#[tokio::test]
async fn missing_required_field_is_rejected() {
    let (orchestrator, _store) = harness(pipeline_config(), Collaborators::default());
    let mut body = de_invoice("INV-DE-1002");
    body.as_object_mut().unwrap().remove("customer_name");

    let job_id = orchestrator
        .submit_job(JobRequest::webhook("job-noncompliant", body))
        .await
        .unwrap();
    let decision = decision_of(&orchestrator, &job_id).await;

    assert_eq!(decision.status, DecisionStatus::Rejected);
    assert!(decision.reasons.contains(&ReasonCode::NonCompliant));
    let verdict = decision.stage_results.compliance.as_ref().unwrap().value().unwrap();
    assert_eq!(verdict.missing_fields, vec!["customer_name".to_string()]);
}

#[tokio::test]
async fn document_job_uses_ocr_confidence() {
    let ocr = Arc::new(FixedOcr {
        fields: de_invoice("INV-DE-2001"),
        confidence: 90.0,
    });
    let collaborators = Collaborators {
        ocr: Some(ocr),
        ..Collaborators::default()
    };
    let (orchestrator, _store) = harness(pipeline_config(), collaborators);

    let job_id = orchestrator
        .submit_job(JobRequest::document("job-ocr", b"%PDF-1.7".to_vec(), "application/pdf"))
        .await
        .unwrap();
    let decision = decision_of(&orchestrator, &job_id).await;

    assert_eq!(decision.status, DecisionStatus::Approved);
    let extraction = decision.stage_results.extraction.as_ref().unwrap();
    assert_eq!(extraction.confidence(), Some(90.0));
    assert_eq!(
        extraction.value().unwrap().invoice_number.as_deref(),
        Some("INV-DE-2001")
    );
}

#[tokio::test]
async fn ocr_timeout_fails_the_job_with_a_rejection() {
    let collaborators = Collaborators {
        ocr: Some(Arc::new(SlowOcr(Duration::from_secs(2)))),
        ..Collaborators::default()
    };
    let (orchestrator, store) = harness(pipeline_config(), collaborators);

    let job_id = orchestrator
        .submit_job(JobRequest::document("job-ocr-slow", vec![1, 2, 3], "image/png"))
        .await
        .unwrap();
    let decision = decision_of(&orchestrator, &job_id).await;

    assert_eq!(decision.status, DecisionStatus::Rejected);
    assert_eq!(decision.reasons, vec![ReasonCode::ExtractionFailed]);
    assert_eq!(decision.overall_confidence, 0.0);
    assert!(decision.stage_results.compliance.is_none());

    let audit = store.list_audit(&job_id).await.unwrap();
    let last = audit.last().unwrap();
    assert_eq!(last.state, JobState::Failed);
    assert_eq!(last.event, "EXTRACTION_FAILED");
    assert!(last.detail.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn invalid_requests_are_refused_at_submission() {
    let (orchestrator, _store) = harness(pipeline_config(), Collaborators::default());

    let mut body = de_invoice("INV-1");
    body.as_object_mut().unwrap().remove("product");
    let err = orchestrator
        .submit_job(JobRequest::webhook("job-bad", body))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Validation(ValidationError::MissingWebhookFields(ref f)) if f == &vec!["product".to_string()]
    ));

    let err = orchestrator
        .submit_job(JobRequest::document("job-bad-doc", vec![0u8; 4], "text/plain"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Validation(ValidationError::UnsupportedMimeType(_))
    ));

    assert_eq!(
        orchestrator.get_decision("job-bad").await.unwrap(),
        DecisionLookup::NotFound
    );
}

#[tokio::test]
async fn blank_job_id_gets_generated() {
    let (orchestrator, _store) = harness(pipeline_config(), Collaborators::default());
    let job_id = orchestrator
        .submit_job(JobRequest::webhook("  ", de_invoice("INV-DE-3001")))
        .await
        .unwrap();
    assert!(!job_id.trim().is_empty());
    assert_eq!(decision_of(&orchestrator, &job_id).await.job_id, job_id);
}

// ========== 模型降级 ==========

#[tokio::test]
async fn slow_advisory_model_degrades_stages() {
    let advisory = Advisory::new(Duration::from_millis(500), 99.0);
    let collaborators = Collaborators {
        advisory: Some(advisory.clone()),
        ..Collaborators::default()
    };
    let (orchestrator, _store) = harness(pipeline_config(), collaborators);

    let job_id = orchestrator
        .submit_job(JobRequest::webhook("job-slow-model", de_invoice("INV-DE-4001")))
        .await
        .unwrap();
    let decision = decision_of(&orchestrator, &job_id).await;

    assert_eq!(decision.status, DecisionStatus::NeedsReview);
    assert_eq!(decision.reasons, vec![ReasonCode::StageDegraded]);

    let compliance = decision.stage_results.compliance.as_ref().unwrap();
    assert!(compliance.is_degraded());
    assert_eq!(compliance.confidence(), Some(60.0));
    assert_eq!(decision.stage_results.fraud.as_ref().unwrap().confidence(), Some(57.0));
    // 降级不改变规则计算的值
    assert!(compliance.value().unwrap().is_compliant);
    // (0.3*100 + 0.3*60 + 0.2*57 + 0.1*60) / 0.9
    assert_eq!(decision.overall_confidence, 72.67);
    assert_eq!(advisory.calls.load(Ordering::SeqCst), 3);
    assert!(decision
        .audit_log
        .iter()
        .any(|e| e.event == "STAGE_DEGRADED" && e.stage == Some(StageKind::Fraud)));
}

#[tokio::test]
async fn advisory_confidence_and_narratives_are_recorded() {
    let collaborators = Collaborators {
        advisory: Some(Advisory::new(Duration::ZERO, 80.0)),
        narrator: Some(Arc::new(EchoNarrator)),
        ..Collaborators::default()
    };
    let (orchestrator, _store) = harness(pipeline_config(), collaborators);

    let job_id = orchestrator
        .submit_job(JobRequest::webhook("job-model", de_invoice("INV-DE-4002")))
        .await
        .unwrap();
    let decision = decision_of(&orchestrator, &job_id).await;

    assert_eq!(decision.status, DecisionStatus::Approved);
    assert_eq!(decision.stage_results.market.as_ref().unwrap().confidence(), Some(80.0));
    // (0.3*100 + 0.3*80 + 0.2*80 + 0.1*80) / 0.9
    assert_eq!(decision.overall_confidence, 86.67);
    assert_eq!(
        decision.narratives.get(&StageKind::Extraction).map(String::as_str),
        Some("extraction narrative")
    );
    assert_eq!(
        decision.narratives.get(&StageKind::Fraud).map(String::as_str),
        Some("fraud narrative")
    );
}

#[tokio::test]
async fn narrator_failure_never_changes_the_decision() {
    let collaborators = Collaborators {
        narrator: Some(Arc::new(BrokenNarrator)),
        ..Collaborators::default()
    };
    let (orchestrator, _store) = harness(pipeline_config(), collaborators);

    let job_id = orchestrator
        .submit_job(JobRequest::webhook("job-narrator", de_invoice("INV-DE-4003")))
        .await
        .unwrap();
    let decision = decision_of(&orchestrator, &job_id).await;

    assert_eq!(decision.status, DecisionStatus::Approved);
    assert_eq!(decision.overall_confidence, 98.89);
    assert!(decision.narratives.is_empty());
}

// ========== 对账 ==========

#[tokio::test]
async fn late_payment_resumes_parked_job() {
    let (orchestrator, _store) = harness(pipeline_config(), Collaborators::default());

    let job_id = orchestrator
        .submit_job(JobRequest::webhook("job-late-pay", de_invoice("INV-DE-5001")).expecting_payment())
        .await
        .unwrap();
    wait_for_state(&orchestrator, &job_id, JobState::WaitingPayment).await;

    assert_eq!(
        orchestrator.notify_payment(payment("INV-DE-5001", "1190.00")),
        Correlation::Delivered(job_id.clone())
    );
    let decision = decision_of(&orchestrator, &job_id).await;

    assert_eq!(decision.status, DecisionStatus::Approved);
    let reconciliation = decision.stage_results.reconciliation.as_ref().unwrap().value().unwrap();
    assert!(reconciliation.matched);
    assert_eq!(reconciliation.match_type, MatchType::Exact);
    assert_eq!(decision.overall_confidence, 99.0);
}

#[tokio::test]
async fn early_payment_is_claimed_without_waiting() {
    let (orchestrator, _store) = harness(pipeline_config(), Collaborators::default());

    assert_eq!(
        orchestrator.notify_payment(payment("INV-DE-5002", "1190.00")),
        Correlation::Buffered
    );
    let job_id = orchestrator
        .submit_job(JobRequest::webhook("job-early-pay", de_invoice("INV-DE-5002")).expecting_payment())
        .await
        .unwrap();
    let decision = decision_of(&orchestrator, &job_id).await;

    assert_eq!(decision.status, DecisionStatus::Approved);
    assert!(decision
        .audit_log
        .iter()
        .all(|e| e.state != JobState::WaitingPayment));
}

#[tokio::test]
async fn mismatched_payment_needs_review() {
    let (orchestrator, _store) = harness(pipeline_config(), Collaborators::default());

    let job_id = orchestrator
        .submit_job(JobRequest::webhook("job-short-pay", de_invoice("INV-DE-5003")).expecting_payment())
        .await
        .unwrap();
    wait_for_state(&orchestrator, &job_id, JobState::WaitingPayment).await;
    let mut short = payment("unrelated-ref", "1100.00");
    short.job_id = Some(job_id.clone());
    assert_eq!(
        orchestrator.notify_payment(short),
        Correlation::Delivered(job_id.clone())
    );

    let decision = decision_of(&orchestrator, &job_id).await;
    assert_eq!(decision.status, DecisionStatus::NeedsReview);
    assert_eq!(decision.reasons, vec![ReasonCode::PaymentMismatch]);
    let reconciliation = decision.stage_results.reconciliation.as_ref().unwrap().value().unwrap();
    assert_eq!(reconciliation.match_type, MatchType::Unclear);
    assert!(reconciliation.suggestions[0].starts_with("Verify payment reference"));
}

#[tokio::test]
async fn missing_payment_skips_reconciliation_after_deadline() {
    let config = PipelineConfig {
        reconciliation_deadline_ms: 50,
        ..pipeline_config()
    };
    let (orchestrator, _store) = harness(config, Collaborators::default());

    let job_id = orchestrator
        .submit_job(JobRequest::webhook("job-no-pay", de_invoice("INV-DE-5004")).expecting_payment())
        .await
        .unwrap();
    let decision = decision_of(&orchestrator, &job_id).await;

    assert_eq!(decision.status, DecisionStatus::NeedsReview);
    assert_eq!(decision.reasons, vec![ReasonCode::ReconciliationSkipped]);
    assert!(matches!(
        decision.stage_results.reconciliation,
        Some(StageOutcome::Skipped { .. })
    ));
    // 跳过的阶段不计入加权
    assert_eq!(decision.overall_confidence, 98.89);
}

#[tokio::test]
async fn parked_job_frees_its_worker() {
    let config = PipelineConfig {
        max_concurrent_jobs: 1,
        ..pipeline_config()
    };
    let (orchestrator, _store) = harness(config, Collaborators::default());

    let parked = orchestrator
        .submit_job(JobRequest::webhook("job-parked", de_invoice("INV-DE-6001")).expecting_payment())
        .await
        .unwrap();
    wait_for_state(&orchestrator, &parked, JobState::WaitingPayment).await;

    let other = orchestrator
        .submit_job(JobRequest::webhook("job-other", de_invoice("INV-DE-6002")))
        .await
        .unwrap();
    assert_eq!(
        decision_of(&orchestrator, &other).await.status,
        DecisionStatus::Approved
    );

    orchestrator.notify_payment(payment("INV-DE-6001", "1190.00"));
    assert_eq!(
        decision_of(&orchestrator, &parked).await.status,
        DecisionStatus::Approved
    );
}

// ========== 取消 / 幂等 / 重算 ==========

#[tokio::test]
async fn cancelled_job_emits_no_decision() {
    let (orchestrator, store) = harness(pipeline_config(), Collaborators::default());

    let job_id = orchestrator
        .submit_job(JobRequest::webhook("job-cancel", de_invoice("INV-DE-7001")).expecting_payment())
        .await
        .unwrap();
    wait_for_state(&orchestrator, &job_id, JobState::WaitingPayment).await;

    assert!(orchestrator.cancel_job(&job_id));
    assert_eq!(
        orchestrator.wait_for_decision(&job_id, WAIT).await.unwrap(),
        DecisionLookup::Cancelled
    );
    assert!(store.history(&job_id).is_empty());
    assert!(!orchestrator.cancel_job(&job_id));

    // 付款迟到也不会复活任务
    assert_eq!(
        orchestrator.notify_payment(payment("INV-DE-7001", "1190.00")),
        Correlation::Buffered
    );
    // 重复提交已取消的任务不会重跑
    orchestrator
        .submit_job(JobRequest::webhook("job-cancel", de_invoice("INV-DE-7001")))
        .await
        .unwrap();
    assert_eq!(
        orchestrator.get_decision(&job_id).await.unwrap(),
        DecisionLookup::Cancelled
    );

    let audit = store.list_audit(&job_id).await.unwrap();
    assert_eq!(audit.last().unwrap().state, JobState::Cancelled);
}

#[tokio::test]
async fn cancel_during_extraction() {
    let config = PipelineConfig {
        extraction_timeout_ms: 10_000,
        ..pipeline_config()
    };
    let collaborators = Collaborators {
        ocr: Some(Arc::new(SlowOcr(Duration::from_secs(30)))),
        ..Collaborators::default()
    };
    let (orchestrator, store) = harness(config, collaborators);

    let job_id = orchestrator
        .submit_job(JobRequest::document("job-cancel-ocr", vec![9; 16], "image/jpeg"))
        .await
        .unwrap();
    wait_for_state(&orchestrator, &job_id, JobState::Extracting).await;
    assert!(orchestrator.cancel_job(&job_id));

    assert_eq!(
        orchestrator.wait_for_decision(&job_id, WAIT).await.unwrap(),
        DecisionLookup::Cancelled
    );
    assert!(store.history(&job_id).is_empty());
}

#[tokio::test]
async fn duplicate_submissions_produce_one_decision() {
    let (orchestrator, store) = harness(pipeline_config(), Collaborators::default());

    let mut handles = Vec::new();
    for _ in 0..5 {
        let orchestrator = orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator
                .submit_job(JobRequest::webhook("job-dup", de_invoice("INV-DE-8001")))
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), "job-dup");
    }

    let first = decision_of(&orchestrator, "job-dup").await;
    orchestrator
        .submit_job(JobRequest::webhook("job-dup", de_invoice("INV-DE-8001")))
        .await
        .unwrap();
    let again = decision_of(&orchestrator, "job-dup").await;

    assert_eq!(first, again);
    assert_eq!(store.history("job-dup").len(), 1);
}

#[tokio::test]
async fn reprocessing_bumps_version_and_keeps_history() {
    let (orchestrator, store) = harness(pipeline_config(), Collaborators::default());

    let job_id = orchestrator
        .submit_job(JobRequest::webhook("job-reprocess", de_invoice("INV-DE-9001")))
        .await
        .unwrap();
    let first = decision_of(&orchestrator, &job_id).await;
    assert_eq!(first.version, 1);

    let version = orchestrator.reprocess_job(&job_id).await.unwrap();
    assert_eq!(version, 2);
    let second = decision_of(&orchestrator, &job_id).await;

    assert_eq!(second.version, 2);
    assert_eq!(second.status, first.status);
    assert_eq!(second.overall_confidence, first.overall_confidence);

    let history = store.history(&job_id);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0], first);

    // 审计序号跨版本连续
    let audit = store.list_audit(&job_id).await.unwrap();
    assert!(audit.windows(2).all(|w| w[1].seq == w[0].seq + 1));
    assert_eq!(second.audit_log.first().unwrap().seq, first.audit_log.len() as u32);

    assert!(matches!(
        orchestrator.reprocess_job("job-unknown").await,
        Err(PipelineError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn reprocessing_reuses_the_matched_payment() {
    let (orchestrator, _store) = harness(pipeline_config(), Collaborators::default());

    let job_id = orchestrator
        .submit_job(JobRequest::webhook("job-reprocess-pay", de_invoice("INV-DE-9002")).expecting_payment())
        .await
        .unwrap();
    wait_for_state(&orchestrator, &job_id, JobState::WaitingPayment).await;
    assert_eq!(
        orchestrator.notify_payment(payment("INV-DE-9002", "1190.00")),
        Correlation::Delivered(job_id.clone())
    );
    let first = decision_of(&orchestrator, &job_id).await;
    assert_eq!(first.status, DecisionStatus::Approved);
    assert_eq!(first.overall_confidence, 99.0);
    assert_eq!(first.payment.as_ref().unwrap().payment_id, "pay-INV-DE-9002");

    assert_eq!(orchestrator.reprocess_job(&job_id).await.unwrap(), 2);
    let second = decision_of(&orchestrator, &job_id).await;

    assert_eq!(second.version, 2);
    assert_eq!(second.status, DecisionStatus::Approved);
    assert!(second.reasons.is_empty());
    assert_eq!(second.overall_confidence, 99.0);
    let reconciliation = second.stage_results.reconciliation.as_ref().unwrap().value().unwrap();
    assert_eq!(reconciliation.match_type, MatchType::Exact);
    assert_eq!(second.payment, first.payment);
    // 不再挂起等待付款
    assert!(second
        .audit_log
        .iter()
        .all(|e| e.state != JobState::WaitingPayment));
}

#[tokio::test]
async fn accepted_request_survives_a_restart() {
    let store = Arc::new(MemoryStore::new());
    let before = orchestrator_on(pipeline_config(), store.clone());
    let job_id = before
        .submit_job(JobRequest::webhook("job-restart", de_invoice("INV-DE-9003")))
        .await
        .unwrap();
    assert_eq!(decision_of(&before, &job_id).await.version, 1);
    drop(before);

    let after = orchestrator_on(pipeline_config(), store.clone());
    assert_eq!(after.reprocess_job(&job_id).await.unwrap(), 2);
    assert_eq!(decision_of(&after, &job_id).await.version, 2);
    assert_eq!(store.history(&job_id).len(), 2);
}

#[tokio::test]
async fn failed_persistence_is_reported_and_not_restarted() {
    let store = Arc::new(ScriptedStore {
        fail_saves: true,
        ..ScriptedStore::default()
    });
    let orchestrator = orchestrator_on(pipeline_config(), store.clone());

    let job_id = orchestrator
        .submit_job(JobRequest::webhook("job-persist-fail", de_invoice("INV-DE-9004")))
        .await
        .unwrap();
    match orchestrator.wait_for_decision(&job_id, WAIT).await.unwrap() {
        DecisionLookup::Failed { reason } => assert!(reason.contains("disk full"), "{}", reason),
        other => panic!("expected a failed lookup, got {:?}", other),
    }
    let audit = orchestrator.audit_log(&job_id).await.unwrap();
    assert_eq!(audit.last().unwrap().event, "DECISION_PERSIST_FAILED");
    assert_eq!(audit.last().unwrap().state, JobState::Failed);

    // 重复提交合并到已失败的任务
    assert_eq!(
        orchestrator
            .submit_job(JobRequest::webhook("job-persist-fail", de_invoice("INV-DE-9004")))
            .await
            .unwrap(),
        job_id
    );
    assert_eq!(orchestrator.in_flight(), 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(orchestrator.audit_log(&job_id).await.unwrap().len(), audit.len());

    // 重启后仍能从审计日志查到失败
    let restarted = orchestrator_on(pipeline_config(), store.clone());
    assert!(matches!(
        restarted.get_decision(&job_id).await.unwrap(),
        DecisionLookup::Failed { .. }
    ));
}

#[tokio::test]
async fn cancel_after_commit_is_refused() {
    let store = Arc::new(ScriptedStore {
        save_delay: Duration::from_millis(300),
        ..ScriptedStore::default()
    });
    let orchestrator = orchestrator_on(pipeline_config(), store.clone());

    let job_id = orchestrator
        .submit_job(JobRequest::webhook("job-commit", de_invoice("INV-DE-9005")))
        .await
        .unwrap();
    tokio::time::timeout(WAIT, store.saving.notified())
        .await
        .expect("decision was never saved");

    assert!(!orchestrator.cancel_job(&job_id));
    let decision = decision_of(&orchestrator, &job_id).await;
    assert_eq!(decision.status, DecisionStatus::Approved);
    let audit = store.list_audit(&job_id).await.unwrap();
    assert_eq!(audit.last().unwrap().event, "DECISION_WRITTEN");
    assert!(audit.iter().all(|e| e.state != JobState::Cancelled));
}

#[tokio::test]
async fn terminal_bookkeeping_drains() {
    let config = PipelineConfig {
        terminal_retention_ms: 0,
        payment_buffer_ttl_ms: 0,
        ..pipeline_config()
    };
    let (orchestrator, store) = harness(config, Collaborators::default());

    let done = orchestrator
        .submit_job(JobRequest::webhook("job-drain-done", de_invoice("INV-DE-9006")))
        .await
        .unwrap();
    decision_of(&orchestrator, &done).await;

    let cancelled = orchestrator
        .submit_job(JobRequest::webhook("job-drain-cancel", de_invoice("INV-DE-9007")).expecting_payment())
        .await
        .unwrap();
    wait_for_state(&orchestrator, &cancelled, JobState::WaitingPayment).await;
    assert!(orchestrator.cancel_job(&cancelled));
    assert_eq!(
        orchestrator.wait_for_decision(&cancelled, WAIT).await.unwrap(),
        DecisionLookup::Cancelled
    );

    assert_eq!(
        orchestrator.notify_payment(payment("INV-NOBODY", "10.00")),
        Correlation::Buffered
    );

    assert_eq!(orchestrator.in_flight(), 0);
    assert_eq!(orchestrator.retained_outcomes(), 0);
    assert_eq!(orchestrator.buffered_payments(), 0);

    // 缓存过期后仍由审计日志判定, 重复提交也不会重跑
    orchestrator
        .submit_job(JobRequest::webhook("job-drain-cancel", de_invoice("INV-DE-9007")))
        .await
        .unwrap();
    assert_eq!(
        orchestrator.get_decision(&cancelled).await.unwrap(),
        DecisionLookup::Cancelled
    );
    assert_eq!(orchestrator.in_flight(), 0);
    assert!(store.history(&cancelled).is_empty());
}

#[tokio::test]
async fn jobs_sharing_an_invoice_number_are_both_reconciled() {
    let (orchestrator, _store) = harness(pipeline_config(), Collaborators::default());

    let first = orchestrator
        .submit_job(JobRequest::webhook("job-shared-1", de_invoice("INV-DE-9008")).expecting_payment())
        .await
        .unwrap();
    wait_for_state(&orchestrator, &first, JobState::WaitingPayment).await;
    let second = orchestrator
        .submit_job(JobRequest::webhook("job-shared-2", de_invoice("INV-DE-9008")).expecting_payment())
        .await
        .unwrap();
    wait_for_state(&orchestrator, &second, JobState::WaitingPayment).await;

    assert_eq!(
        orchestrator.notify_payment(payment("INV-DE-9008", "1190.00")),
        Correlation::Delivered(first.clone())
    );
    assert_eq!(
        orchestrator.notify_payment(payment("INV-DE-9008", "1190.00")),
        Correlation::Delivered(second.clone())
    );
    assert_eq!(decision_of(&orchestrator, &first).await.status, DecisionStatus::Approved);
    assert_eq!(decision_of(&orchestrator, &second).await.status, DecisionStatus::Approved);
}

// ========== 规则热更新 ==========

#[tokio::test]
async fn rule_swap_applies_to_new_jobs_only() {
    let (orchestrator, _store) = harness(pipeline_config(), Collaborators::default());

    let before = orchestrator
        .submit_job(JobRequest::webhook("job-rules-1", de_invoice("INV-DE-9101")))
        .await
        .unwrap();
    let before = decision_of(&orchestrator, &before).await;

    let mut next = RuleTables::builtin();
    next.version = "2024.2-test".to_string();
    next.jurisdictions.get_mut("DE").unwrap().components[0].rate = "0.16".parse().unwrap();
    orchestrator.rules().swap(next);

    let after = orchestrator
        .submit_job(JobRequest::webhook("job-rules-2", de_invoice("INV-DE-9102")))
        .await
        .unwrap();
    let after = decision_of(&orchestrator, &after).await;

    assert_eq!(before.rules_version.as_deref(), Some("builtin-2024.1"));
    assert_eq!(before.status, DecisionStatus::Approved);
    assert_eq!(after.rules_version.as_deref(), Some("2024.2-test"));
    // 声明 190, 新税率计算 160
    assert_eq!(after.status, DecisionStatus::Rejected);
    assert!(after.reasons.contains(&ReasonCode::NonCompliant));
}

#[tokio::test]
async fn reload_rules_from_file() {
    let (orchestrator, _store) = harness(pipeline_config(), Collaborators::default());

    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    write!(
        file,
        r#"
version = "file-2025.01"

[jurisdictions.de]
tax_label = "USt"
invoice_format = "Rechnung"
currency = "EUR"
required_fields = ["invoice_number"]
components = [{{ label = "USt", rate = "0.19" }}]
"#
    )
    .unwrap();

    let version = orchestrator.reload_rules(Some(file.path())).unwrap();
    assert_eq!(version, "file-2025.01");
    assert!(orchestrator.rules().snapshot().jurisdiction("IN").is_none());

    // 加载失败保持当前规则
    let missing = std::path::Path::new("/nonexistent/rules.toml");
    assert!(orchestrator.reload_rules(Some(missing)).is_err());
    assert_eq!(orchestrator.rules().snapshot().version, "file-2025.01");
}

// ========== 并发 ==========

#[tokio::test]
async fn many_jobs_complete_independently() {
    let (orchestrator, store) = harness(pipeline_config(), Collaborators::default());

    let mut ids = Vec::new();
    for i in 0..24 {
        let id = orchestrator
            .submit_job(JobRequest::webhook(
                format!("job-bulk-{}", i),
                de_invoice(&format!("INV-BULK-{}", i)),
            ))
            .await
            .unwrap();
        ids.push(id);
    }

    for id in &ids {
        let decision = decision_of(&orchestrator, id).await;
        assert_eq!(decision.status, DecisionStatus::Approved);
        assert_eq!(store.history(id).len(), 1);
    }
    assert_eq!(orchestrator.in_flight(), 0);
}
