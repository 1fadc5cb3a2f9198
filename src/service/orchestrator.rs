use crate::config::PipelineConfig;
use crate::db::DecisionStore;
use crate::error::{PipelineError, RulesError};
use crate::models::{
    AuditEntry, ComplianceVerdict, Decision, DecisionLookup, DecisionStatus, FraudSignal,
    InvoiceDraft, JobRequest, JobState, MarketVerdict, Payment, ReasonCode, ReconciliationMatch,
    StageKind, StageOutcome, StageResults,
};
use crate::rules::{RuleStore, RuleTables};
use crate::service::collaborators::{AdvisoryModel, NarrativeCollaborator, OcrCollaborator};
use crate::service::correlation::{Correlation, Parking, PaymentBook};
use crate::service::extraction::{validate_request, ExtractionStage};
use crate::service::{aggregate, compliance, fraud, market, reconciliation};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use indexmap::IndexMap;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 外部协作方, 均可缺省
#[derive(Clone, Default)]
pub struct Collaborators {
    pub ocr: Option<Arc<dyn OcrCollaborator>>,
    pub advisory: Option<Arc<dyn AdvisoryModel>>,
    pub narrator: Option<Arc<dyn NarrativeCollaborator>>,
}

const PERSIST_FAILED: &str = "DECISION_PERSIST_FAILED";

/// 提交闸门: 取消与写入决策只有一方能成功
const GATE_OPEN: u8 = 0;
const GATE_CANCELLED: u8 = 1;
const GATE_COMMITTED: u8 = 2;

/// 在途任务句柄
#[derive(Clone)]
struct JobHandle {
    cancel: CancellationToken,
    state: Arc<watch::Sender<JobState>>,
    gate: Arc<AtomicU8>,
}

impl JobHandle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(JobState::Queued);
        Self {
            cancel: CancellationToken::new(),
            state: Arc::new(tx),
            gate: Arc::new(AtomicU8::new(GATE_OPEN)),
        }
    }
}

/// 没有决策的终态, 短期保留供查询
#[derive(Debug, Clone)]
enum Settled {
    Cancelled,
    Failed(String),
}

impl Settled {
    fn lookup(self) -> DecisionLookup {
        match self {
            Settled::Cancelled => DecisionLookup::Cancelled,
            Settled::Failed(reason) => DecisionLookup::Failed { reason },
        }
    }
}

/// 单个任务的执行上下文, 只属于该任务的控制协程
struct JobContext {
    job_id: String,
    version: u32,
    cancel: CancellationToken,
    state: Arc<watch::Sender<JobState>>,
    gate: Arc<AtomicU8>,
    next_seq: u32,
    audit: Vec<AuditEntry>,
    /// 上一版本已关联的付款, 重新处理时直接对账
    replay: Option<Payment>,
    /// 本次对账使用的付款
    payment: Option<Payment>,
}

impl JobContext {
    fn current(&self) -> JobState {
        *self.state.borrow()
    }

    fn record(
        &mut self,
        state: JobState,
        stage: Option<StageKind>,
        event: &str,
        detail: Option<String>,
    ) -> AuditEntry {
        let entry = AuditEntry {
            job_id: self.job_id.clone(),
            seq: self.next_seq,
            at: Utc::now(),
            state,
            stage,
            event: event.to_string(),
            detail,
        };
        self.next_seq += 1;
        self.audit.push(entry.clone());
        entry
    }

    /// 撤销最后一条尚未落库的审计
    fn unrecord(&mut self) {
        if self.audit.pop().is_some() {
            self.next_seq -= 1;
        }
    }
}

/// 任务被取消
struct Cancelled;

/// 三个并行分析阶段的结果
struct Analysis {
    compliance: StageOutcome<ComplianceVerdict>,
    fraud: StageOutcome<FraudSignal>,
    market: StageOutcome<MarketVerdict>,
    rationales: IndexMap<StageKind, String>,
}

enum StageReport {
    Compliance(StageOutcome<ComplianceVerdict>, Option<String>),
    Fraud(StageOutcome<FraudSignal>, Option<String>),
    Market(StageOutcome<MarketVerdict>, Option<String>),
}

/// 发票决策编排器
///
/// 每个任务一个轻量控制协程; worker 信号量限制同时执行的任务数,
/// 等待付款期间释放 worker.
pub struct Orchestrator {
    config: PipelineConfig,
    rules: Arc<RuleStore>,
    store: Arc<dyn DecisionStore>,
    extraction: ExtractionStage,
    advisory: Option<Arc<dyn AdvisoryModel>>,
    narrator: Option<Arc<dyn NarrativeCollaborator>>,
    workers: Arc<Semaphore>,
    jobs: DashMap<String, JobHandle>,
    /// 无决策终态的短期缓存, 过期后由审计日志判定
    terminal: DashMap<String, (Settled, Instant)>,
    payments: PaymentBook,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        rules: Arc<RuleStore>,
        store: Arc<dyn DecisionStore>,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        let workers = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        info!(
            "Orchestrator ready: max_concurrent_jobs={}, rules={}",
            config.max_concurrent_jobs,
            rules.snapshot().version
        );
        Arc::new(Self {
            extraction: ExtractionStage::new(collaborators.ocr, config.extraction_timeout()),
            advisory: collaborators.advisory,
            narrator: collaborators.narrator,
            rules,
            store,
            workers,
            jobs: DashMap::new(),
            terminal: DashMap::new(),
            payments: PaymentBook::new(config.payment_buffer_ttl(), config.payment_buffer_capacity),
            config,
        })
    }

    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }

    /// 在途任务数
    pub fn in_flight(&self) -> usize {
        self.jobs.len()
    }

    /// 仍在缓存中的无决策终态数 (已过期的不计)
    pub fn retained_outcomes(&self) -> usize {
        self.sweep();
        self.terminal.len()
    }

    /// 尚未关联的缓存付款数
    pub fn buffered_payments(&self) -> usize {
        self.payments.buffered_count()
    }

    /// 提交任务, 立即返回 job_id
    ///
    /// 相同 job_id 的重复提交 (在途/已完成/已取消/已失败) 合并为一次, 不产生新决策.
    pub async fn submit_job(self: &Arc<Self>, request: JobRequest) -> Result<String, PipelineError> {
        // 1. 入口校验
        let request = validate_request(request).map_err(|e| {
            warn!("任务校验失败: {}", e);
            e
        })?;
        let job_id = request.job_id.clone();

        // 2. 占位: 并发的重复提交只有一个能进入
        let handle = match self.jobs.entry(job_id.clone()) {
            Entry::Occupied(_) => {
                info!(job_id = %job_id, "任务仍在处理, 合并重复提交");
                return Ok(job_id);
            }
            Entry::Vacant(slot) => slot.insert(JobHandle::new()).clone(),
        };

        // 3. 已终结的任务不再计算, 请求落库后才启动
        let admitted = async {
            if let Some(settled) = self.settled(&job_id).await? {
                return Ok::<_, PipelineError>(Some(settled));
            }
            self.store.save_request(&request).await?;
            Ok(None)
        }
        .await;
        match admitted {
            Ok(None) => {}
            Ok(Some(settled)) => {
                self.jobs.remove(&job_id);
                info!(job_id = %job_id, "任务已终结 ({}), 忽略重复提交", describe(&settled));
                return Ok(job_id);
            }
            Err(e) => {
                self.jobs.remove(&job_id);
                return Err(e);
            }
        }

        info!(job_id = %job_id, kind = ?request.kind, expect_payment = request.expect_payment, "任务已接受");
        self.launch(request, handle, 1, 0, None);
        Ok(job_id)
    }

    /// 显式重新处理: 使用原请求重跑, 写入 version + 1 的新决策
    pub async fn reprocess_job(self: &Arc<Self>, job_id: &str) -> Result<u32, PipelineError> {
        let handle = match self.jobs.entry(job_id.to_string()) {
            Entry::Occupied(_) => return Err(PipelineError::JobInFlight(job_id.to_string())),
            Entry::Vacant(slot) => slot.insert(JobHandle::new()).clone(),
        };

        let history = async {
            let request = self
                .store
                .load_request(job_id)
                .await?
                .ok_or_else(|| PipelineError::JobNotFound(job_id.to_string()))?;
            let previous = self.store.load_decision(job_id).await?;
            let audit = self.store.list_audit(job_id).await?;
            Ok::<_, PipelineError>((request, previous, audit.len()))
        }
        .await;
        let (request, previous, audit_len) = match history {
            Ok(v) => v,
            Err(e) => {
                self.jobs.remove(job_id);
                return Err(e);
            }
        };

        let version = previous.as_ref().map(|d| d.version + 1).unwrap_or(1);
        let replay = previous.and_then(|d| d.payment);
        self.terminal.remove(job_id);
        info!(job_id = %job_id, version, replay_payment = replay.is_some(), "重新处理任务");
        self.launch(
            request,
            handle,
            version,
            u32::try_from(audit_len).unwrap_or(u32::MAX),
            replay,
        );
        Ok(version)
    }

    fn launch(
        self: &Arc<Self>,
        request: JobRequest,
        handle: JobHandle,
        version: u32,
        next_seq: u32,
        replay: Option<Payment>,
    ) {
        let ctx = JobContext {
            job_id: request.job_id.clone(),
            version,
            cancel: handle.cancel,
            state: handle.state,
            gate: handle.gate,
            next_seq,
            audit: Vec::new(),
            replay,
            payment: None,
        };
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(request, ctx).await });
    }

    /// 查询决策
    pub async fn get_decision(&self, job_id: &str) -> Result<DecisionLookup, PipelineError> {
        if let Some(state) = self.jobs.get(job_id).map(|h| *h.state.borrow()) {
            if !state.is_terminal() {
                return Ok(DecisionLookup::Pending(state));
            }
        }
        Ok(self
            .settled(job_id)
            .await?
            .unwrap_or(DecisionLookup::NotFound))
    }

    /// 已终结任务的结果: 终态缓存, 其次审计日志的最后一条, 最后是最新决策
    async fn settled(&self, job_id: &str) -> Result<Option<DecisionLookup>, PipelineError> {
        self.sweep();
        if let Some(settled) = self.terminal.get(job_id).map(|e| e.value().0.clone()) {
            return Ok(Some(settled.lookup()));
        }

        let audit = self.store.list_audit(job_id).await?;
        match audit.last() {
            Some(last) if last.state == JobState::Cancelled => {
                return Ok(Some(DecisionLookup::Cancelled));
            }
            Some(last) if last.event == PERSIST_FAILED => {
                return Ok(Some(DecisionLookup::Failed {
                    reason: last.detail.clone().unwrap_or_default(),
                }));
            }
            _ => {}
        }

        Ok(self
            .store
            .load_decision(job_id)
            .await?
            .map(DecisionLookup::Ready))
    }

    fn sweep(&self) {
        let retention = self.config.terminal_retention();
        self.terminal.retain(|_, entry| entry.1.elapsed() < retention);
    }

    /// 等到任务终结 (或超时) 后查询
    pub async fn wait_for_decision(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<DecisionLookup, PipelineError> {
        if let Some(mut rx) = self.subscribe(job_id) {
            if tokio::time::timeout(timeout, rx.wait_for(|s| s.is_terminal()))
                .await
                .is_err()
            {
                debug!(job_id = %job_id, "等待决策超时 (>{:?})", timeout);
            }
        }
        self.get_decision(job_id).await
    }

    /// 订阅任务状态变化, 任务不在途时返回 None
    pub fn subscribe(&self, job_id: &str) -> Option<watch::Receiver<JobState>> {
        self.jobs.get(job_id).map(|h| h.state.subscribe())
    }

    /// 外部付款通知
    pub fn notify_payment(&self, payment: Payment) -> Correlation {
        let payment_id = payment.payment_id.clone();
        let reference = payment.reference.clone();
        let correlation = self.payments.deliver(payment);
        match &correlation {
            Correlation::Delivered(job_id) => {
                info!(payment_id = %payment_id, job_id = %job_id, "付款已关联到等待中的任务")
            }
            Correlation::Buffered => {
                info!(payment_id = %payment_id, reference = %reference, "付款暂无等待任务, 已缓存")
            }
        }
        correlation
    }

    /// 取消在途任务; 任务不存在, 已终结或已开始写入决策返回 false
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let Some(handle) = self.jobs.get(job_id) else {
            return false;
        };
        if handle.state.borrow().is_terminal() {
            return false;
        }
        if handle
            .gate
            .compare_exchange(GATE_OPEN, GATE_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!(job_id = %job_id, "决策正在写入, 取消请求无效");
            return false;
        }
        handle.cancel.cancel();
        info!(job_id = %job_id, "收到取消请求");
        true
    }

    /// 从文件热更新规则表, 在途任务继续使用各自的快照
    pub fn reload_rules(&self, path: Option<&Path>) -> Result<String, PipelineError> {
        let path = path
            .or(self.config.rules_path.as_deref())
            .ok_or_else(|| RulesError::Invalid("no rules path configured".to_string()))?;
        let tables = self.rules.reload_from(path)?;
        Ok(tables.version.clone())
    }

    /// 任务审计日志
    pub async fn audit_log(&self, job_id: &str) -> Result<Vec<AuditEntry>, PipelineError> {
        Ok(self.store.list_audit(job_id).await?)
    }

    // ========== 任务执行 ==========

    async fn run(self: Arc<Self>, request: JobRequest, mut ctx: JobContext) {
        let start = Instant::now();
        let accepted = ctx.record(
            JobState::Queued,
            None,
            "JOB_ACCEPTED",
            Some(format!("kind={:?}, version={}", request.kind, ctx.version)),
        );
        self.append(&accepted).await;

        match self.drive(&request, &mut ctx).await {
            Ok(state) => {
                info!(
                    job_id = %ctx.job_id,
                    version = ctx.version,
                    "任务结束: {}, 耗时: {:?}",
                    state,
                    start.elapsed()
                );
            }
            Err(Cancelled) => {
                self.payments.forget(&ctx.job_id);
                let entry = ctx.record(JobState::Cancelled, None, "JOB_CANCELLED", None);
                self.append(&entry).await;
                self.terminal
                    .insert(ctx.job_id.clone(), (Settled::Cancelled, Instant::now()));
                self.release(&ctx, JobState::Cancelled);
                warn!(job_id = %ctx.job_id, "任务已取消, 耗时: {:?}", start.elapsed());
            }
        }
    }

    async fn drive(&self, request: &JobRequest, ctx: &mut JobContext) -> Result<JobState, Cancelled> {
        // 1. 排队等待 worker
        let permit = self.acquire_worker(ctx).await?;

        // 2. 抽取 (失败即终结)
        self.advance(ctx, JobState::Extracting).await;
        let extract_start = Instant::now();
        let extracted = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(Cancelled),
            r = self.extraction.extract(request) => r,
        };
        let (draft, extraction_confidence) = match extracted {
            Ok(v) => v,
            Err(failure) => {
                error!(job_id = %ctx.job_id, "✗ 抽取失败, 耗时: {:?}, 错误: {}", extract_start.elapsed(), failure);
                let rules = self.rules.snapshot();
                let results = StageResults::default();
                let (status, reasons) = aggregate::decide(&results, &rules.fraud);
                commit(ctx)?;
                ctx.record(
                    JobState::Failed,
                    Some(StageKind::Extraction),
                    "EXTRACTION_FAILED",
                    Some(failure.to_string()),
                );
                let decision = compose(ctx, status, reasons, results, &rules, IndexMap::new());
                return Ok(self.conclude(ctx, decision, JobState::Failed).await);
            }
        };
        debug!(
            job_id = %ctx.job_id,
            "✓ 抽取完成, 置信度: {:.2}, 耗时: {:?}",
            extraction_confidence,
            extract_start.elapsed()
        );
        self.note(
            ctx,
            Some(StageKind::Extraction),
            "STAGE_COMPLETED",
            Some(format!("confidence={:.2}", extraction_confidence)),
        )
        .await;

        // 3. 并行分析, 同一份规则快照
        self.advance(ctx, JobState::Analyzing).await;
        let rules = self.rules.snapshot();
        let draft = Arc::new(draft);
        let analysis = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(Cancelled),
            a = self.analyze(Arc::clone(&draft), Arc::clone(&rules)) => a,
        };
        self.note_outcome(ctx, StageKind::Compliance, &analysis.compliance).await;
        self.note_outcome(ctx, StageKind::Fraud, &analysis.fraud).await;
        self.note_outcome(ctx, StageKind::Market, &analysis.market).await;

        let mut results = StageResults {
            extraction: Some(StageOutcome::Success {
                value: (*draft).clone(),
                confidence: extraction_confidence,
            }),
            compliance: Some(analysis.compliance),
            fraud: Some(analysis.fraud),
            market: Some(analysis.market),
            reconciliation: None,
        };

        // 4. 对账: 挂起期间不占 worker
        let _permit = if request.expect_payment {
            drop(permit);
            results.reconciliation = Some(self.await_payment(ctx, &draft, &rules).await?);
            self.acquire_worker(ctx).await?
        } else {
            permit
        };

        // 5. 聚合
        self.advance(ctx, JobState::Aggregating).await;
        let (status, reasons) = aggregate::decide(&results, &rules.fraud);
        let narratives = self.narrate(&results, analysis.rationales).await;
        commit(ctx)?;

        info!(
            job_id = %ctx.job_id,
            version = ctx.version,
            "决策: {:?}, 原因: {:?}",
            status,
            reasons
        );
        ctx.record(
            JobState::Done,
            None,
            "DECISION_WRITTEN",
            Some(format!("status={:?}, reasons={:?}", status, reasons)),
        );
        let decision = compose(ctx, status, reasons, results, &rules, narratives);
        Ok(self.conclude(ctx, decision, JobState::Done).await)
    }

    async fn acquire_worker(&self, ctx: &JobContext) -> Result<OwnedSemaphorePermit, Cancelled> {
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(Cancelled),
            permit = Arc::clone(&self.workers).acquire_owned() => permit.map_err(|_| Cancelled),
        }
    }

    /// 并行执行合规/欺诈/市场阶段, 任意完成顺序
    async fn analyze(&self, draft: Arc<InvoiceDraft>, rules: Arc<RuleTables>) -> Analysis {
        let factor = self.config.degraded_confidence_factor;
        let mut set = JoinSet::new();

        {
            let (draft, rules, model) = (Arc::clone(&draft), Arc::clone(&rules), self.advisory.clone());
            let timeout = self.config.compliance_timeout();
            set.spawn(async move {
                let assessment = compliance::assess(&draft, &rules);
                let (outcome, rationale) = advise(
                    StageKind::Compliance,
                    model,
                    &draft,
                    timeout,
                    factor,
                    assessment.verdict,
                    assessment.confidence,
                    assessment.degraded,
                )
                .await;
                StageReport::Compliance(outcome, rationale)
            });
        }

        {
            let (draft, rules, model) = (Arc::clone(&draft), Arc::clone(&rules), self.advisory.clone());
            let timeout = self.config.fraud_timeout();
            set.spawn(async move {
                let price_view = market::analyze_draft(&draft, &rules);
                let signal = fraud::score(&draft, Some(&price_view), &rules.fraud);
                let confidence = fraud::rule_confidence(&signal);
                let (outcome, rationale) =
                    advise(StageKind::Fraud, model, &draft, timeout, factor, signal, confidence, None).await;
                StageReport::Fraud(outcome, rationale)
            });
        }

        {
            let (draft, rules, model) = (Arc::clone(&draft), Arc::clone(&rules), self.advisory.clone());
            let timeout = self.config.market_timeout();
            set.spawn(async move {
                let verdict = market::analyze_draft(&draft, &rules);
                let confidence = market::rule_confidence(&verdict);
                let (outcome, rationale) =
                    advise(StageKind::Market, model, &draft, timeout, factor, verdict, confidence, None).await;
                StageReport::Market(outcome, rationale)
            });
        }

        let mut compliance = None;
        let mut fraud = None;
        let mut market = None;
        let mut rationales = IndexMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(StageReport::Compliance(outcome, rationale)) => {
                    keep_rationale(&mut rationales, StageKind::Compliance, rationale);
                    compliance = Some(outcome);
                }
                Ok(StageReport::Fraud(outcome, rationale)) => {
                    keep_rationale(&mut rationales, StageKind::Fraud, rationale);
                    fraud = Some(outcome);
                }
                Ok(StageReport::Market(outcome, rationale)) => {
                    keep_rationale(&mut rationales, StageKind::Market, rationale);
                    market = Some(outcome);
                }
                Err(e) => error!("✗ 分析阶段任务异常: {}", e),
            }
        }

        Analysis {
            compliance: compliance.unwrap_or_else(crashed),
            fraud: fraud.unwrap_or_else(crashed),
            market: market.unwrap_or_else(crashed),
            rationales,
        }
    }

    /// 挂起等待付款, 截止时间到仍无付款则跳过对账
    async fn await_payment(
        &self,
        ctx: &mut JobContext,
        draft: &InvoiceDraft,
        rules: &RuleTables,
    ) -> Result<StageOutcome<ReconciliationMatch>, Cancelled> {
        if let Some(payment) = ctx.replay.take() {
            info!(job_id = %ctx.job_id, payment_id = %payment.payment_id, "沿用上一版本关联的付款");
            return Ok(self.settle(ctx, draft, payment, rules).await);
        }

        let rx = match self.payments.park(&ctx.job_id, draft.invoice_number.as_deref()) {
            Parking::Ready(payment) => {
                info!(job_id = %ctx.job_id, payment_id = %payment.payment_id, "付款先于任务到达, 直接对账");
                return Ok(self.settle(ctx, draft, payment, rules).await);
            }
            Parking::Parked(rx) => rx,
        };

        self.advance(ctx, JobState::WaitingPayment).await;
        let deadline = self.config.reconciliation_deadline();
        let received = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(Cancelled),
            r = tokio::time::timeout(deadline, rx) => r,
        };

        match received {
            Ok(Ok(payment)) => Ok(self.settle(ctx, draft, payment, rules).await),
            Ok(Err(_)) | Err(_) => {
                self.payments.forget(&ctx.job_id);
                warn!(job_id = %ctx.job_id, "⚠ 等待付款超时 (>{:?}), 跳过对账", deadline);
                let reason = format!("no payment correlated within {:?}", deadline);
                self.note(ctx, Some(StageKind::Reconciliation), "STAGE_SKIPPED", Some(reason.clone()))
                    .await;
                Ok(StageOutcome::Skipped { reason })
            }
        }
    }

    async fn settle(
        &self,
        ctx: &mut JobContext,
        draft: &InvoiceDraft,
        payment: Payment,
        rules: &RuleTables,
    ) -> StageOutcome<ReconciliationMatch> {
        let matched = reconciliation::reconcile(draft, &payment, &rules.reconciliation);
        self.note(
            ctx,
            Some(StageKind::Reconciliation),
            "STAGE_COMPLETED",
            Some(format!(
                "payment={}, match={:?}, difference={}",
                payment.payment_id, matched.match_type, matched.difference
            )),
        )
        .await;
        ctx.payment = Some(payment);
        StageOutcome::Success {
            confidence: matched.confidence,
            value: matched,
        }
    }

    /// 聚合后请求叙述文本, 失败只记日志
    async fn narrate(
        &self,
        results: &StageResults,
        mut narratives: IndexMap<StageKind, String>,
    ) -> IndexMap<StageKind, String> {
        let Some(narrator) = &self.narrator else {
            return narratives;
        };
        let timeout = self.config.narrative_timeout();
        let summaries = stage_summaries(results);
        let calls = summaries.iter().map(|(stage, summary)| {
            let narrator = Arc::clone(narrator);
            async move {
                let result = tokio::time::timeout(timeout, narrator.narrate(*stage, summary)).await;
                (*stage, result)
            }
        });

        for (stage, result) in futures::future::join_all(calls).await {
            match result {
                Ok(Ok(text)) => {
                    narratives.insert(stage, text);
                }
                Ok(Err(e)) => warn!("⚠ {} 叙述生成失败: {}", stage, e),
                Err(_) => warn!("⚠ {} 叙述生成超时 (>{:?})", stage, timeout),
            }
        }
        narratives
    }

    /// 写入决策后发布终态; 写入失败则任务 FAILED
    async fn conclude(&self, ctx: &mut JobContext, decision: Decision, terminal: JobState) -> JobState {
        let start = Instant::now();
        match self.store.save_decision(&decision).await {
            Ok(()) => {
                debug!(job_id = %ctx.job_id, "✓ 决策写入成功, 耗时: {:?}", start.elapsed());
                if let Some(entry) = ctx.audit.last().cloned() {
                    self.append(&entry).await;
                }
                self.release(ctx, terminal);
                terminal
            }
            Err(e) => {
                error!(job_id = %ctx.job_id, "✗ 决策写入失败, 耗时: {:?}, 错误: {}", start.elapsed(), e);
                ctx.unrecord();
                let reason = e.to_string();
                let entry = ctx.record(JobState::Failed, None, PERSIST_FAILED, Some(reason.clone()));
                self.append(&entry).await;
                self.terminal
                    .insert(ctx.job_id.clone(), (Settled::Failed(reason), Instant::now()));
                self.release(ctx, JobState::Failed);
                JobState::Failed
            }
        }
    }

    /// 先移出在途表, 再发布终态, 订阅方醒来即可查到结果
    fn release(&self, ctx: &JobContext, terminal: JobState) {
        self.jobs.remove(&ctx.job_id);
        ctx.state.send_replace(terminal);
    }

    async fn advance(&self, ctx: &mut JobContext, next: JobState) {
        let current = ctx.current();
        debug_assert!(current.can_transition_to(next), "{} -> {}", current, next);
        let entry = ctx.record(next, None, "STATE_CHANGED", Some(format!("{} -> {}", current, next)));
        self.append(&entry).await;
        ctx.state.send_replace(next);
        debug!(job_id = %ctx.job_id, "状态迁移 {} -> {}", current, next);
    }

    async fn note(&self, ctx: &mut JobContext, stage: Option<StageKind>, event: &str, detail: Option<String>) {
        let state = ctx.current();
        let entry = ctx.record(state, stage, event, detail);
        self.append(&entry).await;
    }

    async fn note_outcome<T>(&self, ctx: &mut JobContext, stage: StageKind, outcome: &StageOutcome<T>) {
        let (event, detail) = match outcome {
            StageOutcome::Success { confidence, .. } => {
                ("STAGE_COMPLETED", format!("confidence={:.2}", confidence))
            }
            StageOutcome::Degraded { confidence, reason, .. } => {
                ("STAGE_DEGRADED", format!("confidence={:.2}, {}", confidence, reason))
            }
            StageOutcome::Skipped { reason } => ("STAGE_SKIPPED", reason.clone()),
        };
        self.note(ctx, Some(stage), event, Some(detail)).await;
    }

    async fn append(&self, entry: &AuditEntry) {
        if let Err(e) = self.store.append_audit(&entry.job_id, entry).await {
            error!(job_id = %entry.job_id, seq = entry.seq, "✗ 审计写入失败: {}", e);
        }
    }
}

/// 规则值 + 模型置信度; 模型超时或失败时降级为规则置信度 × factor
#[allow(clippy::too_many_arguments)]
async fn advise<T>(
    stage: StageKind,
    model: Option<Arc<dyn AdvisoryModel>>,
    draft: &InvoiceDraft,
    timeout: Duration,
    factor: f64,
    value: T,
    rule_confidence: f64,
    rule_degraded: Option<String>,
) -> (StageOutcome<T>, Option<String>) {
    if let Some(reason) = rule_degraded {
        return (
            StageOutcome::Degraded {
                value,
                confidence: rule_confidence,
                reason,
            },
            None,
        );
    }
    let Some(model) = model else {
        return (
            StageOutcome::Success {
                value,
                confidence: rule_confidence,
            },
            None,
        );
    };

    let reason = match tokio::time::timeout(timeout, model.assess(stage, draft)).await {
        Ok(Ok(assessment)) if assessment.confidence.is_finite() => {
            return (
                StageOutcome::Success {
                    value,
                    confidence: assessment.confidence.clamp(0.0, 100.0),
                },
                assessment.rationale,
            );
        }
        Ok(Ok(_)) => "advisory model returned a non-numeric confidence".to_string(),
        Ok(Err(e)) => {
            warn!("⚠ {} 阶段模型调用失败, 使用规则兜底: {}", stage, e);
            format!("advisory model failed: {}", e)
        }
        Err(_) => {
            warn!("⚠ {} 阶段模型超时 (>{:?}), 使用规则兜底", stage, timeout);
            format!("advisory model timed out after {:?}", timeout)
        }
    };

    (
        StageOutcome::Degraded {
            value,
            confidence: ((rule_confidence * factor) * 100.0).round() / 100.0,
            reason,
        },
        None,
    )
}

/// 关闭提交闸门; 已被取消则放弃写入
fn commit(ctx: &JobContext) -> Result<(), Cancelled> {
    ctx.gate
        .compare_exchange(GATE_OPEN, GATE_COMMITTED, Ordering::AcqRel, Ordering::Acquire)
        .map(|_| ())
        .map_err(|_| Cancelled)
}

fn describe(lookup: &DecisionLookup) -> &'static str {
    match lookup {
        DecisionLookup::Ready(_) => "已有决策",
        DecisionLookup::Cancelled => "已取消",
        DecisionLookup::Failed { .. } => "已失败",
        DecisionLookup::Pending(_) | DecisionLookup::NotFound => "未知",
    }
}

fn keep_rationale(rationales: &mut IndexMap<StageKind, String>, stage: StageKind, rationale: Option<String>) {
    if let Some(text) = rationale.filter(|t| !t.trim().is_empty()) {
        rationales.insert(stage, text);
    }
}

fn crashed<T>() -> StageOutcome<T> {
    StageOutcome::Skipped {
        reason: "stage task aborted".to_string(),
    }
}

fn compose(
    ctx: &JobContext,
    status: DecisionStatus,
    reasons: Vec<ReasonCode>,
    results: StageResults,
    rules: &RuleTables,
    narratives: IndexMap<StageKind, String>,
) -> Decision {
    Decision {
        job_id: ctx.job_id.clone(),
        version: ctx.version,
        status,
        reasons,
        overall_confidence: aggregate::overall_confidence(&results),
        stage_results: results,
        rules_version: Some(rules.version.clone()),
        narratives,
        payment: ctx.payment.clone(),
        created_at: Utc::now(),
        audit_log: ctx.audit.clone(),
    }
}

fn stage_summaries(results: &StageResults) -> Vec<(StageKind, serde_json::Value)> {
    fn push<T: Serialize>(
        out: &mut Vec<(StageKind, serde_json::Value)>,
        stage: StageKind,
        outcome: &Option<StageOutcome<T>>,
    ) {
        if let Some(outcome) = outcome.as_ref().filter(|o| !o.is_skipped()) {
            if let Ok(summary) = serde_json::to_value(outcome) {
                out.push((stage, summary));
            }
        }
    }

    let mut out = Vec::new();
    push(&mut out, StageKind::Extraction, &results.extraction);
    push(&mut out, StageKind::Compliance, &results.compliance);
    push(&mut out, StageKind::Fraud, &results.fraud);
    push(&mut out, StageKind::Market, &results.market);
    push(&mut out, StageKind::Reconciliation, &results.reconciliation);
    out
}
