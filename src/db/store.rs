use crate::error::StoreError;
use crate::models::{AuditEntry, Decision, JobRequest};
use async_trait::async_trait;
use dashmap::DashMap;

/// 持久化协作方: 决策按版本追加, 审计日志只追加
#[async_trait]
pub trait DecisionStore: Send + Sync {
    /// 保存一个新版本决策 (不覆盖历史)
    async fn save_decision(&self, decision: &Decision) -> Result<(), StoreError>;

    /// 最新版本
    async fn load_decision(&self, job_id: &str) -> Result<Option<Decision>, StoreError>;

    async fn append_audit(&self, job_id: &str, entry: &AuditEntry) -> Result<(), StoreError>;

    /// 按 seq 排序
    async fn list_audit(&self, job_id: &str) -> Result<Vec<AuditEntry>, StoreError>;

    /// 保存已接受的请求, 供重新处理使用 (同 job_id 覆盖)
    async fn save_request(&self, request: &JobRequest) -> Result<(), StoreError>;

    async fn load_request(&self, job_id: &str) -> Result<Option<JobRequest>, StoreError>;
}

/// 内存实现 (测试 / 无数据库部署)
#[derive(Debug, Default)]
pub struct MemoryStore {
    decisions: DashMap<String, Vec<Decision>>,
    audit: DashMap<String, Vec<AuditEntry>>,
    requests: DashMap<String, JobRequest>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 某任务的全部决策版本
    pub fn history(&self, job_id: &str) -> Vec<Decision> {
        self.decisions
            .get(job_id)
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DecisionStore for MemoryStore {
    async fn save_decision(&self, decision: &Decision) -> Result<(), StoreError> {
        let mut versions = self.decisions.entry(decision.job_id.clone()).or_default();
        versions.push(decision.clone());
        versions.sort_by_key(|d| d.version);
        Ok(())
    }

    async fn load_decision(&self, job_id: &str) -> Result<Option<Decision>, StoreError> {
        Ok(self
            .decisions
            .get(job_id)
            .and_then(|v| v.last().cloned()))
    }

    async fn append_audit(&self, job_id: &str, entry: &AuditEntry) -> Result<(), StoreError> {
        self.audit
            .entry(job_id.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn list_audit(&self, job_id: &str) -> Result<Vec<AuditEntry>, StoreError> {
        let mut entries = self
            .audit
            .get(job_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }

    async fn save_request(&self, request: &JobRequest) -> Result<(), StoreError> {
        self.requests.insert(request.job_id.clone(), request.clone());
        Ok(())
    }

    async fn load_request(&self, job_id: &str) -> Result<Option<JobRequest>, StoreError> {
        Ok(self.requests.get(job_id).map(|r| r.value().clone()))
    }
}
