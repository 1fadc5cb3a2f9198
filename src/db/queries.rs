use crate::db::store::DecisionStore;
use crate::error::StoreError;
use crate::models::{AuditEntry, Decision, JobRequest, JobState, StageKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::path::Path;
use std::time::Duration;

/// 单条语句执行上限
const STATEMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// 审计行
#[derive(Debug, Clone, FromRow)]
struct AuditRow {
    job_id: String,
    seq: i32,
    at: DateTime<Utc>,
    state: String,
    stage: Option<String>,
    event: String,
    detail: Option<String>,
}

impl AuditRow {
    fn into_entry(self) -> Result<AuditEntry, StoreError> {
        let state: JobState = serde_json::from_value(serde_json::Value::String(self.state))?;
        let stage: Option<StageKind> = self
            .stage
            .map(|s| serde_json::from_value(serde_json::Value::String(s)))
            .transpose()?;
        Ok(AuditEntry {
            job_id: self.job_id,
            seq: u32::try_from(self.seq).unwrap_or_default(),
            at: self.at,
            state,
            stage,
            event: self.event,
            detail: self.detail,
        })
    }
}

/// PostgreSQL 决策存储
pub struct PgDecisionStore {
    pool: PgPool,
}

impl PgDecisionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 建表 (幂等)
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS t_job_decision (
                job_id             VARCHAR(128) NOT NULL,
                version            INTEGER      NOT NULL,
                status             VARCHAR(32)  NOT NULL,
                overall_confidence DOUBLE PRECISION NOT NULL,
                payload            JSONB        NOT NULL,
                created_at         TIMESTAMPTZ  NOT NULL,
                PRIMARY KEY (job_id, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS t_job_audit (
                job_id VARCHAR(128) NOT NULL,
                seq    INTEGER      NOT NULL,
                at     TIMESTAMPTZ  NOT NULL,
                state  VARCHAR(32)  NOT NULL,
                stage  VARCHAR(32),
                event  VARCHAR(64)  NOT NULL,
                detail TEXT,
                PRIMARY KEY (job_id, seq)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS t_job_request (
                job_id      VARCHAR(128) PRIMARY KEY,
                payload     JSONB        NOT NULL,
                received_at TIMESTAMPTZ  NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("Decision store schema ready");
        Ok(())
    }
}

/// 带超时的执行, 与慢查询日志配合定位卡住的写入
async fn execute_with_timeout<'q>(
    pool: &PgPool,
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    what: &str,
) -> Result<(), StoreError> {
    let start = std::time::Instant::now();
    match tokio::time::timeout(STATEMENT_TIMEOUT, query.execute(pool)).await {
        Ok(Ok(result)) => {
            tracing::debug!(
                "✓ {} 执行成功, 影响 {} 行, 耗时: {:?}",
                what,
                result.rows_affected(),
                start.elapsed()
            );
            Ok(())
        }
        Ok(Err(e)) => {
            tracing::error!("✗ {} 执行失败, 耗时: {:?}, 错误: {:?}", what, start.elapsed(), e);
            Err(e.into())
        }
        Err(_) => {
            tracing::error!("✗ {} 操作超时 (>{:?})!", what, STATEMENT_TIMEOUT);
            Err(sqlx::Error::PoolTimedOut.into())
        }
    }
}

#[async_trait]
impl DecisionStore for PgDecisionStore {
    async fn save_decision(&self, decision: &Decision) -> Result<(), StoreError> {
        let status = serde_json::to_value(decision.status)?;
        let query = sqlx::query(
            r#"
            INSERT INTO t_job_decision (job_id, version, status, overall_confidence, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&decision.job_id)
        .bind(i32::try_from(decision.version).unwrap_or(i32::MAX))
        .bind(status.as_str().unwrap_or_default().to_string())
        .bind(decision.overall_confidence)
        .bind(Json(decision))
        .bind(decision.created_at);

        execute_with_timeout(&self.pool, query, "INSERT decision").await
    }

    async fn load_decision(&self, job_id: &str) -> Result<Option<Decision>, StoreError> {
        let row: Option<(Json<Decision>,)> = sqlx::query_as(
            r#"
            SELECT payload
            FROM t_job_decision
            WHERE job_id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(Json(decision),)| decision))
    }

    async fn append_audit(&self, job_id: &str, entry: &AuditEntry) -> Result<(), StoreError> {
        let state = serde_json::to_value(entry.state)?;
        let stage = entry.stage.map(|s| s.as_str().to_string());
        let query = sqlx::query(
            r#"
            INSERT INTO t_job_audit (job_id, seq, at, state, stage, event, detail)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(job_id)
        .bind(i32::try_from(entry.seq).unwrap_or(i32::MAX))
        .bind(entry.at)
        .bind(state.as_str().unwrap_or_default().to_string())
        .bind(stage)
        .bind(&entry.event)
        .bind(&entry.detail);

        execute_with_timeout(&self.pool, query, "INSERT audit").await
    }

    async fn list_audit(&self, job_id: &str) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT job_id, seq, at, state, stage, event, detail
            FROM t_job_audit
            WHERE job_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AuditRow::into_entry).collect()
    }

    async fn save_request(&self, request: &JobRequest) -> Result<(), StoreError> {
        let query = sqlx::query(
            r#"
            INSERT INTO t_job_request (job_id, payload, received_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (job_id) DO UPDATE SET payload = EXCLUDED.payload, received_at = EXCLUDED.received_at
            "#,
        )
        .bind(&request.job_id)
        .bind(Json(request))
        .bind(Utc::now());

        execute_with_timeout(&self.pool, query, "UPSERT request").await
    }

    async fn load_request(&self, job_id: &str) -> Result<Option<JobRequest>, StoreError> {
        let row: Option<(Json<JobRequest>,)> = sqlx::query_as(
            r#"
            SELECT payload
            FROM t_job_request
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(Json(request),)| request))
    }
}

/// 导出审计日志到 CSV
pub fn export_audit_csv(entries: &[AuditEntry], output_path: &Path) -> Result<(), StoreError> {
    use csv::Writer;
    use std::fs::File;

    let file = File::create(output_path)?;
    let mut writer = Writer::from_writer(file);

    writer.write_record(["job_id", "seq", "at", "state", "stage", "event", "detail"])?;
    for entry in entries {
        writer.write_record(&[
            entry.job_id.clone(),
            entry.seq.to_string(),
            entry.at.to_rfc3339(),
            entry.state.to_string(),
            entry.stage.map(|s| s.to_string()).unwrap_or_default(),
            entry.event.clone(),
            entry.detail.clone().unwrap_or_default(),
        ])?;
    }

    writer.flush()?;
    Ok(())
}
