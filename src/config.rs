use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub collaborators: CollaboratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// 未配置 url 时使用内存存储
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
}

/// 流水线调度参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_concurrent_jobs: usize,
    pub extraction_timeout_ms: u64,
    pub compliance_timeout_ms: u64,
    pub fraud_timeout_ms: u64,
    pub market_timeout_ms: u64,
    pub reconciliation_deadline_ms: u64,
    pub narrative_timeout_ms: u64,
    /// 降级阶段置信度折扣
    pub degraded_confidence_factor: f64,
    /// 未关联付款的缓存时长与上限
    pub payment_buffer_ttl_ms: u64,
    pub payment_buffer_capacity: usize,
    /// 取消/失败结果在内存中的保留时长, 过期后从审计日志回查
    pub terminal_retention_ms: u64,
    /// 外部规则表文件
    pub rules_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 16,
            extraction_timeout_ms: 15_000,
            compliance_timeout_ms: 3_000,
            fraud_timeout_ms: 3_000,
            market_timeout_ms: 3_000,
            reconciliation_deadline_ms: 24 * 60 * 60 * 1000,
            narrative_timeout_ms: 2_000,
            degraded_confidence_factor: 0.6,
            payment_buffer_ttl_ms: 24 * 60 * 60 * 1000,
            payment_buffer_capacity: 10_000,
            terminal_retention_ms: 60 * 60 * 1000,
            rules_path: None,
        }
    }
}

impl PipelineConfig {
    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_millis(self.extraction_timeout_ms)
    }

    pub fn compliance_timeout(&self) -> Duration {
        Duration::from_millis(self.compliance_timeout_ms)
    }

    pub fn fraud_timeout(&self) -> Duration {
        Duration::from_millis(self.fraud_timeout_ms)
    }

    pub fn market_timeout(&self) -> Duration {
        Duration::from_millis(self.market_timeout_ms)
    }

    pub fn reconciliation_deadline(&self) -> Duration {
        Duration::from_millis(self.reconciliation_deadline_ms)
    }

    pub fn narrative_timeout(&self) -> Duration {
        Duration::from_millis(self.narrative_timeout_ms)
    }

    pub fn payment_buffer_ttl(&self) -> Duration {
        Duration::from_millis(self.payment_buffer_ttl_ms)
    }

    pub fn terminal_retention(&self) -> Duration {
        Duration::from_millis(self.terminal_retention_ms)
    }
}

/// HTTP 协作方地址, 未配置即不启用
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CollaboratorConfig {
    pub ocr_url: Option<String>,
    pub narrative_url: Option<String>,
    pub advisory_url: Option<String>,
}

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.server.host =
            std::env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        config.server.port = std::env::var("SERVER_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);
        config.database.url = std::env::var("DATABASE_URL").ok();
        config
    }

    /// 默认值 -> 配置文件 (可选) -> DECISION__* 环境变量
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, config::ConfigError> {
        let defaults = config::Config::try_from(&Self::from_env())?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix("DECISION")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}
