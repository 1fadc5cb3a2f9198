use invoice_decision::service::{
    AdvisoryModel, HttpAdvisoryModel, HttpNarrator, HttpOcrClient, NarrativeCollaborator,
    OcrCollaborator,
};
use invoice_decision::{
    api, create_pool, AppConfig, Collaborators, DecisionStore, MemoryStore, Orchestrator,
    PgDecisionStore, RuleStore, RuleTables,
};
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceBuilder;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志 - 使用本地时间格式, RUST_LOG 控制级别
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    // 加载配置
    let config_path = std::env::var("DECISION_CONFIG").ok().map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref())?;
    info!("Starting server with config: {:?}", config);

    // 决策存储: 配置了数据库则用 PostgreSQL, 否则内存
    let store: Arc<dyn DecisionStore> = match &config.database.url {
        Some(url) => {
            let pool = create_pool(url, 10).await?;
            let store = PgDecisionStore::new(pool);
            store.ensure_schema().await?;
            info!("Database pool created");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL 未配置, 使用内存存储 (重启后决策丢失)");
            Arc::new(MemoryStore::new())
        }
    };

    // 规则表
    let rules = match &config.pipeline.rules_path {
        Some(path) => RuleStore::new(RuleTables::load(path)?),
        None => RuleStore::default(),
    };
    info!("Rule tables loaded: {}", rules.snapshot().version);

    // 外部协作方
    let pipeline = &config.pipeline;
    let ocr: Option<Arc<dyn OcrCollaborator>> = match &config.collaborators.ocr_url {
        Some(url) => Some(Arc::new(HttpOcrClient::new(url.as_str(), pipeline.extraction_timeout())?)),
        None => None,
    };
    let advisory: Option<Arc<dyn AdvisoryModel>> = match &config.collaborators.advisory_url {
        Some(url) => Some(Arc::new(HttpAdvisoryModel::new(url.as_str(), pipeline.compliance_timeout())?)),
        None => None,
    };
    let narrator: Option<Arc<dyn NarrativeCollaborator>> = match &config.collaborators.narrative_url {
        Some(url) => Some(Arc::new(HttpNarrator::new(url.as_str(), pipeline.narrative_timeout())?)),
        None => None,
    };
    info!(
        "Collaborators: ocr={}, advisory={}, narrator={}",
        ocr.is_some(),
        advisory.is_some(),
        narrator.is_some()
    );

    let orchestrator = Orchestrator::new(
        config.pipeline.clone(),
        Arc::new(rules),
        store,
        Collaborators {
            ocr,
            advisory,
            narrator,
        },
    );

    let app = api::router(orchestrator).layer(ServiceBuilder::new());

    // 启动服务器
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);
    info!("API Endpoints:");
    info!("  POST /api/jobs                 - submit invoice job");
    info!("  GET  /api/jobs/:id             - decision / job state");
    info!("  POST /api/jobs/:id/cancel      - cancel in-flight job");
    info!("  POST /api/jobs/:id/reprocess   - recompute as new version");
    info!("  POST /api/payments             - payment notification");
    info!("  POST /api/rules/reload         - hot swap rule tables");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
