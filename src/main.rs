//! Concierge 服务入口
//!
//! 启动顺序：日志 → 配置 → SQLite → 组件装配 → 启动时 KB 同步（失败不退出）→ axum。
//!
//! 环境变量:
//! - OPENAI_API_KEY: LLM / 嵌入 API Key
//! - CONCIERGE__*: 覆盖 config/default.toml 中的任意键

use std::sync::Arc;

use concierge::booking::create_resolver;
use concierge::config::load_config;
use concierge::conversation::ConciergeService;
use concierge::handoff::HandoffNotifier;
use concierge::http::{create_router, AppState};
use concierge::kb::{JsonWorkbookSource, KbSource, KbStore};
use concierge::llm::{OpenAiChatClient, OpenAiEmbeddingClient};
use concierge::observability;
use concierge::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None)?;

    if let Some(parent) = cfg.storage.sqlite_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let store = Store::new(&cfg.storage.sqlite_path).await?;

    let chat = Arc::new(OpenAiChatClient::from_config(&cfg.llm));
    let embedder = Arc::new(OpenAiEmbeddingClient::from_config(&cfg.llm));
    let kb = Arc::new(KbStore::new(
        store.clone(),
        embedder,
        cfg.kb.top_k,
        cfg.kb.min_score,
    ));
    let kb_source: Arc<dyn KbSource> = Arc::new(JsonWorkbookSource::new(&cfg.kb.source_path));

    // 启动时同步一次 KB；失败（如缺 API Key）只记日志，服务照常起
    match kb.sync(kb_source.as_ref()).await {
        Ok(report) if report.skipped => {
            tracing::warn!(path = %cfg.kb.source_path.display(), "KB source unavailable, keeping previous state");
        }
        Ok(report) => {
            tracing::info!(
                inserted = report.inserted,
                deleted = report.deleted,
                total = report.total,
                "KB synced"
            );
        }
        Err(e) => {
            tracing::warn!("KB load failed: {}", e);
        }
    }

    let booking = create_resolver(&cfg.booking)?;
    let notifier = Arc::new(HandoffNotifier::from_config(&cfg.handoff));
    let service = Arc::new(ConciergeService::new(
        store.clone(),
        kb.clone(),
        booking,
        chat,
        notifier,
        &cfg.conversation,
        &cfg.handoff.operator_name,
    ));

    let state = Arc::new(AppState {
        service,
        store,
        kb,
        kb_source,
        admin_api_key: cfg.admin.api_key.clone(),
    });
    let app = create_router(state);

    let addr: std::net::SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port).parse()?;
    tracing::info!("Concierge server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
