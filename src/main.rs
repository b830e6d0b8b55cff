use std::sync::Arc;
use std::time::Duration;

use leadpilot::config::EngineConfig;
use leadpilot::knowledge::InMemoryKnowledgeStore;
use leadpilot::llm::{LlmBackend, LlmConfig, create_provider};
use leadpilot::orchestrator::TurnOrchestrator;
use leadpilot::scheduler::{DueDispatcher, ReviewLoop, SchedulerState};
use leadpilot::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // Read API key from environment
    let api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_else(|_| {
        eprintln!("Error: ANTHROPIC_API_KEY not set");
        eprintln!("  export ANTHROPIC_API_KEY=sk-ant-...");
        std::process::exit(1);
    });

    let model = std::env::var("LEADPILOT_MODEL")
        .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string());

    let mut config = EngineConfig::default();
    if let Ok(secs) = std::env::var("LEADPILOT_REVIEW_INTERVAL_SECS")
        && let Ok(secs) = secs.parse::<u64>()
    {
        config.scheduler.review_interval = Duration::from_secs(secs);
    }
    if let Ok(secs) = std::env::var("LEADPILOT_DISPATCH_INTERVAL_SECS")
        && let Ok(secs) = secs.parse::<u64>()
    {
        config.scheduler.dispatch_interval = Duration::from_secs(secs);
    }

    eprintln!("leadpilot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", model);

    // Create LLM provider
    let llm_config = LlmConfig {
        backend: LlmBackend::Anthropic,
        api_key: secrecy::SecretString::from(api_key),
        model,
    };
    let provider = create_provider(&llm_config)?;

    // ── Database ─────────────────────────────────────────────────────────
    let db_path =
        std::env::var("LEADPILOT_DB_PATH").unwrap_or_else(|_| "./data/leadpilot.db".to_string());

    let db_path_ref = std::path::Path::new(&db_path);
    let store: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(db_path_ref)
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", db_path, e);
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", db_path);

    // Knowledge is fed by an external ingestion service; until one is
    // attached the engine runs with an empty in-memory store.
    let knowledge = Arc::new(InMemoryKnowledgeStore::new());

    // ── Engine wiring ────────────────────────────────────────────────────
    let orchestrator = Arc::new(TurnOrchestrator::new(
        Arc::clone(&store),
        provider,
        knowledge,
        config.clone(),
    ));

    let state = Arc::new(SchedulerState::new());
    let review = Arc::new(ReviewLoop::new(
        Arc::clone(&store),
        config.scheduler.clone(),
        Arc::clone(&state),
    ));
    let dispatcher = Arc::new(DueDispatcher::new(
        Arc::clone(&store),
        orchestrator,
        config.scheduler.clone(),
        Arc::clone(&state),
    ));

    let review_handle = tokio::spawn(review.run());
    let dispatch_handle = tokio::spawn(dispatcher.run());
    tracing::info!("Scheduler loops started");

    // In-flight memory refreshes may be dropped here; at most one
    // summarization cycle is lost.
    tokio::signal::ctrl_c().await?;
    tracing::info!(status = ?state.status(), "Shutting down");
    review_handle.abort();
    dispatch_handle.abort();

    Ok(())
}
