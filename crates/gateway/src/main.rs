use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ma_docstore::{DocumentStore, MemoryDocStore};
use ma_domain::config::{Config, ConfigSeverity};
use ma_gateway::api;
use ma_gateway::runtime::brain::BrainCache;
use ma_gateway::runtime::cancel::CancelMap;
use ma_gateway::runtime::presence::PresenceRegistry;
use ma_gateway::runtime::{scheduler, watchdog};
use ma_gateway::state::AppState;
use ma_gateway::workers::HttpWorkerClient;
use ma_providers::AnthropicProvider;
use ma_sessions::{ChatHistoryManager, SessionStateManager};
use ma_store::{MemoryStore, RedisStore, StateStore};

#[derive(Parser)]
#[command(name = "maestro", about = "Agent-orchestration gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway server (default).
    Serve,
    /// Validate configuration and exit.
    ConfigValidate,
    /// Print the version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = Config::load().context("loading configuration")?;
            run_server(Arc::new(config)).await
        }
        Some(Command::ConfigValidate) => {
            let config = Config::load().context("loading configuration")?;
            let issues = config.validate();
            for issue in &issues {
                eprintln!("{issue}");
            }
            if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
                std::process::exit(1);
            }
            println!("configuration OK");
            Ok(())
        }
        Some(Command::Version) => {
            println!("maestro {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing for the serve command.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ma_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("maestro starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── State store ──────────────────────────────────────────────────
    let store: Arc<dyn StateStore> = if config.kv.memory {
        tracing::warn!("running on the in-memory state store — single instance only");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(
            RedisStore::connect(&config.kv)
                .await
                .context("connecting to the state store")?,
        )
    };

    // ── Document store ───────────────────────────────────────────────
    // The production document-store client implements `DocumentStore` and
    // plugs in here; the bundled in-memory store keeps local development
    // self-contained.
    let docs: Arc<dyn DocumentStore> = Arc::new(MemoryDocStore::new());
    tracing::info!("document store ready");

    // ── LLM provider ─────────────────────────────────────────────────
    let llm = Arc::new(
        AnthropicProvider::from_config(&config.llm).context("initializing the LLM provider")?,
    );
    tracing::info!(model = %config.llm.model, "LLM provider ready");

    // ── Worker client ────────────────────────────────────────────────
    let workers = Arc::new(
        HttpWorkerClient::from_config(&config.workers).context("initializing the worker client")?,
    );
    tracing::info!(base_url = %config.workers.base_url, "worker client ready");

    // ── Session & history managers ───────────────────────────────────
    let sessions = Arc::new(SessionStateManager::new(
        store.clone(),
        docs.clone(),
        config.sessions.session_ttl_secs,
    ));
    let history = Arc::new(ChatHistoryManager::new(
        store.clone(),
        config.sessions.history_ttl_secs,
    ));
    tracing::info!("session + history managers ready");

    // ── Auth tokens (read once, kept as hashes) ──────────────────────
    let api_token_hash = api::auth::hash_from_env(&config.server.api_token_env);
    let callback_token_hash = api::auth::hash_from_env(&config.server.callback_token_env);

    let state = AppState {
        config: config.clone(),
        store: store.clone(),
        docs,
        llm,
        workers,
        sessions,
        history,
        brains: Arc::new(BrainCache::new()),
        presence: Arc::new(PresenceRegistry::new(store)),
        cancel: Arc::new(CancelMap::new()),
        api_token_hash,
        callback_token_hash,
    };

    // ── Background loops ─────────────────────────────────────────────
    let scheduler_handle = scheduler::spawn(state.clone());
    let watchdog_handle = watchdog::spawn(state.clone());
    tracing::info!(
        tick_secs = config.scheduler.tick_secs,
        sweep_secs = config.watchdog.sweep_secs,
        "scheduler + watchdog running"
    );

    // ── HTTP server ──────────────────────────────────────────────────
    let app = api::router(state.clone()).with_state(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // In-flight workflows either finish with the connection drain or are
    // already parked in the store (paused on LPT); nothing else to save.
    scheduler_handle.abort();
    watchdog_handle.abort();
    tracing::info!("maestro stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
