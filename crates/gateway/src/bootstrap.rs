//! Startup wiring: configuration, store selection, engine assembly,
//! background services, HTTP server.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use tarsy_domain::config::Config;
use tarsy_engine::background::{
    spawn_cancellation_listener, HistoryRetentionService, McpHealthMonitor, OrphanSweeper,
};
use tarsy_engine::hooks::EngineHooks;
use tarsy_engine::{
    AgentRegistry, AlertService, CancellationTracker, ChainExecutor, ChainRegistry,
    SessionRunner, SessionService, SystemWarnings, WorkerPool,
};
use tarsy_events::{EventBus, EventCleanupService, PollingEventBus, PostgresEventBus};
use tarsy_llm::{LlmClient, ProviderRegistry};
use tarsy_mcp::McpRecoveryConfig;
use tarsy_store::{MemoryStore, PgStore, Store};

use crate::api;
use crate::state::AppState;
use crate::ws::hub::WsHub;

/// How often the MCP health monitor refreshes its tool cache.
const MCP_HEALTH_INTERVAL: Duration = Duration::from_secs(300);
/// Poll cadence of the non-notify event bus.
const EVENT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_yaml::from_str(&raw)
                .with_context(|| format!("parsing config {}", path.display()))
        }
        None => Ok(Config::default()),
    }
}

pub async fn run(config: Config, bind: SocketAddr) -> anyhow::Result<()> {
    let warnings = Arc::new(SystemWarnings::new());
    warnings.extend(config.validate().context("invalid configuration")?);

    let settings = Arc::new(config.settings.clone());

    // Store + event bus pair: Postgres gets the notify-capable bus, the
    // in-memory store gets the polling bus.
    let (store, bus): (Arc<dyn Store>, Arc<dyn EventBus>) =
        if settings.database_url.starts_with("postgres") {
            let pg = Arc::new(
                PgStore::connect(&settings.database_url)
                    .await
                    .context("connecting to postgres")?,
            );
            let bus = Arc::new(
                PostgresEventBus::new(Arc::clone(&pg))
                    .await
                    .context("starting notify listener")?,
            );
            tracing::info!("using postgres store with LISTEN/NOTIFY events");
            (pg, bus)
        } else {
            let memory = Arc::new(MemoryStore::new());
            let bus = Arc::new(PollingEventBus::new(
                Arc::clone(&memory) as Arc<dyn Store>,
                EVENT_POLL_INTERVAL,
            ));
            warnings.add("using in-memory store: state is lost on restart");
            (memory, bus)
        };

    // Engine assembly.
    let sink = Arc::new(EngineHooks::new(Arc::clone(&store), Arc::clone(&bus)));
    let (providers, provider_warnings) = ProviderRegistry::from_config(&config.llm);
    warnings.extend(provider_warnings);
    let llm = Arc::new(LlmClient::new(
        Arc::new(providers),
        Arc::clone(&bus),
        sink.clone() as Arc<dyn tarsy_domain::sink::InteractionSink>,
    ));
    let chains = Arc::new(ChainRegistry::from_config(&config)?);
    let agents = Arc::new(AgentRegistry::from_config(&config));
    let tracker = Arc::new(CancellationTracker::new());
    let mcp_config = Arc::new(config.mcp.clone());
    let mcp_recovery = McpRecoveryConfig::from(&config.mcp.recovery);

    let executor = Arc::new(ChainExecutor::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&llm),
        Arc::clone(&mcp_config),
        mcp_recovery.clone(),
        Arc::clone(&agents),
        Arc::clone(&settings),
        sink.clone() as Arc<dyn tarsy_domain::sink::InteractionSink>,
        Arc::clone(&tracker),
    ));
    let runner = Arc::new(SessionRunner::new(
        executor,
        Arc::clone(&store),
        Arc::clone(&tracker),
        settings.session_heartbeat_secs,
    ));
    let alerts = Arc::new(AlertService::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&chains),
        Arc::clone(&settings),
    ));
    let sessions = Arc::new(SessionService::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&tracker),
        Arc::clone(&runner),
        Arc::clone(&settings),
    ));

    // Background services.
    let workers = Arc::new(WorkerPool::new(
        Arc::clone(&store),
        Arc::clone(&runner),
        Arc::clone(&settings),
    ));
    workers.start();

    let cancellations = spawn_cancellation_listener(Arc::clone(&bus), Arc::clone(&tracker));

    let event_cleanup = EventCleanupService::new(
        Arc::clone(&store),
        settings.event_retention_hours,
        settings.event_cleanup_interval_hours,
    );
    event_cleanup.start();

    let orphan_sweeper = Arc::new(OrphanSweeper::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        &settings,
    ));
    orphan_sweeper.start();

    let retention = Arc::new(HistoryRetentionService::new(Arc::clone(&store), &settings));
    retention.start();

    let mcp_health = Arc::new(McpHealthMonitor::new(
        Arc::clone(&mcp_config),
        mcp_recovery,
        MCP_HEALTH_INTERVAL,
    ));
    mcp_health.start();

    // HTTP surface.
    let hub = WsHub::new(Arc::clone(&bus));
    let state = AppState {
        store,
        bus,
        alerts,
        sessions,
        warnings,
        mcp_health: Arc::clone(&mcp_health),
        hub,
    };
    let router = api::router(state);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(addr = %bind, pod_id = %settings.pod_id, "tarsy gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("http server")?;

    // Orderly teardown: stop claiming, stop sweeps, drop the listener.
    workers.stop().await;
    event_cleanup.stop().await;
    orphan_sweeper.stop();
    retention.stop();
    mcp_health.stop();
    cancellations.abort();
    tracing::info!("tarsy gateway stopped");
    Ok(())
}
