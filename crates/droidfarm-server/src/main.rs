use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::HeaderValue;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use droidfarm_core::events::EventBus;
use droidfarm_durable::PostgresDurableStore;
use droidfarm_live::{LiveStore, RedisLiveStore};
use droidfarm_server::{
    default_rules, AlertManager, CoordinatorConfig, LivenessMonitor, MetricsCollector,
    NodeGateway, QueueManager, RemoteTaskExecutor, ServerConfig, StateManager, SyncWriter,
    WorkflowCoordinator,
};

#[derive(Clone)]
struct AppState {
    metrics: Arc<MetricsCollector>,
    gateway: Arc<NodeGateway>,
    live: Arc<dyn LiveStore>,
    durable: Arc<dyn droidfarm_durable::DurableStore>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    connected_nodes: usize,
    live_store: &'static str,
    durable_store: &'static str,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("droidfarm_server=debug,info")),
        )
        .init();

    let config = ServerConfig::from_env();
    tracing::info!(addr = %config.bind_addr(), "droidfarm-server starting");

    // Fail fast when the live store is unreachable; the durable store gets
    // the same treatment via connect + migrate
    let live: Arc<dyn LiveStore> = Arc::new(
        RedisLiveStore::connect(&config.redis_url)
            .await
            .context("live store unreachable")?,
    );
    live.ping().await.context("live store ping failed")?;

    let postgres = PostgresDurableStore::connect(&config.database_url)
        .await
        .context("durable store unreachable")?;
    postgres.migrate().await.context("migration failed")?;
    let durable: Arc<dyn droidfarm_durable::DurableStore> = Arc::new(postgres);

    let bus = EventBus::new();
    let state = StateManager::new(live.clone(), bus.clone());
    let queues = QueueManager::new(live.clone(), bus.clone());
    let remote = Arc::new(RemoteTaskExecutor::new(config.celery_api_url.clone()));

    let (workflow_events_tx, workflow_events_rx) = mpsc::unbounded_channel();
    let gateway = NodeGateway::new(state.clone(), workflow_events_tx);

    let coordinator = WorkflowCoordinator::new(
        queues.clone(),
        state.clone(),
        gateway.clone(),
        remote,
        bus.clone(),
        CoordinatorConfig {
            job_timeout: config.job_timeout,
            agent_response_timeout: config.agent_response_timeout,
            node_concurrency: config.node_concurrency,
            ..Default::default()
        },
    );
    coordinator.start(workflow_events_rx);

    let shutdown = CancellationToken::new();

    let sync_writer = SyncWriter::new(durable.clone(), bus.clone());
    tokio::spawn(sync_writer.run(shutdown.clone()));

    let liveness = LivenessMonitor::new(
        state.clone(),
        durable.clone(),
        config.liveness_interval,
        config.heartbeat_timeout,
    );
    tokio::spawn(liveness.run(shutdown.clone()));

    let metrics = MetricsCollector::new(
        state.clone(),
        queues.clone(),
        coordinator.clone(),
        live.clone(),
        bus.clone(),
        config.metrics_interval,
    );
    tokio::spawn(metrics.clone().run(shutdown.clone()));

    let alerts = AlertManager::new(durable.clone(), live.clone(), bus.clone(), default_rules());
    tokio::spawn(alerts.run(shutdown.clone()));

    // Gateway endpoint plus the two operational routes; the admin REST API
    // lives in its own service
    let cors = if config.node_env == "development" || config.cors_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };

    let app_state = AppState {
        metrics: metrics.clone(),
        gateway: gateway.clone(),
        live: live.clone(),
        durable: durable.clone(),
    };
    let app = Router::new()
        .route("/ws", get(NodeGateway::ws_handler))
        .with_state(gateway.clone())
        .merge(
            Router::new()
                .route("/health", get(health))
                .route("/metrics", get(metrics_export))
                .with_state(app_state),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .context("bind failed")?;
    tracing::info!("listening for nodes");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            server_shutdown.cancel();
        })
        .await
        .context("server error")?;

    // Drain: close node sessions, reject pending jobs, stop the pumps
    gateway.close_all();
    coordinator.stop().await;
    shutdown.cancel();
    tracing::info!("droidfarm-server stopped");
    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let live_store = if state.live.ping().await.is_ok() {
        "ok"
    } else {
        "unreachable"
    };
    let durable_store = if state.durable.ping().await.is_ok() {
        "ok"
    } else {
        "unreachable"
    };
    Json(HealthResponse {
        status: if live_store == "ok" && durable_store == "ok" {
            "ok"
        } else {
            "degraded"
        },
        version: env!("CARGO_PKG_VERSION"),
        connected_nodes: state.gateway.connected_nodes().len(),
        live_store,
        durable_store,
    })
}

async fn metrics_export(State(state): State<AppState>) -> String {
    state.metrics.prometheus_export()
}
