//! Windlass Server
//!
//! An async Rust server exposing the workflow execution core over HTTP:
//! execution lifecycle, worker task polling, schedules, and visibility.

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use windlass_engine::{Engine, WorkerRegistry};
use windlass_server::{config::ServerConfig, handlers, state::AppState};

/// Initialize tracing/logging.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "info,windlass_engine=debug,windlass_server=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build the application router with all routes.
fn build_router(state: AppState) -> Router {
    // CORS configuration - allow all origins for development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let health_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/health", get(handlers::health::api_health));

    let execution_routes = Router::new()
        .route("/api/executions", post(handlers::executions::start))
        .route("/api/executions", get(handlers::executions::list))
        .route("/api/executions/count", get(handlers::executions::count))
        .route(
            "/api/executions/{workflow_id}",
            get(handlers::executions::describe),
        )
        .route(
            "/api/executions/{workflow_id}/history",
            get(handlers::executions::history),
        )
        .route(
            "/api/executions/{workflow_id}/result",
            get(handlers::executions::result),
        )
        .route(
            "/api/executions/{workflow_id}/signal",
            post(handlers::executions::signal),
        )
        .route(
            "/api/executions/{workflow_id}/query",
            post(handlers::executions::query),
        )
        .route(
            "/api/executions/{workflow_id}/update",
            post(handlers::executions::update),
        )
        .route(
            "/api/executions/{workflow_id}/cancel",
            post(handlers::executions::cancel),
        )
        .route(
            "/api/executions/{workflow_id}/terminate",
            post(handlers::executions::terminate),
        );

    let task_routes = Router::new()
        .route(
            "/api/tasks/workflow/poll",
            post(handlers::tasks::poll_workflow),
        )
        .route(
            "/api/tasks/workflow/complete",
            post(handlers::tasks::complete_workflow),
        )
        .route(
            "/api/tasks/workflow/fail",
            post(handlers::tasks::fail_workflow),
        )
        .route(
            "/api/tasks/activity/poll",
            post(handlers::tasks::poll_activity),
        )
        .route(
            "/api/tasks/activity/complete",
            post(handlers::tasks::complete_activity),
        )
        .route(
            "/api/tasks/activity/fail",
            post(handlers::tasks::fail_activity),
        )
        .route(
            "/api/tasks/activity/heartbeat",
            post(handlers::tasks::heartbeat),
        );

    let schedule_routes = Router::new()
        .route("/api/schedules", post(handlers::schedules::create))
        .route("/api/schedules", get(handlers::schedules::list))
        .route(
            "/api/schedules/{schedule_id}",
            get(handlers::schedules::describe),
        )
        .route(
            "/api/schedules/{schedule_id}",
            delete(handlers::schedules::delete),
        )
        .route(
            "/api/schedules/{schedule_id}/pause",
            post(handlers::schedules::pause),
        )
        .route(
            "/api/schedules/{schedule_id}/unpause",
            post(handlers::schedules::unpause),
        )
        .route(
            "/api/schedules/{schedule_id}/trigger",
            post(handlers::schedules::trigger),
        );

    Router::new()
        .merge(health_routes)
        .merge(execution_routes)
        .merge(task_routes)
        .merge(schedule_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install shutdown signal handler");
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = ServerConfig::from_env()?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        server_name = %config.server_name,
        "Starting Windlass server"
    );

    let registry = Arc::new(WorkerRegistry::new());
    let engine = Engine::new(registry.clone());
    let state = AppState::new(engine, registry, config.clone());

    let app = build_router(state);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Windlass server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
