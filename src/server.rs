use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, http::HeaderValue, routing::get};
use tokio::sync::{broadcast, watch};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::agent::{Agent, claude::ClaudeAgent, opencode::OpenCodeAgent};
use crate::api::{self, AppState, SharedState};
use crate::config::Config;
use crate::db::{DbHandle, TicketStore};
use crate::queue::TaskQueue;
use crate::worker::Worker;
use crate::ws;

/// Build the full application router: REST API plus WebSocket routes.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws/tickets", get(ws::ws_global_handler))
        .route("/ws/tickets/{ticket_id}", get(ws::ws_ticket_handler))
        .with_state(state)
}

fn cors_layer(config: &Config, dev_mode: bool) -> CorsLayer {
    if dev_mode {
        return CorsLayer::permissive();
    }
    match config.frontend_url.parse::<HeaderValue>() {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
        Err(_) => {
            warn!(
                frontend_url = %config.frontend_url,
                "FRONTEND_URL is not a valid origin, falling back to permissive CORS"
            );
            CorsLayer::permissive()
        }
    }
}

async fn open_state(config: Config) -> Result<SharedState> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let store = DbHandle::new(
        TicketStore::new(&config.db_path).context("Failed to initialize ticket database")?,
    );

    let claude_queue =
        TaskQueue::open(store.clone(), &config.claude_queue(), config.queue_max_attempts).await?;
    let opencode_queue = TaskQueue::open(
        store.clone(),
        &config.opencode_queue(),
        config.queue_max_attempts,
    )
    .await?;

    let (ws_tx, _rx) = broadcast::channel::<String>(256);
    let github = match config.github_token.as_deref() {
        Some(token) => Some(crate::github::GithubClient::new(token)?),
        None => None,
    };

    Ok(Arc::new(AppState {
        store,
        claude_queue,
        opencode_queue,
        ws_tx,
        github,
        config,
    }))
}

/// Spawn one worker per configured agent. Claude requires an API key;
/// OpenCode only needs its server URL, which always has a default.
fn spawn_workers(
    state: &SharedState,
    shutdown: &watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    match state.config.anthropic_api_key.as_deref() {
        Some(api_key) => match ClaudeAgent::new(api_key, &state.config.anthropic_model) {
            Ok(agent) => handles.push(spawn_worker(
                state,
                state.claude_queue.clone(),
                Arc::new(agent),
                shutdown.clone(),
            )),
            Err(e) => warn!(error = %e, "failed to construct Claude agent"),
        },
        None => info!("ANTHROPIC_API_KEY not set, Claude worker disabled"),
    }

    match OpenCodeAgent::new(&state.config.opencode_url) {
        Ok(agent) => handles.push(spawn_worker(
            state,
            state.opencode_queue.clone(),
            Arc::new(agent),
            shutdown.clone(),
        )),
        Err(e) => warn!(error = %e, "failed to construct OpenCode agent"),
    }

    handles
}

fn spawn_worker(
    state: &SharedState,
    queue: TaskQueue,
    agent: Arc<dyn Agent>,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let worker = Arc::new(Worker::new(
        state.store.clone(),
        queue,
        agent,
        state.github.clone(),
        state.ws_tx.clone(),
    ));
    tokio::spawn(async move {
        if let Err(e) = worker.run(shutdown).await {
            warn!(error = %e, "worker loop exited with error");
        }
    })
}

/// Start the HTTP/WebSocket server with in-process queue workers.
/// Runs until SIGINT, then stops the consume loops and drains.
pub async fn start_server(config: Config, dev_mode: bool) -> Result<()> {
    let addr = format!("{}:{}", config.api_host, config.api_port);
    let cors = cors_layer(&config, dev_mode);
    let state = open_state(config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = spawn_workers(&state, &shutdown_rx);

    let app = build_router(state).layer(cors);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!(addr = %listener.local_addr()?, "autocode listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Stop the consume loops and wait for in-flight tasks to settle.
    let _ = shutdown_tx.send(true);
    for handle in workers {
        let _ = handle.await;
    }
    info!("shut down gracefully");
    Ok(())
}

/// Run a single standalone worker process against the shared database.
/// Multiple worker processes may consume the same queue concurrently
/// (horizontal scale-out, FIFO only per claim).
pub async fn run_worker(config: Config, agent_name: &str) -> Result<()> {
    let state = open_state(config).await?;

    let (queue, agent): (TaskQueue, Arc<dyn Agent>) = match agent_name {
        "claude" => {
            let api_key = state
                .config
                .anthropic_api_key
                .as_deref()
                .context("ANTHROPIC_API_KEY is required for the claude worker")?;
            (
                state.claude_queue.clone(),
                Arc::new(ClaudeAgent::new(api_key, &state.config.anthropic_model)?),
            )
        }
        "opencode" => (
            state.opencode_queue.clone(),
            Arc::new(OpenCodeAgent::new(&state.config.opencode_url)?),
        ),
        other => anyhow::bail!("Unknown agent '{}', expected claude or opencode", other),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let worker = Arc::new(Worker::new(
        state.store.clone(),
        queue,
        agent,
        state.github.clone(),
        state.ws_tx.clone(),
    ));
    worker.run(shutdown_rx).await
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn test_state() -> SharedState {
        let store = DbHandle::new(TicketStore::new_in_memory().unwrap());
        let claude_queue = TaskQueue::open(store.clone(), "tickets.claude", 5)
            .await
            .unwrap();
        let opencode_queue = TaskQueue::open(store.clone(), "tickets.opencode", 5)
            .await
            .unwrap();
        let (ws_tx, _) = broadcast::channel(16);
        Arc::new(AppState {
            store,
            claude_queue,
            opencode_queue,
            ws_tx,
            github: None,
            config: Config::from_lookup(|_| None),
        })
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = build_router(test_state().await);
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let app = build_router(test_state().await);
        let req = Request::builder()
            .uri("/tickets")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ws_route_requires_upgrade() {
        let app = build_router(test_state().await);
        let req = Request::builder()
            .uri("/ws/tickets")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        // A plain GET without the upgrade handshake is rejected, not 404.
        assert_ne!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_cors_falls_back_on_bad_origin() {
        let mut config = Config::from_lookup(|_| None);
        config.frontend_url = "http://localhost:3000".to_string();
        let _ = cors_layer(&config, false);
        config.frontend_url = "\u{0}not-a-header".to_string();
        let _ = cors_layer(&config, false);
    }
}
