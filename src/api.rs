//! RPC/HTTP surface: typed request handlers, dashboard views, WebSocket
//! event stream, and read-only static files.

pub mod rpc;
pub mod static_files;
pub mod views;
pub mod ws;

use crate::company::channels::ChannelStore;
use crate::company::tasks::TaskStore;
use crate::config::Config;
use crate::error::Result;
use anyhow::Context as _;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// Shared state for every handler.
pub struct ApiState {
    pub config: Config,
    pub channels: ChannelStore,
    pub tasks: TaskStore,
    pub broadcaster: ws::Broadcaster,
}

/// Assemble the router. Everything outside `/rpc` is read-only; static
/// files and the workspace tree are whitelisted in `static_files`.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/rpc", post(rpc::handle))
        .route("/ws", get(ws::ws_handler))
        .route("/agents-status.json", get(views::agents_status))
        .route("/tasks-data.json", get(views::tasks_data))
        .route("/_ls/{*path}", get(views::list_directory))
        .fallback(static_files::serve)
        .with_state(state)
}

/// Bind and serve until the shutdown signal flips.
pub async fn serve(
    state: Arc<ApiState>,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind http listener on {addr}"))?;
    tracing::info!(%addr, "http surface listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("http server failed")?;

    Ok(())
}
