//! Company core server: stores, trigger engine, watchdog, HTTP surface.

use openclaw_company::api::{self, ApiState};
use openclaw_company::company::channels::ChannelStore;
use openclaw_company::company::tasks::TaskStore;
use openclaw_company::company::bootstrap;
use openclaw_company::gateway::HttpGateway;
use openclaw_company::llm_log::CallLogger;
use openclaw_company::trigger::TriggerEngine;
use openclaw_company::watchdog::Watchdog;
use openclaw_company::{events, CompanyDb, Config};

use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// How long in-flight gateway calls get to finish after the subsystems
/// stop issuing new ones.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::load();
    tracing::info!(state_dir = %config.state_dir.display(), "starting company core");

    let db = CompanyDb::connect(&config.state_dir).await?;

    let channel_events = events::bus();
    let task_events = events::bus();
    let channels = ChannelStore::new(db.channels.clone(), channel_events.clone());
    let tasks = TaskStore::new(db.tasks.clone(), task_events.clone());

    // The seed channel exists from first startup onward.
    bootstrap::ensure_seed_channel(&channels, &config.default_agent_id).await?;

    let broadcaster = api::ws::Broadcaster::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let trigger = TriggerEngine::new(
        channels.clone(),
        config.roster(),
        Arc::new(HttpGateway::new(config.gateway_url.clone())),
        broadcaster.clone(),
        CallLogger::new(config.llm_call_log_file.clone()),
        config.trigger_cooldown_ms,
        config.gateway_timeout_secs,
    );
    let trigger_handle = trigger.spawn(channel_events.subscribe(), shutdown_rx.clone());

    let watchdog = Watchdog::new(
        tasks.clone(),
        task_events.clone(),
        broadcaster.clone(),
        config.stale_threshold_ms,
        config.check_interval_ms,
    );
    let watchdog_handle = watchdog.spawn(shutdown_rx.clone());

    // Dashboards also see task events the trigger engine never touches.
    spawn_task_event_forwarder(task_events.subscribe(), broadcaster.clone(), shutdown_rx.clone());

    let addr = config.http_addr;
    let state = Arc::new(ApiState {
        config,
        channels,
        tasks,
        broadcaster,
    });

    let server = tokio::spawn(api::serve(state, addr, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    // Order matters: stop the wake-up sources first so no new gateway
    // calls start, give in-flight calls a grace period, then stop the
    // server and close the stores.
    let _ = shutdown_tx.send(true);
    let _ = trigger_handle.await;
    let _ = watchdog_handle.await;
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => tracing::error!(%error, "http server exited with error"),
        Err(error) => tracing::error!(%error, "http server task panicked"),
    }

    db.close().await;
    tracing::info!("company core stopped");
    Ok(())
}

/// Relay task events to connected dashboards as WebSocket frames.
fn spawn_task_event_forwarder(
    mut events: tokio::sync::broadcast::Receiver<events::TaskEvent>,
    broadcaster: api::ws::Broadcaster,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                event = events.recv() => match event {
                    // The watchdog broadcasts its own stale alerts.
                    Ok(events::TaskEvent::Stale { .. }) => {}
                    Ok(event) => broadcaster.broadcast(event.name(), event.payload()),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "task event forwarder lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}

/// Tracing to stderr, plus a daily-rolling file when `OPENCLAW_LOG_DIR`
/// is set (background/supervised operation).
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().compact();

    match std::env::var("OPENCLAW_LOG_DIR") {
        Ok(log_dir) if !log_dir.is_empty() => {
            let file_appender = tracing_appender::rolling::daily(log_dir, "company.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            // Keep the writer alive for the whole process.
            std::mem::forget(guard);

            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .compact();
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .with(file_layer)
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .init();
        }
    }
}
