mod config;
mod dispatcher;
mod logging;
mod message;
mod ratelimit;
mod scheduler;
mod sender;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::message::Platform;
use crate::scheduler::heartbeat::Heartbeat;
use crate::scheduler::Scheduler;
use crate::sender::dingtalk::DingTalkSender;
use crate::sender::SenderManager;
use crate::server::AppState;

fn build_senders(config: &Config) -> Result<SenderManager> {
    let mut manager = SenderManager::new();

    let wechat = sender::wechat::create_sender(&config.wechat)
        .with_context(|| format!("Failed to create WeChat sender ({})", config.wechat.sender_type))?;
    manager.register(Platform::Wechat, wechat);

    let dingtalk =
        DingTalkSender::new(config.dingtalk.clone()).context("Failed to create DingTalk sender")?;
    manager.register(Platform::Dingtalk, Arc::new(dingtalk));

    let missing = manager.missing(&Platform::ALL);
    if !missing.is_empty() {
        anyhow::bail!("No sender registered for platforms: {:?}", missing);
    }

    info!(senders = manager.len(), "Senders ready");
    Ok(manager)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    // Initialize logging
    logging::init(&config.log)?;

    info!("Configuration loaded from: {}", config_path.display());
    info!("  WeChat sender: {}", config.wechat.sender_type);
    info!(
        "  Dispatcher: capacity {}, workers {}",
        config.dispatcher.capacity(),
        config.dispatcher.workers()
    );

    let manager = Arc::new(build_senders(&config)?);
    let shutdown = CancellationToken::new();

    // Start the dispatcher
    let dispatcher = Arc::new(Dispatcher::from_config(&config.dispatcher, manager.clone()));
    dispatcher.start(shutdown.clone());

    // Daily health check
    let mut scheduler = Scheduler::new().await?;
    let heartbeat = Arc::new(Heartbeat::new(
        manager.clone(),
        config.health_check.clone(),
        shutdown.clone(),
    ));
    scheduler.schedule_heartbeat(heartbeat).await?;
    scheduler.start().await?;

    // Serve HTTP until a shutdown signal arrives
    let app = server::router(
        AppState::new(dispatcher.clone(), config.server.token.as_str()),
        config.server.request_timeout(),
    );
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    info!("Notify relay listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Graceful shutdown: stop the scheduler, drain the queue, then cancel stragglers
    if let Err(e) = scheduler.shutdown().await {
        warn!("{:#}", e);
    }

    let grace = config.dispatcher.shutdown_grace();
    if tokio::time::timeout(grace, dispatcher.stop()).await.is_err() {
        warn!(
            grace_secs = grace.as_secs(),
            "Dispatcher did not drain in time, cancelling in-flight deliveries"
        );
        shutdown.cancel();
        dispatcher.stop().await;
    }
    shutdown.cancel();
    manager.close();

    info!("Server shutdown complete");
    Ok(())
}
