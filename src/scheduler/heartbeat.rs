use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::HealthCheckConfig;
use crate::message::{Extra, Message, Platform};
use crate::sender::{SendError, SenderManager};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Daily canned message proving the relay and its provider credentials still work.
/// Sent straight through the [`SenderManager`], bypassing the dispatcher queue.
pub struct Heartbeat {
    manager: Arc<SenderManager>,
    config: HealthCheckConfig,
    shutdown: CancellationToken,
}

impl Heartbeat {
    pub fn new(manager: Arc<SenderManager>, config: HealthCheckConfig, shutdown: CancellationToken) -> Self {
        Self {
            manager,
            config,
            shutdown,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn platform(&self) -> Platform {
        self.config.platform
    }

    /// Six-field cron expression (sec min hour dom mon dow) for `check_time`
    pub fn cron_expr(&self) -> anyhow::Result<String> {
        let (hour, minute) = self.config.time_of_day()?;
        Ok(format!("0 {} {} * * *", minute, hour))
    }

    pub fn message(&self, now: DateTime<Local>) -> Message {
        let extra = match &self.config.user_id {
            Some(user_id) => Extra::with_user_id(user_id.clone()),
            None => Extra::default(),
        };
        Message::new(
            self.config.platform,
            format!("System running normally\nChecked at: {}", now.format(TIMESTAMP_FORMAT)),
        )
        .with_summary("Daily health check")
        .with_extra(extra)
    }

    /// Send one heartbeat, bounded by the configured timeout
    pub async fn run_once(&self) -> Result<(), SendError> {
        let message = self.message(Local::now());
        let cancel = self.shutdown.child_token();

        match tokio::time::timeout(self.config.timeout(), self.manager.send(&message, &cancel)).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(SendError::Timeout)
            }
        }
    }

    /// Scheduled entry point: one heartbeat, outcome logged
    pub async fn tick(&self) {
        match self.run_once().await {
            Ok(()) => info!(
                platform = %self.config.platform,
                check_time = %Local::now().format(TIMESTAMP_FORMAT),
                "Health check completed"
            ),
            Err(e) => error!(
                platform = %self.config.platform,
                error = %e,
                "Health check failed"
            ),
        }
    }
}
