pub mod heartbeat;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use self::heartbeat::Heartbeat;

/// Cron runtime for the relay's periodic jobs. Schedules are evaluated in
/// the host's local time zone.
pub struct Scheduler {
    jobs: JobScheduler,
}

impl Scheduler {
    pub async fn new() -> Result<Self> {
        let jobs = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        Ok(Self { jobs })
    }

    /// Schedule the daily health check at its configured `check_time`.
    /// Returns `false` without scheduling anything when the check is disabled.
    pub async fn schedule_heartbeat(&self, heartbeat: Arc<Heartbeat>) -> Result<bool> {
        if !heartbeat.enabled() {
            info!("Health check is disabled");
            return Ok(false);
        }

        let cron_expr = heartbeat.cron_expr()?;
        let platform = heartbeat.platform();
        let job = Job::new_async_tz(cron_expr.as_str(), Local, move |_id, _jobs| {
            let heartbeat = heartbeat.clone();
            Box::pin(async move { heartbeat.tick().await })
        })
        .with_context(|| format!("Invalid health check schedule: {}", cron_expr))?;

        self.jobs
            .add(job)
            .await
            .context("Failed to schedule health check")?;

        info!(cron = %cron_expr, platform = %platform, "Health check scheduled");
        Ok(true)
    }

    pub async fn start(&self) -> Result<()> {
        self.jobs.start().await.context("Failed to start scheduler")?;
        info!("Scheduler started");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.jobs
            .shutdown()
            .await
            .context("Failed to shut down scheduler")?;
        info!("Scheduler stopped");
        Ok(())
    }
}
