//! Scheduled background tasks using tokio-cron-scheduler.
//!
//! Two periodic duties, independent of the task queue:
//! - Session watchdog: force-fails sessions processing past the session
//!   timeout (the upper bound of the three timeout tiers).
//! - Retention sweeper: deletes terminal sessions past the retention
//!   window; the API answers 410 for them afterwards.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::domains::pipeline::orchestrator::Orchestrator;

/// Start all scheduled tasks
pub async fn start_scheduler(orch: Arc<Orchestrator>) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    // Session watchdog - runs every minute
    let watchdog_orch = orch.clone();
    let watchdog = Job::new_async("0 * * * * *", move |_uuid, _lock| {
        let orch = watchdog_orch.clone();
        Box::pin(async move {
            match orch.fail_timed_out_sessions().await {
                Ok(0) => {}
                Ok(count) => tracing::warn!(count, "force-failed timed-out sessions"),
                Err(e) => tracing::error!("session watchdog failed: {}", e),
            }
        })
    })?;
    scheduler.add(watchdog).await?;

    // Retention sweeper - runs every 10 minutes
    let sweep_orch = orch.clone();
    let sweeper = Job::new_async("0 */10 * * * *", move |_uuid, _lock| {
        let orch = sweep_orch.clone();
        Box::pin(async move {
            let retention = orch.deps().config.session.retention_seconds;
            let cutoff = Utc::now() - chrono::Duration::seconds(retention);
            match orch.deps().store.delete_expired_sessions(cutoff).await {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "swept expired sessions"),
                Err(e) => tracing::error!("retention sweep failed: {}", e),
            }
        })
    })?;
    scheduler.add(sweeper).await?;

    scheduler.start().await?;
    tracing::info!("scheduled tasks started (watchdog every minute, retention sweep every 10 minutes)");
    Ok(scheduler)
}
