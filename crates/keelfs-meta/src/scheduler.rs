//! Background loops driving the coordinator: periodic checkpoints and the
//! liveness/re-replication tick.
//!
//! Both loops run on the tokio runtime and push the blocking coordinator
//! work onto the blocking pool. They stop when their cancellation token
//! fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::NamespaceCoordinator;
use crate::types::now_ms;

/// Checks every `period` whether a checkpoint is due and takes one.
///
/// The loop exits after a failed checkpoint, since the coordinator is then
/// halted.
pub fn spawn_checkpointer(
    coordinator: Arc<NamespaceCoordinator>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let now = now_ms();
            if !coordinator.checkpoint_due(now) {
                continue;
            }
            let c = Arc::clone(&coordinator);
            match tokio::task::spawn_blocking(move || c.checkpoint(now)).await {
                Ok(Ok(Some(watermark))) => debug!(watermark, "periodic checkpoint taken"),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "periodic checkpoint failed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "checkpoint task panicked");
                    break;
                }
            }
        }
        info!("checkpointer stopped");
    })
}

/// Runs [`NamespaceCoordinator::tick`] every `period`.
pub fn spawn_liveness_ticker(
    coordinator: Arc<NamespaceCoordinator>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let c = Arc::clone(&coordinator);
            match tokio::task::spawn_blocking(move || c.tick(now_ms())).await {
                Ok(report) => {
                    if !report.events.is_empty() || !report.tasks.is_empty() {
                        info!(
                            events = report.events.len(),
                            lost = report.lost_replicas.len(),
                            expired = report.expired.len(),
                            tasks = report.tasks.len(),
                            "liveness tick"
                        );
                    }
                }
                Err(e) => warn!(error = %e, "liveness tick panicked"),
            }
        }
        info!("liveness ticker stopped");
    })
}
