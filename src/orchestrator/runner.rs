//! Agent main loop.
//!
//! Each cycle runs one session tick, then fetches pending commands and
//! applies them. A failed cycle is logged and followed by the longer
//! error backoff instead of the normal check interval.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Result;

use super::coordinator::CoordinatorClient;
use super::session_manager::SessionManager;

/// Pauses between cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    /// Pause after a successful cycle.
    pub check_interval: Duration,
    /// Pause after a failed cycle.
    pub error_backoff: Duration,
}

/// Run one cycle.
///
/// The session tick runs before commands are fetched, so it never waits
/// on the coordinator, and a recording stopped by this cycle's commands
/// is not looked at again until the next one.
///
/// # Errors
///
/// Returns the command fetch error after the tick has run.
pub async fn run_cycle(manager: &mut SessionManager, client: &CoordinatorClient) -> Result<()> {
    let report = manager.tick().await;
    debug!(
        probed = report.probed,
        completed = report.completed.len(),
        finalized = report.finalized.len(),
        uploaded = report.uploaded.len(),
        upload_failed = report.upload_failed.len(),
        purged = report.purged.len(),
        "tick finished"
    );

    let commands = client.check_commands().await?;
    if !commands.is_empty() {
        info!(count = commands.len(), "received commands");
    }
    manager.handle_commands(commands).await;
    Ok(())
}

/// Loop until `cancel` fires.
pub async fn run(
    manager: &mut SessionManager,
    client: &CoordinatorClient,
    cadence: Cadence,
    cancel: CancellationToken,
) {
    info!(
        interval_secs = cadence.check_interval.as_secs(),
        "agent loop started"
    );

    loop {
        let wait = match run_cycle(manager, client).await {
            Ok(()) => cadence.check_interval,
            Err(err) => {
                error!(%err, backoff_secs = cadence.error_backoff.as_secs(), "cycle failed");
                cadence.error_backoff
            }
        };

        tokio::select! {
            () = cancel.cancelled() => {
                info!("agent loop shutting down");
                break;
            }
            () = tokio::time::sleep(wait) => {}
        }
    }
}
