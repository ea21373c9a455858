//! Expiration Sweep Task
//!
//! Background task that periodically purges expired and invalid elements.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::ElementTable;

/// Spawns a task that calls [`ElementTable::purge_expired`] every
/// `interval_secs` seconds.
///
/// Removed elements fire `Expire` events like any other lazy expiration.
/// Abort the returned handle during shutdown.
pub fn spawn_sweep_task(table: Arc<Mutex<ElementTable>>, interval_secs: u64) -> JoinHandle<()> {
    let interval = Duration::from_secs(interval_secs.max(1));

    tokio::spawn(async move {
        info!(
            "Starting expiration sweep task with interval of {} seconds",
            interval.as_secs()
        );

        loop {
            tokio::time::sleep(interval).await;

            let purged = {
                let mut table = table.lock().await;
                table.purge_expired()
            };

            match purged {
                Ok(0) => debug!("expiration sweep: nothing stale"),
                Ok(removed) => info!("expiration sweep: removed {} stale elements", removed),
                Err(e) => warn!(error = %e, "expiration sweep failed"),
            }
        }
    })
}
