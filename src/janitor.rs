//! Periodic housekeeping: evicts expired AI cache entries and sweeps
//! leaked browser contexts.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::AppContext;

const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

pub async fn janitor_loop(ctx: Arc<AppContext>, cancel: CancellationToken) {
    info!("janitor started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("janitor shutting down");
                return;
            }
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
        }

        let evicted = ctx.ai.cache().evict_expired();
        if evicted > 0 {
            debug!(evicted, "evicted expired AI cache entries");
        }
        ctx.render.sweep().await;
    }
}
