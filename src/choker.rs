//! The two timers driving the choking policy.
//!
//! Selection itself lives on the controller; these tasks only supply the
//! cadence and stop when the swarm shuts down.

use std::sync::Arc;

use tokio::time;

use crate::swarm::Swarm;

/// Recomputes the preferred-neighbor set every unchoking interval.
pub(crate) async fn preferred_timer(swarm: Arc<Swarm>) {
    let shutdown = swarm.shutdown_token();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = time::sleep(swarm.unchoking_interval()) => swarm.recompute_preferred(),
        }
    }
}

/// Rotates the optimistically unchoked neighbor every optimistic interval.
pub(crate) async fn optimistic_timer(swarm: Arc<Swarm>) {
    let shutdown = swarm.shutdown_token();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = time::sleep(swarm.optimistic_interval()) => swarm.rotate_optimistic(),
        }
    }
}
