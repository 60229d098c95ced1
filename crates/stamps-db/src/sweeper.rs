//! Keep-alive sweeper for idle pooled connections.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pool::ConnectionPool;

/// Background task that periodically probes idle connections, prunes dead
/// ones and tops the pool back up to its minimum.
///
/// The pool lock is taken once per connection, never across a probe.
pub struct KeepAliveSweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl KeepAliveSweeper {
    /// Starts sweeping `pool` every `period`. The first sweep runs one
    /// period after start.
    pub fn spawn(pool: Arc<ConnectionPool>, period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period_secs = period.as_secs(), "Keep-alive sweeper started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let pruned = pool.sweep_idle().await;
                if pruned > 0 {
                    let replaced = pool.fill_to_min().await;
                    info!(pruned, replaced, "Keep-alive sweep pruned dead connections");
                } else {
                    debug!("Keep-alive sweep found no dead connections");
                }
            }

            debug!("Keep-alive sweeper stopped");
        });

        Self { cancel, handle }
    }

    /// Stops the sweeper and waits for an in-flight sweep to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}
