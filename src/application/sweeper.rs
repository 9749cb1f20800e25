use crate::domain::ports::QueueLeasingRef;
use crate::error::Result;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Periodically frees leases abandoned by a crashed or faulted engine.
pub struct LeaseSweeper {
    store: QueueLeasingRef,
    interval: Duration,
    lease_ttl: Duration,
    cancel: CancellationToken,
}

impl LeaseSweeper {
    pub fn new(
        store: QueueLeasingRef,
        interval: Duration,
        lease_ttl: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            interval,
            lease_ttl,
            cancel,
        }
    }

    pub async fn run(self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let reclaimed = self.store.reclaim_stale_leases(self.lease_ttl).await?;
                    if reclaimed > 0 {
                        warn!(reclaimed, ttl_secs = self.lease_ttl.as_secs(), "reclaimed orphaned leases");
                    }
                }
            }
        }
        info!("lease sweeper stopped");
        Ok(())
    }
}
