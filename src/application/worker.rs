use super::reconciler::Reconciler;
use crate::domain::order::Lease;
use crate::domain::resolution::Resolution;
use crate::error::Result;
use crate::interfaces::http::accrual_client::AccrualClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receiving end of the dispatch channel, shared by every worker.
pub type DispatchReceiver = Arc<Mutex<mpsc::Receiver<Lease>>>;

/// One member of the worker pool.
///
/// Takes one order at a time, renews its lease, polls the accrual service
/// once, and reconciles the answer. Cancellation is honoured while waiting for work and during the
/// rate-limit cooldown, never in the middle of a resolution.
pub struct Worker {
    id: usize,
    client: AccrualClient,
    reconciler: Arc<Reconciler>,
    dispatch: DispatchReceiver,
    rate_limit_cooldown: Duration,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(
        id: usize,
        client: AccrualClient,
        reconciler: Arc<Reconciler>,
        dispatch: DispatchReceiver,
        rate_limit_cooldown: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            client,
            reconciler,
            dispatch,
            rate_limit_cooldown,
            cancel,
        }
    }

    pub async fn run(self) -> Result<()> {
        debug!(worker = self.id, "worker started");
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                lease = next_lease(&self.dispatch) => lease,
            };
            // The scheduler is gone and the slot is drained.
            let Some(lease) = next else { break };

            if !self.reconciler.accept(&lease).await? {
                warn!(worker = self.id, %lease, "lease expired while waiting for a worker");
                continue;
            }
            let resolution = self.resolve_one(lease).await?;
            if resolution.requires_cooldown() {
                warn!(
                    worker = self.id,
                    cooldown_secs = self.rate_limit_cooldown.as_secs(),
                    "accrual service is rate limiting, cooling down"
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.rate_limit_cooldown) => {}
                }
            }
        }
        info!(worker = self.id, "worker stopped");
        Ok(())
    }

    /// One round of accrual resolution for a leased order.
    pub async fn resolve_one(&self, lease: Lease) -> Result<Resolution> {
        let resolution = self.client.query(&lease.order).await?;
        self.reconciler.apply(&lease, &resolution).await?;
        Ok(resolution)
    }
}

async fn next_lease(dispatch: &DispatchReceiver) -> Option<Lease> {
    dispatch.lock().await.recv().await
}
