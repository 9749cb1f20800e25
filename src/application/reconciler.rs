use crate::domain::order::Lease;
use crate::domain::ports::QueueLeasingRef;
use crate::domain::resolution::Resolution;
use crate::error::Result;
use tracing::{debug, info};

/// Writes the outcome of one poll back to the queue store.
///
/// Every store call is a single transaction. A failure is returned as-is and
/// is fatal for the engine: retrying a half-known finalize could credit twice.
pub struct Reconciler {
    store: QueueLeasingRef,
}

impl Reconciler {
    pub fn new(store: QueueLeasingRef) -> Self {
        Self { store }
    }

    /// Restarts the lease age once a worker has taken the order. False means
    /// the lease expired while the order waited for a worker.
    pub async fn accept(&self, lease: &Lease) -> Result<bool> {
        self.store.renew_lease(lease).await
    }

    pub async fn apply(&self, lease: &Lease, resolution: &Resolution) -> Result<()> {
        let order = &lease.order;
        match resolution {
            Resolution::Finalize { status, accrual } => {
                self.store.finalize_order(lease, *status, *accrual).await?;
                info!(%order, %status, accrual = %accrual.value(), "order finalized");
            }
            Resolution::Defer(reason) => {
                self.store.release_lease(lease, reason).await?;
                debug!(%order, %reason, "order deferred");
            }
        }
        Ok(())
    }
}
