use crate::domain::order::Lease;
use crate::domain::ports::{Claim, QueueLeasingRef};
use crate::domain::resolution::DeferReason;
use crate::error::{AccrualError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Single producer feeding claimed orders to the worker pool.
///
/// The dispatch channel holds one lease, so the scheduler is never more than
/// one claim ahead of the workers; `send` blocking on a full slot is the
/// backpressure point.
pub struct LeaseScheduler {
    store: QueueLeasingRef,
    dispatch: mpsc::Sender<Lease>,
    empty_queue_backoff: Duration,
    wake: Arc<Notify>,
    cancel: CancellationToken,
}

impl LeaseScheduler {
    pub fn new(
        store: QueueLeasingRef,
        dispatch: mpsc::Sender<Lease>,
        empty_queue_backoff: Duration,
        wake: Arc<Notify>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            dispatch,
            empty_queue_backoff,
            wake,
            cancel,
        }
    }

    /// Claims and dispatches until cancelled. Any store error ends the loop.
    pub async fn run(self) -> Result<()> {
        info!("lease scheduler started");
        while !self.cancel.is_cancelled() {
            match self.store.claim_oldest_unleased().await? {
                Claim::Claimed(lease) => {
                    debug!(%lease, "order claimed");
                    if !self.hand_off(lease).await? {
                        break;
                    }
                }
                Claim::Empty => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(self.empty_queue_backoff) => {}
                    }
                }
            }
        }
        info!("lease scheduler stopped");
        Ok(())
    }

    /// Pushes `lease` to the workers. Returns false, after giving the lease
    /// back, when the engine stops before anyone takes it.
    async fn hand_off(&self, lease: Lease) -> Result<bool> {
        let delivered = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.dispatch.send(lease.clone()) => sent.is_ok(),
        };
        if !delivered {
            match self.store.release_lease(&lease, &DeferReason::Shutdown).await {
                // The sweeper already took it back while the slot was full.
                Err(AccrualError::LeaseLost(_)) => debug!(%lease, "lease expired before shutdown"),
                other => other?,
            }
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::OrderNumber;
    use crate::domain::ports::LoyaltyLedger;
    use crate::infrastructure::in_memory::InMemoryStore;

    const ORDERS: [&str; 3] = ["79927398713", "12345678903", "2377225624"];

    async fn seeded() -> (InMemoryStore, Vec<OrderNumber>) {
        let store = InMemoryStore::new();
        let mut orders = Vec::new();
        for raw in ORDERS {
            let order = OrderNumber::parse(raw).unwrap();
            store.submit_order(1, &order).await.unwrap();
            orders.push(order);
        }
        (store, orders)
    }

    async fn leased_count(store: &InMemoryStore, orders: &[OrderNumber]) -> usize {
        let mut count = 0;
        for order in orders {
            if store.queue_entry(order).await.unwrap().in_handling {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn test_single_slot_backpressure_and_release_on_cancel() {
        let (store, orders) = seeded().await;
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let scheduler = LeaseScheduler::new(
            Arc::new(store.clone()),
            tx,
            Duration::from_millis(10),
            Arc::new(Notify::new()),
            cancel.clone(),
        );
        let handle = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        // One order buffered, one claimed and blocked on the full slot.
        assert_eq!(leased_count(&store, &orders).await, 2);

        cancel.cancel();
        handle.await.unwrap().unwrap();

        // The blocked one was given back; the buffered one is still leased.
        assert_eq!(leased_count(&store, &orders).await, 1);
        assert_eq!(rx.recv().await.map(|lease| lease.order), Some(orders[0].clone()));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_dispatches_in_staleness_order() {
        let (store, orders) = seeded().await;
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            LeaseScheduler::new(
                Arc::new(store),
                tx,
                Duration::from_millis(10),
                Arc::new(Notify::new()),
                cancel.clone(),
            )
            .run(),
        );

        for expected in &orders {
            assert_eq!(rx.recv().await.map(|lease| lease.order).as_ref(), Some(expected));
        }
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wake_cuts_backoff_short() {
        let store = InMemoryStore::new();
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let wake = Arc::new(Notify::new());
        let handle = tokio::spawn(
            LeaseScheduler::new(
                Arc::new(store.clone()),
                tx,
                Duration::from_secs(3600),
                wake.clone(),
                cancel.clone(),
            )
            .run(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        let order = OrderNumber::parse(ORDERS[0]).unwrap();
        store.submit_order(1, &order).await.unwrap();
        wake.notify_one();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("scheduler should wake up");
        assert_eq!(received.map(|lease| lease.order), Some(order));
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
