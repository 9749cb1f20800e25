use crate::domain::account::UserBalance;
use crate::domain::accrual::{AccrualRecord, Points, TerminalStatus};
use crate::domain::order::{Lease, OrderNumber, QueueEntry};
use crate::domain::ports::{Claim, LoyaltyLedger, QueueLeasing, Submission};
use crate::domain::resolution::DeferReason;
use crate::error::{AccrualError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Default)]
struct State {
    next_seq: u64,
    orders: HashMap<OrderNumber, i64>,
    queue: HashMap<OrderNumber, QueueEntry>,
    accruals: HashMap<OrderNumber, AccrualRecord>,
    balances: HashMap<i64, UserBalance>,
}

/// A thread-safe in-memory loyalty store.
///
/// A single `Mutex` guards every table, so each trait method runs as one
/// critical section: claims cannot interleave and a finalize is all-or-nothing.
/// Ideal for tests and for runs where persistence is not required.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the queue entry for `order`, if it is still queued.
    pub async fn queue_entry(&self, order: &OrderNumber) -> Option<QueueEntry> {
        self.state.lock().await.queue.get(order).cloned()
    }
}

impl State {
    fn held_entry(&mut self, lease: &Lease) -> Result<&mut QueueEntry> {
        self.queue
            .get_mut(&lease.order)
            .filter(|entry| entry.is_held_by(lease))
            .ok_or_else(|| AccrualError::LeaseLost(lease.to_string()))
    }
}

#[async_trait]
impl QueueLeasing for InMemoryStore {
    async fn claim_oldest_unleased(&self) -> Result<Claim> {
        let mut state = self.state.lock().await;
        let Some(entry) = state
            .queue
            .values_mut()
            .filter(|entry| !entry.in_handling)
            .min_by_key(|entry| entry.priority())
        else {
            return Ok(Claim::Empty);
        };
        Ok(Claim::Claimed(entry.lease(Utc::now())))
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(match state.held_entry(lease) {
            Ok(entry) => {
                entry.last_checked_at = Utc::now();
                true
            }
            Err(_) => false,
        })
    }

    async fn release_lease(&self, lease: &Lease, reason: &DeferReason) -> Result<()> {
        let mut state = self.state.lock().await;
        state.held_entry(lease)?.in_handling = false;
        debug!(%lease, %reason, "lease released");
        Ok(())
    }

    async fn finalize_order(
        &self,
        lease: &Lease,
        status: TerminalStatus,
        accrual: Points,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let user_id = state.held_entry(lease)?.user_id;
        let order = &lease.order;
        state.queue.remove(order);

        state
            .accruals
            .entry(order.clone())
            .or_insert_with(|| AccrualRecord::new(order.clone()))
            .finalize(status, accrual);

        if status == TerminalStatus::Processed {
            state
                .balances
                .entry(user_id)
                .or_insert_with(|| UserBalance::new(user_id))
                .credit(accrual);
        }
        Ok(())
    }

    async fn reclaim_stale_leases(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| AccrualError::Config(format!("lease ttl out of range: {e}")))?;
        let mut state = self.state.lock().await;
        let mut reclaimed = 0;
        for entry in state.queue.values_mut() {
            if entry.in_handling && entry.last_checked_at <= cutoff {
                entry.in_handling = false;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }
}

#[async_trait]
impl LoyaltyLedger for InMemoryStore {
    async fn submit_order(&self, user_id: i64, order: &OrderNumber) -> Result<Submission> {
        let mut state = self.state.lock().await;
        if let Some(&owner) = state.orders.get(order) {
            return Ok(if owner == user_id {
                Submission::AlreadyOwned
            } else {
                Submission::OwnedByAnotherUser
            });
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.orders.insert(order.clone(), user_id);
        state
            .accruals
            .insert(order.clone(), AccrualRecord::new(order.clone()));
        state
            .queue
            .insert(order.clone(), QueueEntry::new(order.clone(), user_id, seq, Utc::now()));
        state
            .balances
            .entry(user_id)
            .or_insert_with(|| UserBalance::new(user_id));
        Ok(Submission::Accepted)
    }

    async fn accrual(&self, order: &OrderNumber) -> Result<Option<AccrualRecord>> {
        Ok(self.state.lock().await.accruals.get(order).cloned())
    }

    async fn balance(&self, user_id: i64) -> Result<UserBalance> {
        let state = self.state.lock().await;
        Ok(state
            .balances
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| UserBalance::new(user_id)))
    }

    async fn balances(&self) -> Result<Vec<UserBalance>> {
        let state = self.state.lock().await;
        let mut all: Vec<_> = state.balances.values().cloned().collect();
        all.sort_by_key(|b| b.user_id);
        Ok(all)
    }

    async fn pending_orders(&self) -> Result<u64> {
        Ok(self.state.lock().await.queue.len() as u64)
    }
}
