use super::account::UserBalance;
use super::accrual::{AccrualRecord, Points, TerminalStatus};
use super::order::{Lease, OrderNumber};
use super::resolution::DeferReason;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Result of trying to lease the stalest queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    Empty,
    Claimed(Lease),
}

impl Claim {
    pub fn into_lease(self) -> Option<Lease> {
        match self {
            Claim::Claimed(lease) => Some(lease),
            Claim::Empty => None,
        }
    }
}

/// Result of submitting an order through the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Accepted,
    AlreadyOwned,
    OwnedByAnotherUser,
}

/// Queue leasing capability consumed by the polling engine.
///
/// Implementations must make every method atomic with respect to the others:
/// a claim is a single read-modify-write, and a finalize either applies all of
/// its steps or none. Every write on a leased entry takes the [`Lease`] the
/// claim returned and fails with `LeaseLost` once that lease is no longer the
/// current one.
#[async_trait]
pub trait QueueLeasing: Send + Sync {
    /// Leases the unleased entry with the oldest `last_checked_at`, refreshing
    /// that timestamp and issuing a new lease token.
    async fn claim_oldest_unleased(&self) -> Result<Claim>;

    /// Restarts the age of a held lease. Returns false, changing nothing, when
    /// the lease has expired or been claimed again since.
    async fn renew_lease(&self, lease: &Lease) -> Result<bool>;

    /// Clears the lease so the order becomes claimable again. The accrual
    /// record is left untouched.
    async fn release_lease(&self, lease: &Lease, reason: &DeferReason) -> Result<()>;

    /// Deletes the queue entry, records the terminal status and amount, and
    /// credits the owner when the status is `PROCESSED`.
    async fn finalize_order(
        &self,
        lease: &Lease,
        status: TerminalStatus,
        accrual: Points,
    ) -> Result<()>;

    /// Clears leases held longer than `older_than`. Returns how many were cleared.
    async fn reclaim_stale_leases(&self, older_than: Duration) -> Result<u64>;
}

/// User-facing order and balance capability consumed by API layers.
#[async_trait]
pub trait LoyaltyLedger: Send + Sync {
    /// Registers an order with a `NEW` accrual record and queues it for polling.
    async fn submit_order(&self, user_id: i64, order: &OrderNumber) -> Result<Submission>;
    async fn accrual(&self, order: &OrderNumber) -> Result<Option<AccrualRecord>>;
    async fn balance(&self, user_id: i64) -> Result<UserBalance>;
    async fn balances(&self) -> Result<Vec<UserBalance>>;
    async fn pending_orders(&self) -> Result<u64>;
}

pub type QueueLeasingRef = Arc<dyn QueueLeasing>;
pub type LoyaltyLedgerRef = Arc<dyn LoyaltyLedger>;
