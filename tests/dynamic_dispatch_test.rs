mod common;

use accrual_engine::domain::accrual::{AccrualStatus, Points, TerminalStatus};
use accrual_engine::domain::ports::{
    Claim, LoyaltyLedger, LoyaltyLedgerRef, QueueLeasing, QueueLeasingRef, Submission,
};
use accrual_engine::infrastructure::in_memory::InMemoryStore;
use common::order;
use rust_decimal_macros::dec;
use std::sync::Arc;

#[tokio::test]
async fn test_stores_as_trait_objects() {
    let store = Arc::new(InMemoryStore::new());
    let leasing: QueueLeasingRef = store.clone();
    let ledger: LoyaltyLedgerRef = store;
    let a = order(7992739871);

    // Verify Send + Sync by spawning tasks
    let submitted = {
        let ledger = ledger.clone();
        let a = a.clone();
        tokio::spawn(async move { ledger.submit_order(1, &a).await.unwrap() })
    };
    assert_eq!(submitted.await.unwrap(), Submission::Accepted);

    let leased = tokio::spawn(async move {
        let Claim::Claimed(lease) = leasing.claim_oldest_unleased().await.unwrap() else {
            panic!("queue should not be empty");
        };
        leasing
            .finalize_order(&lease, TerminalStatus::Processed, Points::new(dec!(7.5)).unwrap())
            .await
            .unwrap();
        lease.order
    });
    assert_eq!(leased.await.unwrap(), a);

    let record = ledger.accrual(&a).await.unwrap().unwrap();
    assert_eq!(record.status, AccrualStatus::Processed);
    assert_eq!(ledger.balance(1).await.unwrap().available.0, dec!(7.5));
}
