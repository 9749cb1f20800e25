mod common;

use accrual_engine::domain::account::Balance;
use accrual_engine::domain::accrual::{Points, TerminalStatus};
use accrual_engine::domain::order::Lease;
use accrual_engine::domain::ports::{Claim, LoyaltyLedger, QueueLeasing};
use accrual_engine::domain::resolution::DeferReason;
use accrual_engine::infrastructure::in_memory::InMemoryStore;
use common::order;
use rand::Rng;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::time::Duration;
use tokio::task::JoinSet;

async fn claim(store: &InMemoryStore) -> Lease {
    store
        .claim_oldest_unleased()
        .await
        .unwrap()
        .into_lease()
        .expect("queue should not be empty")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_single_entry_is_claimed_exactly_once() {
    let store = InMemoryStore::new();
    store.submit_order(1, &order(7992739871)).await.unwrap();

    let mut claimers = JoinSet::new();
    for _ in 0..32 {
        let store = store.clone();
        claimers.spawn(async move { store.claim_oldest_unleased().await.unwrap() });
    }

    let mut claimed = 0;
    while let Some(claim) = claimers.join_next().await {
        if let Claim::Claimed(_) = claim.unwrap() {
            claimed += 1;
        }
    }
    assert_eq!(claimed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_claims_never_hand_out_an_order_twice() {
    let store = InMemoryStore::new();
    let mut rng = rand::thread_rng();
    let total = rng.gen_range(50..200);
    for payload in 0..total {
        store.submit_order(1, &order(100_000 + payload)).await.unwrap();
    }

    let mut claimers = JoinSet::new();
    for _ in 0..8 {
        let store = store.clone();
        claimers.spawn(async move {
            let mut mine = Vec::new();
            while let Claim::Claimed(lease) = store.claim_oldest_unleased().await.unwrap() {
                mine.push(lease.order);
                tokio::task::yield_now().await;
            }
            mine
        });
    }

    let mut seen = HashSet::new();
    while let Some(mine) = claimers.join_next().await {
        for order in mine.unwrap() {
            assert!(seen.insert(order.clone()), "{order} was claimed twice");
        }
    }
    assert_eq!(seen.len() as u64, total);
}

#[tokio::test]
async fn test_deferred_order_goes_behind_staler_entries() {
    let store = InMemoryStore::new();
    let a = order(7992739871);
    let b = order(1234567890);
    store.submit_order(1, &a).await.unwrap();
    store.submit_order(1, &b).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;

    let first = claim(&store).await;
    assert_eq!(first.order, a);
    store
        .release_lease(&first, &DeferReason::Pending("REGISTERED".into()))
        .await
        .unwrap();

    // Claiming A refreshed its last check, so B is now the stalest entry.
    assert_eq!(claim(&store).await.order, b);
    assert_eq!(claim(&store).await.order, a);
    assert_eq!(store.claim_oldest_unleased().await.unwrap(), Claim::Empty);
}

#[tokio::test]
async fn test_every_defer_reason_hands_the_order_back() {
    let store = InMemoryStore::new();
    let a = order(7992739871);
    store.submit_order(1, &a).await.unwrap();

    for reason in [
        DeferReason::Pending("REGISTERED".into()),
        DeferReason::RateLimited,
        DeferReason::ServerError,
        DeferReason::UnexpectedStatus(404),
        DeferReason::TimedOut,
        DeferReason::Transport("too many redirects".into()),
        DeferReason::Shutdown,
    ] {
        let lease = claim(&store).await;
        assert_eq!(lease.order, a);
        assert_eq!(store.claim_oldest_unleased().await.unwrap(), Claim::Empty);
        store.release_lease(&lease, &reason).await.unwrap();
    }
    assert_eq!(store.pending_orders().await.unwrap(), 1);
}

#[tokio::test]
async fn test_balance_is_the_sum_of_processed_accruals() {
    let store = InMemoryStore::new();
    let mut rng = rand::thread_rng();
    let mut expected = Decimal::ZERO;

    for payload in 0..40 {
        let order = order(200_000 + payload);
        store.submit_order(3, &order).await.unwrap();
        let lease = claim(&store).await;
        assert_eq!(lease.order, order);

        let accrual = Decimal::new(rng.gen_range(0..100_000), 2);
        let status = if rng.gen_bool(0.7) {
            expected += accrual;
            TerminalStatus::Processed
        } else {
            TerminalStatus::Invalid
        };
        let before = store.balance(3).await.unwrap().available;
        store
            .finalize_order(&lease, status, Points::new(accrual).unwrap())
            .await
            .unwrap();
        assert!(store.balance(3).await.unwrap().available.0 >= before.0);
    }

    assert_eq!(store.balance(3).await.unwrap().available, Balance::new(expected));
    assert_eq!(store.pending_orders().await.unwrap(), 0);
}
