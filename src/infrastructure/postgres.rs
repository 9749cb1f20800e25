use crate::domain::account::{Balance, UserBalance};
use crate::domain::accrual::{AccrualRecord, AccrualStatus, Points, TerminalStatus};
use crate::domain::order::{Lease, OrderNumber};
use crate::domain::ports::{Claim, LoyaltyLedger, QueueLeasing, Submission};
use crate::domain::resolution::DeferReason;
use crate::error::{AccrualError, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::debug;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS orders (
    order_num   VARCHAR(32) PRIMARY KEY,
    user_id     BIGINT NOT NULL,
    uploaded_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS accruals (
    order_num   VARCHAR(32) PRIMARY KEY REFERENCES orders (order_num) ON DELETE CASCADE,
    status      VARCHAR(16) NOT NULL,
    accrual     NUMERIC(12, 2) NOT NULL DEFAULT 0,
    uploaded_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS balance (
    user_id   BIGINT PRIMARY KEY,
    available NUMERIC(12, 2) NOT NULL DEFAULT 0 CHECK (available >= 0),
    withdrawn NUMERIC(12, 2) NOT NULL DEFAULT 0 CHECK (withdrawn >= 0)
);

CREATE TABLE IF NOT EXISTS queue (
    id              BIGSERIAL PRIMARY KEY,
    order_num       VARCHAR(32) UNIQUE NOT NULL,
    user_id         BIGINT NOT NULL,
    uploaded_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_checked_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    in_handling     BOOLEAN NOT NULL DEFAULT false,
    lease_token     BIGINT NOT NULL DEFAULT 0
);

ALTER TABLE queue ADD COLUMN IF NOT EXISTS lease_token BIGINT NOT NULL DEFAULT 0;

CREATE INDEX IF NOT EXISTS queue_claimable_idx ON queue (last_checked_at, id) WHERE NOT in_handling;
";

/// A PostgreSQL-backed store.
///
/// The database is the only serialization point: claims are one conditional
/// `UPDATE ... RETURNING` guarded by `FOR UPDATE SKIP LOCKED`, so any number
/// of engines may share the queue, and every multi-row change is a transaction.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connects and creates the schema if it does not exist yet.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl QueueLeasing for PostgresStore {
    async fn claim_oldest_unleased(&self) -> Result<Claim> {
        let claimed: Option<(String, i64)> = sqlx::query_as(
            r"
            UPDATE queue
            SET in_handling = true, last_checked_at = now(), lease_token = lease_token + 1
            WHERE id = (
                SELECT id FROM queue
                WHERE NOT in_handling
                ORDER BY last_checked_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING order_num, lease_token
            ",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(match claimed {
            Some((order, token)) => Claim::Claimed(Lease {
                order: OrderNumber::trusted(order),
                token: token as u64,
            }),
            None => Claim::Empty,
        })
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<bool> {
        let renewed = sqlx::query(
            r"
            UPDATE queue SET last_checked_at = now()
            WHERE order_num = $1 AND in_handling AND lease_token = $2
            ",
        )
        .bind(lease.order.as_str())
        .bind(lease.token as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(renewed == 1)
    }

    async fn release_lease(&self, lease: &Lease, reason: &DeferReason) -> Result<()> {
        let released = sqlx::query(
            r"
            UPDATE queue SET in_handling = false
            WHERE order_num = $1 AND in_handling AND lease_token = $2
            ",
        )
        .bind(lease.order.as_str())
        .bind(lease.token as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if released == 0 {
            return Err(AccrualError::LeaseLost(lease.to_string()));
        }
        debug!(%lease, %reason, "lease released");
        Ok(())
    }

    async fn finalize_order(
        &self,
        lease: &Lease,
        status: TerminalStatus,
        accrual: Points,
    ) -> Result<()> {
        let order = &lease.order;
        // Dropping `tx` on any early return rolls everything back.
        let mut tx = self.pool.begin().await?;

        let user_id: i64 = sqlx::query_scalar(
            r"
            DELETE FROM queue
            WHERE order_num = $1 AND in_handling AND lease_token = $2
            RETURNING user_id
            ",
        )
        .bind(order.as_str())
        .bind(lease.token as i64)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AccrualError::LeaseLost(lease.to_string()))?;

        sqlx::query("UPDATE accruals SET status = $2, accrual = $3 WHERE order_num = $1")
            .bind(order.as_str())
            .bind(status.to_string())
            .bind(accrual.value())
            .execute(&mut *tx)
            .await?;

        if status == TerminalStatus::Processed {
            sqlx::query(
                r"
                INSERT INTO balance (user_id, available) VALUES ($1, $2)
                ON CONFLICT (user_id) DO UPDATE SET available = balance.available + EXCLUDED.available
                ",
            )
            .bind(user_id)
            .bind(accrual.value())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn reclaim_stale_leases(&self, older_than: Duration) -> Result<u64> {
        let reclaimed = sqlx::query(
            r"
            UPDATE queue SET in_handling = false
            WHERE in_handling AND last_checked_at <= now() - make_interval(secs => $1)
            ",
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(reclaimed)
    }
}

#[async_trait]
impl LoyaltyLedger for PostgresStore {
    async fn submit_order(&self, user_id: i64, order: &OrderNumber) -> Result<Submission> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO orders (order_num, user_id) VALUES ($1, $2) ON CONFLICT (order_num) DO NOTHING",
        )
        .bind(order.as_str())
        .bind(user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            let owner: i64 = sqlx::query_scalar("SELECT user_id FROM orders WHERE order_num = $1")
                .bind(order.as_str())
                .fetch_one(&mut *tx)
                .await?;
            return Ok(if owner == user_id {
                Submission::AlreadyOwned
            } else {
                Submission::OwnedByAnotherUser
            });
        }

        sqlx::query("INSERT INTO accruals (order_num, status) VALUES ($1, $2)")
            .bind(order.as_str())
            .bind(AccrualStatus::New.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO queue (order_num, user_id) VALUES ($1, $2)")
            .bind(order.as_str())
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO balance (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Submission::Accepted)
    }

    async fn accrual(&self, order: &OrderNumber) -> Result<Option<AccrualRecord>> {
        let row: Option<(String, Decimal)> =
            sqlx::query_as("SELECT status, accrual FROM accruals WHERE order_num = $1")
                .bind(order.as_str())
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(status, accrual)| -> Result<AccrualRecord> {
            Ok(AccrualRecord {
                order: order.clone(),
                status: status.parse()?,
                accrual: Points::new(accrual)?,
            })
        })
        .transpose()
    }

    async fn balance(&self, user_id: i64) -> Result<UserBalance> {
        let row: Option<(Decimal, Decimal)> =
            sqlx::query_as("SELECT available, withdrawn FROM balance WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(match row {
            Some((available, withdrawn)) => UserBalance {
                user_id,
                available: Balance::new(available),
                withdrawn: Balance::new(withdrawn),
            },
            None => UserBalance::new(user_id),
        })
    }

    async fn balances(&self) -> Result<Vec<UserBalance>> {
        let rows: Vec<(i64, Decimal, Decimal)> =
            sqlx::query_as("SELECT user_id, available, withdrawn FROM balance ORDER BY user_id")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, available, withdrawn)| UserBalance {
                user_id,
                available: Balance::new(available),
                withdrawn: Balance::new(withdrawn),
            })
            .collect())
    }

    async fn pending_orders(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn fresh_store() -> PostgresStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let store = PostgresStore::connect(&url, 8).await.unwrap();
        sqlx::raw_sql("TRUNCATE queue, accruals, balance, orders")
            .execute(store.pool())
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_postgres_lease_protocol() {
        let store = fresh_store().await;
        let a = OrderNumber::parse("79927398713").unwrap();
        let b = OrderNumber::parse("12345678903").unwrap();

        assert_eq!(store.submit_order(1, &a).await.unwrap(), Submission::Accepted);
        assert_eq!(store.submit_order(1, &b).await.unwrap(), Submission::Accepted);
        assert_eq!(store.submit_order(1, &a).await.unwrap(), Submission::AlreadyOwned);
        assert_eq!(
            store.submit_order(2, &a).await.unwrap(),
            Submission::OwnedByAnotherUser
        );

        let lease_a = store.claim_oldest_unleased().await.unwrap().into_lease().unwrap();
        let lease_b = store.claim_oldest_unleased().await.unwrap().into_lease().unwrap();
        assert_eq!(lease_a.order, a);
        assert_eq!(lease_b.order, b);
        assert_eq!(store.claim_oldest_unleased().await.unwrap(), Claim::Empty);

        store
            .release_lease(&lease_b, &DeferReason::Pending("PROCESSING".into()))
            .await
            .unwrap();
        store
            .finalize_order(&lease_a, TerminalStatus::Processed, Points::new(dec!(50.0)).unwrap())
            .await
            .unwrap();

        let record = store.accrual(&a).await.unwrap().unwrap();
        assert_eq!(record.status, AccrualStatus::Processed);
        assert_eq!(record.accrual.value(), dec!(50.0));
        assert_eq!(store.balance(1).await.unwrap().available, Balance::new(dec!(50.0)));
        assert_eq!(store.accrual(&b).await.unwrap().unwrap().status, AccrualStatus::New);

        assert!(matches!(
            store
                .finalize_order(&lease_a, TerminalStatus::Processed, Points::new(dec!(50.0)).unwrap())
                .await,
            Err(AccrualError::LeaseLost(_))
        ));
        assert_eq!(store.balance(1).await.unwrap().available, Balance::new(dec!(50.0)));

        let stale = store.claim_oldest_unleased().await.unwrap().into_lease().unwrap();
        assert_eq!(stale.order, b);
        assert!(stale.token > lease_b.token);
        assert_eq!(store.reclaim_stale_leases(Duration::ZERO).await.unwrap(), 1);
        assert!(!store.renew_lease(&stale).await.unwrap());
        let current = store.claim_oldest_unleased().await.unwrap().into_lease().unwrap();
        assert!(matches!(
            store.release_lease(&stale, &DeferReason::ServerError).await,
            Err(AccrualError::LeaseLost(_))
        ));
        assert!(store.renew_lease(&current).await.unwrap());
        assert_eq!(store.pending_orders().await.unwrap(), 1);
    }
}
