use crate::domain::account::UserBalance;
use crate::domain::accrual::{AccrualRecord, Points, TerminalStatus};
use crate::domain::order::{Lease, OrderNumber, QueueEntry};
use crate::domain::ports::{Claim, LoyaltyLedger, QueueLeasing, Submission};
use crate::domain::resolution::DeferReason;
use crate::error::{AccrualError, Result};
use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Column Family mapping order number to owning user.
pub const CF_ORDERS: &str = "orders";
/// Column Family holding one `QueueEntry` per unresolved order.
pub const CF_QUEUE: &str = "queue";
/// Column Family holding one `AccrualRecord` per order.
pub const CF_ACCRUALS: &str = "accruals";
/// Column Family holding one `UserBalance` per user.
pub const CF_BALANCES: &str = "balances";

/// A persistent store implementation using RocksDB.
///
/// RocksDB has no conditional updates, so every read-modify-write runs under
/// `write_lock` and multi-row changes commit through a single `WriteBatch`. This makes the
/// store safe for many tasks in one process, not for several processes
/// sharing a database directory.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDbStore {
    db: Arc<DB>,
    /// Serializes every read-modify-write. The guarded value is the sequence
    /// number the next submitted order receives.
    write_lock: Arc<Mutex<u64>>,
}

impl RocksDbStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures the required column families exist and resumes the queue
    /// sequence after the highest entry already stored.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = [CF_ORDERS, CF_QUEUE, CF_ACCRUALS, CF_BALANCES]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, cfs)?;

        let resume_at = read_queue(&db)?
            .iter()
            .map(|entry| entry.seq + 1)
            .max()
            .unwrap_or(0);
        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(resume_at)),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        cf_handle(&self.db, name)
    }

    fn get_json<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let Some(bytes) = self.db.get_cf(self.cf(cf)?, key)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(AccrualError::storage)
    }

    fn queue_entries(&self) -> Result<Vec<QueueEntry>> {
        read_queue(&self.db)
    }

    /// The queue entry `lease` was issued for, if that lease is still current.
    /// Callers must hold `write_lock`.
    fn held_entry(&self, lease: &Lease) -> Result<QueueEntry> {
        self.get_json::<QueueEntry>(CF_QUEUE, lease.order.as_str().as_bytes())?
            .filter(|entry| entry.is_held_by(lease))
            .ok_or_else(|| AccrualError::LeaseLost(lease.to_string()))
    }

    fn put_json<T: Serialize>(
        &self,
        batch: &mut WriteBatch,
        cf: &str,
        key: &[u8],
        value: &T,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(AccrualError::storage)?;
        batch.put_cf(self.cf(cf)?, key, bytes);
        Ok(())
    }

    fn balance_or_new(&self, user_id: i64) -> Result<UserBalance> {
        Ok(self
            .get_json(CF_BALANCES, &user_id.to_be_bytes())?
            .unwrap_or_else(|| UserBalance::new(user_id)))
    }

    /// Snapshot of the queue entry for `order`, if it is still queued.
    pub fn queue_entry(&self, order: &OrderNumber) -> Result<Option<QueueEntry>> {
        self.get_json(CF_QUEUE, order.as_str().as_bytes())
    }
}

fn cf_handle<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily> {
    db.cf_handle(name).ok_or_else(|| {
        AccrualError::storage(std::io::Error::other(format!(
            "{name} column family not found"
        )))
    })
}

fn read_queue(db: &DB) -> Result<Vec<QueueEntry>> {
    db.iterator_cf(cf_handle(db, CF_QUEUE)?, IteratorMode::Start)
        .map(|item| {
            let (_key, value) = item?;
            serde_json::from_slice(&value).map_err(AccrualError::storage)
        })
        .collect()
}

#[async_trait]
impl QueueLeasing for RocksDbStore {
    async fn claim_oldest_unleased(&self) -> Result<Claim> {
        let _guard = self.write_lock.lock().await;
        let Some(mut entry) = self
            .queue_entries()?
            .into_iter()
            .filter(|entry| !entry.in_handling)
            .min_by_key(|entry| entry.priority())
        else {
            return Ok(Claim::Empty);
        };

        let lease = entry.lease(Utc::now());
        let mut batch = WriteBatch::default();
        self.put_json(&mut batch, CF_QUEUE, entry.order.as_str().as_bytes(), &entry)?;
        self.db.write(batch)?;
        Ok(Claim::Claimed(lease))
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut entry = match self.held_entry(lease) {
            Ok(entry) => entry,
            Err(AccrualError::LeaseLost(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        entry.last_checked_at = Utc::now();
        let mut batch = WriteBatch::default();
        self.put_json(&mut batch, CF_QUEUE, lease.order.as_str().as_bytes(), &entry)?;
        self.db.write(batch)?;
        Ok(true)
    }

    async fn release_lease(&self, lease: &Lease, reason: &DeferReason) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entry = self.held_entry(lease)?;

        entry.in_handling = false;
        let mut batch = WriteBatch::default();
        self.put_json(&mut batch, CF_QUEUE, lease.order.as_str().as_bytes(), &entry)?;
        self.db.write(batch)?;
        debug!(%lease, %reason, "lease released");
        Ok(())
    }

    async fn finalize_order(
        &self,
        lease: &Lease,
        status: TerminalStatus,
        accrual: Points,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let order = &lease.order;
        let key = order.as_str().as_bytes();
        let entry = self.held_entry(lease)?;

        let mut record = self
            .get_json(CF_ACCRUALS, key)?
            .unwrap_or_else(|| AccrualRecord::new(order.clone()));
        record.finalize(status, accrual);

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_QUEUE)?, key);
        self.put_json(&mut batch, CF_ACCRUALS, key, &record)?;
        if status == TerminalStatus::Processed {
            let mut balance = self.balance_or_new(entry.user_id)?;
            balance.credit(accrual);
            self.put_json(&mut batch, CF_BALANCES, &entry.user_id.to_be_bytes(), &balance)?;
        }
        self.db.write(batch)?;
        Ok(())
    }

    async fn reclaim_stale_leases(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| AccrualError::Config(format!("lease ttl out of range: {e}")))?;
        let _guard = self.write_lock.lock().await;

        let mut batch = WriteBatch::default();
        let mut reclaimed = 0;
        for mut entry in self.queue_entries()? {
            if entry.in_handling && entry.last_checked_at <= cutoff {
                entry.in_handling = false;
                self.put_json(&mut batch, CF_QUEUE, entry.order.as_str().as_bytes(), &entry)?;
                reclaimed += 1;
            }
        }
        self.db.write(batch)?;
        Ok(reclaimed)
    }
}

#[async_trait]
impl LoyaltyLedger for RocksDbStore {
    async fn submit_order(&self, user_id: i64, order: &OrderNumber) -> Result<Submission> {
        let mut next_seq = self.write_lock.lock().await;
        let key = order.as_str().as_bytes();
        if let Some(owner) = self.db.get_cf(self.cf(CF_ORDERS)?, key)? {
            let owner = i64::from_be_bytes(owner.as_slice().try_into().map_err(|_| {
                AccrualError::storage(std::io::Error::other("corrupt order owner"))
            })?);
            return Ok(if owner == user_id {
                Submission::AlreadyOwned
            } else {
                Submission::OwnedByAnotherUser
            });
        }

        let entry = QueueEntry::new(order.clone(), user_id, *next_seq, Utc::now());
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_ORDERS)?, key, user_id.to_be_bytes());
        self.put_json(&mut batch, CF_ACCRUALS, key, &AccrualRecord::new(order.clone()))?;
        self.put_json(&mut batch, CF_QUEUE, key, &entry)?;
        let balance = self.balance_or_new(user_id)?;
        self.put_json(&mut batch, CF_BALANCES, &user_id.to_be_bytes(), &balance)?;
        self.db.write(batch)?;
        *next_seq += 1;
        Ok(Submission::Accepted)
    }

    async fn accrual(&self, order: &OrderNumber) -> Result<Option<AccrualRecord>> {
        self.get_json(CF_ACCRUALS, order.as_str().as_bytes())
    }

    async fn balance(&self, user_id: i64) -> Result<UserBalance> {
        self.balance_or_new(user_id)
    }

    async fn balances(&self) -> Result<Vec<UserBalance>> {
        let mut all = self
            .db
            .iterator_cf(self.cf(CF_BALANCES)?, IteratorMode::Start)
            .map(|item| {
                let (_key, value) = item?;
                serde_json::from_slice::<UserBalance>(&value).map_err(AccrualError::storage)
            })
            .collect::<Result<Vec<_>>>()?;
        all.sort_by_key(|b| b.user_id);
        Ok(all)
    }

    async fn pending_orders(&self) -> Result<u64> {
        Ok(self.queue_entries()?.len() as u64)
    }
}
