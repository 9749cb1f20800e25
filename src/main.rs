use accrual_engine::application::engine::AccrualEngine;
use accrual_engine::config::{self, EngineConfig};
use accrual_engine::domain::ports::{
    LoyaltyLedger, LoyaltyLedgerRef, QueueLeasing, QueueLeasingRef, Submission,
};
use accrual_engine::error::AccrualError;
use accrual_engine::infrastructure::in_memory::InMemoryStore;
use accrual_engine::interfaces::csv::balance_writer::BalanceWriter;
use accrual_engine::interfaces::csv::order_reader::OrderReader;
use accrual_engine::telemetry;
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Base URL of the accrual service
    #[arg(short = 'r', long, env = "ACCRUAL_SYSTEM_ADDRESS")]
    accrual_system_address: String,

    /// PostgreSQL connection string. Needs the `storage-postgres` feature.
    #[arg(short = 'd', long, env = "DATABASE_URI")]
    database_uri: Option<String>,

    /// Path to a RocksDB directory. Needs the `storage-rocksdb` feature.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// CSV file of `user,order` rows to submit before polling starts
    #[arg(long)]
    orders: Option<PathBuf>,

    /// Stop once no order is left in the queue
    #[arg(long)]
    drain: bool,

    #[arg(long, env = "ACCRUAL_WORKERS", default_value_t = config::DEFAULT_WORKERS)]
    workers: usize,

    #[arg(long, env = "ACCRUAL_EMPTY_QUEUE_BACKOFF_MS", default_value_t = 100)]
    empty_queue_backoff_ms: u64,

    #[arg(long, env = "ACCRUAL_RATE_LIMIT_COOLDOWN_SECS", default_value_t = 60)]
    rate_limit_cooldown_secs: u64,

    #[arg(long, env = "ACCRUAL_REQUEST_TIMEOUT_SECS", default_value_t = 5)]
    request_timeout_secs: u64,

    #[arg(long, env = "ACCRUAL_LEASE_TTL_SECS", default_value_t = 600)]
    lease_ttl_secs: u64,

    #[arg(long, env = "ACCRUAL_SWEEP_INTERVAL_SECS", default_value_t = 30)]
    sweep_interval_secs: u64,
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            accrual_system_address: self.accrual_system_address.clone(),
            workers: self.workers,
            empty_queue_backoff: Duration::from_millis(self.empty_queue_backoff_ms),
            rate_limit_cooldown: Duration::from_secs(self.rate_limit_cooldown_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            lease_ttl: Duration::from_secs(self.lease_ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }
}

type Stores = (QueueLeasingRef, LoyaltyLedgerRef);

fn shared<S: QueueLeasing + LoyaltyLedger + 'static>(store: S) -> Stores {
    let store = Arc::new(store);
    let leasing: QueueLeasingRef = store.clone();
    let ledger: LoyaltyLedgerRef = store;
    (leasing, ledger)
}

async fn open_stores(cli: &Cli) -> Result<Stores> {
    if let Some(uri) = &cli.database_uri {
        return open_postgres(uri, cli.workers).await;
    }
    if let Some(path) = &cli.db_path {
        return open_rocksdb(path);
    }
    Ok(shared(InMemoryStore::new()))
}

#[cfg(feature = "storage-postgres")]
async fn open_postgres(uri: &str, workers: usize) -> Result<Stores> {
    use accrual_engine::infrastructure::postgres::PostgresStore;

    // Every worker, the scheduler and the sweeper may hold a connection at once.
    let max_connections = u32::try_from(workers + 2).unwrap_or(u32::MAX);
    let store = PostgresStore::connect(uri, max_connections)
        .await
        .into_diagnostic()?;
    info!("using PostgreSQL storage");
    Ok(shared(store))
}

#[cfg(not(feature = "storage-postgres"))]
async fn open_postgres(_uri: &str, _workers: usize) -> Result<Stores> {
    warn!(
        "PostgreSQL storage requested via --database-uri, but the 'storage-postgres' feature is not enabled. Falling back to in-memory storage."
    );
    Ok(shared(InMemoryStore::new()))
}

#[cfg(feature = "storage-rocksdb")]
fn open_rocksdb(path: &Path) -> Result<Stores> {
    use accrual_engine::infrastructure::rocksdb::RocksDbStore;

    let store = RocksDbStore::open(path).into_diagnostic()?;
    info!(path = %path.display(), "using RocksDB storage");
    Ok(shared(store))
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_rocksdb(_path: &Path) -> Result<Stores> {
    warn!(
        "Persistent storage requested via --db-path, but the 'storage-rocksdb' feature is not enabled. Falling back to in-memory storage."
    );
    Ok(shared(InMemoryStore::new()))
}

async fn submit_orders(ledger: &dyn LoyaltyLedger, path: &Path) -> Result<()> {
    let file = File::open(path).into_diagnostic()?;
    for row in OrderReader::new(file).submissions() {
        let submission = match row {
            Ok(submission) => submission,
            Err(e) => {
                warn!(error = %e, "skipping order row");
                continue;
            }
        };
        let outcome = ledger
            .submit_order(submission.user_id, &submission.order)
            .await
            .into_diagnostic()?;
        if outcome != Submission::Accepted {
            warn!(
                order = %submission.order,
                user = submission.user_id,
                ?outcome,
                "order not queued"
            );
        }
    }
    Ok(())
}

/// Waits for Ctrl-C, the engine's first fault, or an empty queue when draining.
async fn wait_for_stop(
    engine: &mut AccrualEngine,
    ledger: &dyn LoyaltyLedger,
    drain: bool,
    poll: Duration,
) -> std::result::Result<(), AccrualError> {
    let mut ticker = tokio::time::interval(poll);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                return Ok(());
            }
            fault = engine.faulted() => {
                return match fault {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            }
            _ = ticker.tick(), if drain => {
                if ledger.pending_orders().await? == 0 {
                    info!("queue drained");
                    return Ok(());
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();

    let (leasing, ledger) = open_stores(&cli).await?;
    if let Some(path) = &cli.orders {
        submit_orders(ledger.as_ref(), path).await?;
    }

    let config = cli.engine_config();
    let poll = config.empty_queue_backoff.max(Duration::from_millis(10));
    let mut engine = AccrualEngine::start(leasing, config).into_diagnostic()?;
    let stopped = wait_for_stop(&mut engine, ledger.as_ref(), cli.drain, poll).await;
    let closed = engine.close().await;

    let balances = ledger.balances().await.into_diagnostic()?;
    let stdout = io::stdout();
    BalanceWriter::new(stdout.lock())
        .write_balances(balances)
        .into_diagnostic()?;

    stopped.into_diagnostic()?;
    closed.into_diagnostic()
}
