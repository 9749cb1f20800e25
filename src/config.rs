use crate::error::{AccrualError, Result};
use std::time::Duration;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_EMPTY_QUEUE_BACKOFF: Duration = Duration::from_millis(100);
pub const DEFAULT_RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Tunables of the accrual polling engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the accrual service, e.g. `http://localhost:8081`.
    pub accrual_system_address: String,
    /// Number of concurrent workers.
    pub workers: usize,
    /// How long the scheduler sleeps when nothing is claimable.
    pub empty_queue_backoff: Duration,
    /// How long a worker pauses after the service answers 429.
    pub rate_limit_cooldown: Duration,
    /// Deadline of each accrual request.
    pub request_timeout: Duration,
    /// Leases older than this are considered orphaned.
    pub lease_ttl: Duration,
    /// How often orphaned leases are looked for.
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            accrual_system_address: String::new(),
            workers: DEFAULT_WORKERS,
            empty_queue_backoff: DEFAULT_EMPTY_QUEUE_BACKOFF,
            rate_limit_cooldown: DEFAULT_RATE_LIMIT_COOLDOWN,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            lease_ttl: DEFAULT_LEASE_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl EngineConfig {
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            accrual_system_address: address.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(AccrualError::Config("at least one worker is required".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(AccrualError::Config("sweep interval must be positive".into()));
        }
        // A worker renews the lease when it takes the order, so the lease must
        // then outlive one request. Leases that expire in the dispatch slot are
        // skipped by the worker.
        if self.lease_ttl <= self.rate_limit_cooldown + self.request_timeout {
            return Err(AccrualError::Config(format!(
                "lease ttl {:?} must exceed rate limit cooldown plus request timeout ({:?})",
                self.lease_ttl,
                self.rate_limit_cooldown + self.request_timeout
            )));
        }
        Ok(())
    }
}
